//! Target directory layout.
//!
//! The target root holds one `uuid` file binding the chain to the
//! directory, plus either a flat file layout or one subdirectory per
//! device. Under `--monthly` an intermediate `YYYY-MM` directory is
//! inserted; its rollover is what triggers a fresh chain under the
//! `auto` level.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use proxmox_sys::fs::{create_path, file_read_optional_string, replace_file, CreateOptions};
use regex::Regex;

use crate::blockdev::BlockDevice;

lazy_static! {
    static ref TARGET_FILE_REGEX: Regex =
        Regex::new(r"^(FULL|INC|COPY)-(\d+)-(.+?)(\.partial)?$").unwrap();
}

/// Kind tag of an on-disk backup image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Full,
    Inc,
    Copy,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "FULL",
            BackupKind::Inc => "INC",
            BackupKind::Copy => "COPY",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "FULL" => Some(BackupKind::Full),
            "INC" => Some(BackupKind::Inc),
            "COPY" => Some(BackupKind::Copy),
            _ => None,
        }
    }

    /// A chain has exactly one root; both one-off copies and fulls
    /// qualify.
    pub fn is_chain_root(&self) -> bool {
        matches!(self, BackupKind::Full | BackupKind::Copy)
    }
}

/// Parsed form of a target file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFileName {
    pub kind: BackupKind,
    pub epoch: i64,
    pub basename: String,
    pub partial: bool,
}

impl TargetFileName {
    pub fn parse(name: &str) -> Option<Self> {
        let caps = TARGET_FILE_REGEX.captures(name)?;
        Some(Self {
            kind: BackupKind::parse(&caps[1])?,
            epoch: caps[2].parse().ok()?,
            basename: caps[3].to_string(),
            partial: caps.get(4).is_some(),
        })
    }
}

/// Build the in-flight name of a target image.
pub fn partial_target_name(kind: BackupKind, epoch: i64, basename: &str) -> String {
    format!("{}-{}-{}.partial", kind.as_str(), epoch, basename)
}

/// Resolved directory layout for one backup run.
pub struct Layout {
    target: PathBuf,
    monthly: bool,
    no_subdir: bool,
}

impl Layout {
    pub fn new(target: &str, monthly: bool, no_subdir: bool) -> Self {
        Self {
            target: PathBuf::from(target),
            monthly,
            no_subdir,
        }
    }

    /// The backup root; holds the `uuid` file.
    pub fn root(&self) -> &Path {
        &self.target
    }

    /// Root of the current run, with the `YYYY-MM` component inserted
    /// under `--monthly`.
    pub fn run_root(&self, epoch: i64) -> Result<PathBuf, Error> {
        if self.monthly {
            let month = proxmox_time::strftime_local("%Y-%m", epoch)?;
            Ok(self.target.join(month))
        } else {
            Ok(self.target.to_path_buf())
        }
    }

    /// Directory a device's images land in. Named by node, falling back
    /// to the bus id for synthetic node names.
    pub fn device_dir(&self, run_root: &Path, device: &BlockDevice) -> PathBuf {
        if self.no_subdir {
            run_root.to_path_buf()
        } else {
            run_root.join(device_dir_name(device))
        }
    }

    pub fn uuid_path(&self) -> PathBuf {
        self.target.join("uuid")
    }

    /// Read the chain uuid. The file is create-once, read-many.
    pub fn read_uuid(&self) -> Result<Option<String>, Error> {
        match file_read_optional_string(self.uuid_path())? {
            Some(data) => Ok(Some(data.trim().to_string())),
            None => Ok(None),
        }
    }

    /// Create the chain uuid file. Never rewrites an existing one.
    pub fn create_uuid(&self, uuid: &str) -> Result<(), Error> {
        let path = self.uuid_path();
        if path.exists() {
            bail!("refusing to overwrite existing uuid file {:?}", path);
        }
        create_path(&self.target, None, None)?;
        replace_file(&path, uuid.as_bytes(), CreateOptions::new(), true)
            .map_err(|err| format_err!("unable to write uuid file {:?} - {}", path, err))
    }
}

pub fn device_dir_name(device: &BlockDevice) -> &str {
    if device.node.starts_with('#') && !device.device.is_empty() {
        &device.device
    } else {
        &device.node
    }
}

/// Check whether a device directory holds an unfinished backup. Any
/// `.partial` file marks the chain as broken and blocks new runs.
pub fn dir_has_partial(dir: &Path) -> Result<bool, Error> {
    if !dir.exists() {
        return Ok(false);
    }
    for entry in std::fs::read_dir(dir)
        .map_err(|err| format_err!("unable to read directory {:?} - {}", dir, err))?
    {
        let entry = entry?;
        if entry.file_name().to_string_lossy().ends_with(".partial") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Check whether a device directory already holds a full backup.
pub fn dir_has_full(dir: &Path) -> Result<bool, Error> {
    if !dir.exists() {
        return Ok(false);
    }
    for entry in std::fs::read_dir(dir)
        .map_err(|err| format_err!("unable to read directory {:?} - {}", dir, err))?
    {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("FULL-") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Name of the newest finished image in a device directory, the backing
/// file for the next incremental target.
pub fn latest_image_name(dir: &Path) -> Result<Option<String>, Error> {
    let mut newest: Option<(i64, String)> = None;
    if !dir.exists() {
        return Ok(None);
    }
    for entry in std::fs::read_dir(dir)
        .map_err(|err| format_err!("unable to read directory {:?} - {}", dir, err))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type()?.is_symlink() {
            continue;
        }
        if let Some(parsed) = TargetFileName::parse(&name) {
            if parsed.partial {
                continue;
            }
            match &newest {
                Some((epoch, _)) if *epoch >= parsed.epoch => (),
                _ => newest = Some((parsed.epoch, name)),
            }
        }
    }
    Ok(newest.map(|(_, name)| name))
}

/// Recursively check a target tree for leftover `.partial` files. Runs
/// before the monitor is contacted, any hit aborts the run.
pub fn tree_find_partial(dir: &Path) -> Result<Option<PathBuf>, Error> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)
            .map_err(|err| format_err!("unable to read directory {:?} - {}", current, err))?
        {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if entry.file_name().to_string_lossy().ends_with(".partial") {
                return Ok(Some(entry.path()));
            }
        }
    }
    Ok(None)
}

/// Drop the `.partial` suffix of a finished target image.
pub fn finalize_target(path: &Path) -> Result<PathBuf, Error> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format_err!("malformed target path {:?}", path))?;
    let finished = match name.strip_suffix(".partial") {
        Some(finished) => finished,
        None => bail!("target {:?} has no .partial suffix", path),
    };
    let new_path = path.with_file_name(finished);
    std::fs::rename(path, &new_path)
        .map_err(|err| format_err!("unable to rename {:?} - {}", path, err))?;
    Ok(new_path)
}

/// Place the timestamp-free `FULL-<basename>` alias next to a finished
/// full or copy image.
pub fn create_full_symlink(target: &Path) -> Result<(), Error> {
    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format_err!("malformed target path {:?}", target))?;
    let parsed = TargetFileName::parse(name)
        .ok_or_else(|| format_err!("unexpected target file name {:?}", name))?;
    let link = target.with_file_name(format!("FULL-{}", parsed.basename));
    if link.exists() {
        std::fs::remove_file(&link)?;
    }
    std::os::unix::fs::symlink(name, &link)
        .map_err(|err| format_err!("unable to create symlink {:?} - {}", link, err))?;
    Ok(())
}
