//! Backup chain discovery and validation.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use crate::layout::{BackupKind, TargetFileName};

/// One image file participating in a chain.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub path: PathBuf,
    pub name: String,
    pub kind: BackupKind,
    pub epoch: i64,
    pub basename: String,
}

/// A validated chain: one root (FULL or COPY) plus its ordered
/// increments.
#[derive(Debug)]
pub struct Chain {
    pub dir: PathBuf,
    pub root: ChainEntry,
    pub increments: Vec<ChainEntry>,
}

impl Chain {
    /// The bootable tip: the newest increment, or the root itself.
    pub fn tip(&self) -> &ChainEntry {
        self.increments.last().unwrap_or(&self.root)
    }

    /// Root plus increments in backing order.
    pub fn entries(&self) -> impl Iterator<Item = &ChainEntry> {
        std::iter::once(&self.root).chain(self.increments.iter())
    }
}

/// Scan a directory assumed to hold one device's chain.
///
/// Any `.partial` file marks the chain as broken and refuses all
/// operations, regardless of `filter`. With `filter` set, only matching
/// entries participate and the continuity requirement is relaxed to the
/// remaining entries forming a valid chain rooted at the single FULL.
pub fn scan_chain(dir: &Path, until: Option<&str>, filter: Option<&str>) -> Result<Chain, Error> {
    let mut entries = Vec::new();
    let mut names = Vec::new();

    let read_dir = std::fs::read_dir(dir)
        .map_err(|err| format_err!("unable to read backup directory {:?} - {}", dir, err))?;

    for entry in read_dir {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();

        if name.ends_with(".partial") {
            bail!(
                "partial backup file found in {:?}, backup chain might be broken; \
                 consider removing {:?} before attempting to restore",
                dir,
                name
            );
        }

        // uuid file, saved image configs and symlinks do not participate
        let parsed = match TargetFileName::parse(&name) {
            Some(parsed) => parsed,
            None => continue,
        };
        if entry.file_type()?.is_symlink() {
            continue;
        }

        if let Some(filter) = filter {
            if !name.contains(filter) {
                continue;
            }
        }

        names.push(name.clone());
        entries.push(ChainEntry {
            path: entry.path(),
            name,
            kind: parsed.kind,
            epoch: parsed.epoch,
            basename: parsed.basename,
        });
    }

    if entries.is_empty() {
        bail!("no image files found in {:?}", dir);
    }

    let mut roots: Vec<ChainEntry> = Vec::new();
    let mut increments: Vec<ChainEntry> = Vec::new();
    for entry in entries {
        if entry.kind.is_chain_root() {
            roots.push(entry);
        } else {
            increments.push(entry);
        }
    }

    let root = match roots.len() {
        0 => bail!("no FULL base image found in {:?}", dir),
        1 => roots.remove(0),
        n => bail!(
            "{} FULL base images found in {:?}, unable to determine chain",
            n,
            dir
        ),
    };

    increments.sort_by_key(|entry| entry.epoch);

    if filter.is_none() {
        for entry in &increments {
            if entry.basename != root.basename {
                bail!(
                    "increment {:?} does not belong to base image {:?}",
                    entry.name,
                    root.name
                );
            }
        }
    }

    for entry in &increments {
        if entry.epoch < root.epoch {
            bail!(
                "increment {:?} is older than base image {:?}",
                entry.name,
                root.name
            );
        }
    }

    let mut chain = Chain {
        dir: dir.to_path_buf(),
        root,
        increments,
    };

    if let Some(until) = until {
        if !names.iter().any(|name| name == until) {
            bail!(
                "image file specified by --until option [{}] does not exist in backup directory",
                until
            );
        }
        if chain.root.name != until {
            let position = chain
                .increments
                .iter()
                .position(|entry| entry.name == until)
                .ok_or_else(|| format_err!("--until option [{}] matches no chain entry", until))?;
            chain.increments.truncate(position + 1);
        } else {
            chain.increments.clear();
        }
    }

    Ok(chain)
}

#[cfg(test)]
mod test {
    use super::*;

    fn testdir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("qmpbackup-chain-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"img").unwrap();
    }

    #[test]
    fn test_valid_chain() {
        let dir = testdir("valid");
        touch(&dir, "FULL-1690000000-disk1.qcow2");
        touch(&dir, "INC-1690000100-disk1.qcow2");
        touch(&dir, "INC-1690000050-disk1.qcow2");
        touch(&dir, "uuid");
        touch(&dir, "disk1.config");

        let chain = scan_chain(&dir, None, None).unwrap();
        assert_eq!(chain.root.name, "FULL-1690000000-disk1.qcow2");
        // epoch ascending, regardless of directory order
        assert_eq!(chain.increments[0].name, "INC-1690000050-disk1.qcow2");
        assert_eq!(chain.increments[1].name, "INC-1690000100-disk1.qcow2");
        assert_eq!(chain.tip().name, "INC-1690000100-disk1.qcow2");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_refuses() {
        let dir = testdir("partial");
        touch(&dir, "FULL-1690000000-disk1.qcow2");
        touch(&dir, "INC-1690000100-disk1.qcow2.partial");

        let err = scan_chain(&dir, None, None).unwrap_err();
        assert!(err.to_string().contains("partial"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_root_count() {
        let dir = testdir("roots");
        touch(&dir, "INC-1690000100-disk1.qcow2");
        let err = scan_chain(&dir, None, None).unwrap_err();
        assert!(err.to_string().contains("no FULL base image"));

        touch(&dir, "FULL-1690000000-disk1.qcow2");
        touch(&dir, "FULL-1690000500-disk1.qcow2");
        let err = scan_chain(&dir, None, None).unwrap_err();
        assert!(err.to_string().contains("2 FULL base images"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_basename_continuity() {
        let dir = testdir("basename");
        touch(&dir, "FULL-1690000000-disk1.qcow2");
        touch(&dir, "INC-1690000100-disk2.qcow2");

        let err = scan_chain(&dir, None, None).unwrap_err();
        assert!(err.to_string().contains("does not belong"));

        // a filter relaxes continuity to the remaining entries
        let chain = scan_chain(&dir, None, Some("disk1")).unwrap();
        assert!(chain.increments.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_until_truncation() {
        let dir = testdir("until");
        touch(&dir, "FULL-1690000000-disk1.qcow2");
        touch(&dir, "INC-1690000100-disk1.qcow2");
        touch(&dir, "INC-1690000200-disk1.qcow2");
        touch(&dir, "INC-1690000300-disk1.qcow2");

        let chain = scan_chain(&dir, Some("INC-1690000200-disk1.qcow2"), None).unwrap();
        assert_eq!(chain.increments.len(), 2);
        assert_eq!(chain.tip().name, "INC-1690000200-disk1.qcow2");

        let err = scan_chain(&dir, Some("INC-9999999999-disk1.qcow2"), None).unwrap_err();
        assert!(err.to_string().contains("--until"));

        let chain = scan_chain(&dir, Some("FULL-1690000000-disk1.qcow2"), None).unwrap();
        assert!(chain.increments.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_copy_as_chain_root() {
        let dir = testdir("copy");
        touch(&dir, "COPY-1690000000-disk1.qcow2");
        let chain = scan_chain(&dir, None, None).unwrap();
        assert_eq!(chain.root.kind, BackupKind::Copy);
        assert_eq!(chain.tip().name, "COPY-1690000000-disk1.qcow2");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
