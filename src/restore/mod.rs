//! Restore engine.
//!
//! Reconstructs a usable disk image from a chain of full and incremental
//! backup files. All heavy lifting is delegated to `qemu-img`; this
//! module validates the chain, rewrites backing-file pointers and plans
//! the tool invocations for the four reconstruction modes.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use crate::image::ImageTool;

pub mod chain;

use chain::{scan_chain, Chain};

/// Options common to all restore modes.
pub struct RestoreOptions {
    pub dir: PathBuf,
    pub until: Option<String>,
    pub filter: Option<String>,
    pub dry_run: bool,
    pub skip_check: bool,
    pub rate_limit: Option<u64>,
}

impl RestoreOptions {
    fn scan(&self) -> Result<Chain, Error> {
        scan_chain(&self.dir, self.until.as_deref(), self.filter.as_deref())
    }

    /// Per-file consistency pre-check. Aborts the mode if any file is
    /// corrupt; disabled with `--skip-check`.
    fn precheck(&self, tool: &ImageTool, chain: &Chain) -> Result<(), Error> {
        if self.skip_check {
            return Ok(());
        }
        for entry in chain.entries() {
            tool.check(path_str(&entry.path)?)
                .map_err(|err| format_err!("image check failed for {:?}: {}", entry.name, err))?;
        }
        Ok(())
    }
}

fn path_str(path: &Path) -> Result<&str, Error> {
    path.to_str()
        .ok_or_else(|| format_err!("non-utf8 path {:?}", path))
}

/// Rewrite each increment's backing-file pointer so it points at its
/// predecessor. Backing names are relative, all entries share one
/// directory.
fn rebase_chain(tool: &ImageTool, chain: &Chain) -> Result<(), Error> {
    let mut predecessor = chain.root.name.clone();
    for entry in &chain.increments {
        log::debug!("\"{}\" is based on \"{}\"", entry.name, predecessor);
        tool.rebase(path_str(&entry.path)?, &predecessor)?;
        predecessor = entry.name.clone();
    }
    Ok(())
}

/// In-place rebase. Leaves all files where they are; the newest
/// increment is the bootable tip afterwards, pointed to by an `image`
/// symlink next to the chain.
pub fn rebase(options: &RestoreOptions) -> Result<(), Error> {
    let tool = ImageTool::new(options.dry_run);
    let chain = options.scan()?;
    options.precheck(&tool, &chain)?;

    rebase_chain(&tool, &chain)?;

    if options.dry_run {
        log::info!("dry run activated, not applying any changes");
        return Ok(());
    }

    let link = chain.dir.join("image");
    if link.exists() || std::fs::symlink_metadata(&link).is_ok() {
        std::fs::remove_file(&link)?;
    }
    std::os::unix::fs::symlink(&chain.tip().name, &link)
        .map_err(|err| format_err!("unable to create symlink {:?} - {}", link, err))?;
    log::info!("image symlink points to [{}]", chain.tip().name);

    Ok(())
}

/// Collapse the chain into its base image: after rebasing, commit each
/// increment into its predecessor, newest first, and remove it.
pub fn commit(options: &RestoreOptions) -> Result<(), Error> {
    let tool = ImageTool::new(options.dry_run);
    let chain = options.scan()?;
    if chain.increments.is_empty() {
        bail!("no incremental images found, nothing to commit");
    }
    options.precheck(&tool, &chain)?;

    rebase_chain(&tool, &chain)?;

    for entry in chain.increments.iter().rev() {
        tool.commit(path_str(&entry.path)?, options.rate_limit)?;
        if !options.dry_run {
            std::fs::remove_file(&entry.path)?;
        }
    }

    log::info!("rollback complete, [{}] is the restored image", chain.root.name);

    Ok(())
}

/// Non-destructive variant of commit: stage copies of the whole chain
/// next to `targetfile` and collapse the copies, leaving every original
/// file untouched.
pub fn merge(options: &RestoreOptions, targetfile: &Path) -> Result<(), Error> {
    let tool = ImageTool::new(options.dry_run);
    let chain = options.scan()?;
    options.precheck(&tool, &chain)?;

    if targetfile.exists() {
        bail!("target file {:?} already exists", targetfile);
    }
    let target_dir = targetfile
        .parent()
        .ok_or_else(|| format_err!("target file {:?} has no parent directory", targetfile))?;
    if !options.dry_run {
        proxmox_sys::fs::create_path(target_dir, None, None)?;
    }

    let copy = |from: &Path, to: &Path| -> Result<(), Error> {
        log::info!("cp {:?} {:?}", from, to);
        if options.dry_run {
            return Ok(());
        }
        if to.exists() {
            bail!("staging file {:?} already exists", to);
        }
        std::fs::copy(from, to)
            .map_err(|err| format_err!("unable to copy {:?} to {:?} - {}", from, to, err))?;
        Ok(())
    };

    copy(&chain.root.path, targetfile)?;

    let mut staged: Vec<PathBuf> = Vec::new();
    for entry in &chain.increments {
        let stage = target_dir.join(&entry.name);
        copy(&entry.path, &stage)?;
        staged.push(stage);
    }

    // rewire the staged copies into a chain rooted at the target file
    let target_name = targetfile
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format_err!("malformed target file path {:?}", targetfile))?;
    let mut predecessor = target_name.to_string();
    for (entry, stage) in chain.increments.iter().zip(staged.iter()) {
        tool.rebase(path_str(stage)?, &predecessor)?;
        predecessor = entry.name.clone();
    }

    for stage in staged.iter().rev() {
        tool.commit(path_str(stage)?, options.rate_limit)?;
        if !options.dry_run {
            std::fs::remove_file(stage)?;
        }
    }

    log::info!("merged backup chain into {:?}", targetfile);

    Ok(())
}

/// Like commit, but every increment remains reachable as an internal
/// qcow2 snapshot of the base image: `FULL-BACKUP` holds the pristine
/// full, each increment's snapshot holds the state up to that increment.
pub fn snapshotrebase(options: &RestoreOptions) -> Result<(), Error> {
    let tool = ImageTool::new(options.dry_run);
    let chain = options.scan()?;
    if chain.increments.is_empty() {
        bail!("no incremental images found, nothing to commit");
    }
    options.precheck(&tool, &chain)?;

    rebase_chain(&tool, &chain)?;

    let root = path_str(&chain.root.path)?.to_string();
    tool.snapshot_create(&root, "FULL-BACKUP")?;

    for (pos, entry) in chain.increments.iter().enumerate() {
        if pos > 0 {
            // the previous increment was committed and removed, point
            // this one directly at the base image
            tool.rebase(path_str(&entry.path)?, &chain.root.name)?;
        }
        tool.commit(path_str(&entry.path)?, options.rate_limit)?;
        if !options.dry_run {
            std::fs::remove_file(&entry.path)?;
        }
        tool.snapshot_create(&root, &entry.name)?;
    }

    log::info!(
        "rollback complete, [{}] holds one snapshot per increment",
        chain.root.name
    );

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn testdir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("qmpbackup-restore-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn options(dir: &Path) -> RestoreOptions {
        RestoreOptions {
            dir: dir.to_path_buf(),
            until: None,
            filter: None,
            dry_run: true,
            skip_check: true,
            rate_limit: None,
        }
    }

    fn populate(dir: &Path) {
        std::fs::write(dir.join("FULL-1690000000-disk1.qcow2"), b"full").unwrap();
        std::fs::write(dir.join("INC-1690000100-disk1.qcow2"), b"inc1").unwrap();
        std::fs::write(dir.join("INC-1690000200-disk1.qcow2"), b"inc2").unwrap();
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let dir = testdir("dryrun");
        populate(&dir);

        rebase(&options(&dir)).unwrap();
        commit(&options(&dir)).unwrap();
        snapshotrebase(&options(&dir)).unwrap();

        let mut names: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "FULL-1690000000-disk1.qcow2",
                "INC-1690000100-disk1.qcow2",
                "INC-1690000200-disk1.qcow2",
            ]
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_blocks_all_modes() {
        let dir = testdir("blocked");
        populate(&dir);
        std::fs::write(dir.join("INC-1690000300-disk1.qcow2.partial"), b"x").unwrap();

        assert!(rebase(&options(&dir)).is_err());
        assert!(commit(&options(&dir)).is_err());
        assert!(merge(&options(&dir), Path::new("/tmp/out.qcow2")).is_err());
        assert!(snapshotrebase(&options(&dir)).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_commit_needs_increments() {
        let dir = testdir("noinc");
        std::fs::write(dir.join("FULL-1690000000-disk1.qcow2"), b"full").unwrap();

        let err = commit(&options(&dir)).unwrap_err();
        assert!(err.to_string().contains("nothing to commit"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_merge_dry_run_leaves_sources() {
        let dir = testdir("merge");
        populate(&dir);
        let out = testdir("merge-out").join("out.qcow2");

        merge(&options(&dir), &out).unwrap();
        assert!(!out.exists());
        assert_eq!(std::fs::read(dir.join("FULL-1690000000-disk1.qcow2")).unwrap(), b"full");

        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::remove_dir_all(out.parent().unwrap());
    }

    #[test]
    fn test_merge_refuses_existing_target() {
        let dir = testdir("merge-exists");
        populate(&dir);
        let out_dir = testdir("merge-exists-out");
        let out = out_dir.join("out.qcow2");
        std::fs::write(&out, b"old").unwrap();

        let err = merge(&options(&dir), &out).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::remove_dir_all(&out_dir);
    }
}
