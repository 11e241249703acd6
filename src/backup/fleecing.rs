//! Image fleecing topology.
//!
//! For every device under backup the orchestrator builds this graph in
//! the hypervisor:
//!
//! ```text
//!   guest ──► [CBW filter] ──► original protocol node
//!                     │
//!                     └──► fleece (qcow2, temporary)
//!                                  │
//!                                  └──► snapshot-access ──► [backup job source]
//!                                                                  │
//!                                                                  ▼
//!                                                             target image
//! ```
//!
//! Every intermediate node carries a deterministic name under the
//! reserved `qmpbackup` prefix. The splice that redirects in-flight
//! guest I/O through the filter is a `blockdev-reopen` of the device's
//! format node; the same reopen restores the original graph during
//! teardown.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use serde_json::{json, Value};

use crate::blockdev::{BlockDevice, NODE_PREFIX};
use crate::image::{ImageTool, QcowOptions};
use crate::qmp::QmpClient;

pub fn fleece_node_name(node: &str) -> String {
    format!("{}-fleece-{}", NODE_PREFIX, node)
}

pub fn cbw_node_name(node: &str) -> String {
    format!("{}-cbw-{}", NODE_PREFIX, node)
}

pub fn snap_node_name(node: &str) -> String {
    format!("{}-snap-{}", NODE_PREFIX, node)
}

pub fn target_node_name(node: &str) -> String {
    format!("{}-{}", NODE_PREFIX, node)
}

/// Per-device record of the constructed graph. Tracks how far the build
/// got so teardown only undoes what actually exists.
pub struct Topology {
    pub node: String,
    pub format: String,
    pub file_node: String,
    pub fleece_node: String,
    pub cbw_node: String,
    pub snap_node: String,
    pub target_node: String,
    pub job_id: String,
    pub fleece_path: PathBuf,
    pub target_path: PathBuf,
    pub fleece_added: bool,
    pub cbw_added: bool,
    pub spliced: bool,
    pub snap_added: bool,
    pub target_added: bool,
}

impl Topology {
    pub fn new(device: &BlockDevice, fleece_path: PathBuf, target_path: PathBuf) -> Result<Self, Error> {
        let file_node = match &device.file_node {
            Some(file_node) => file_node.clone(),
            None => bail!(
                "unable to determine protocol node for device [{}], cannot insert filter",
                device.node
            ),
        };
        Ok(Self {
            node: device.node.clone(),
            format: device.format.as_str().to_string(),
            file_node,
            fleece_node: fleece_node_name(&device.node),
            cbw_node: cbw_node_name(&device.node),
            snap_node: snap_node_name(&device.node),
            target_node: target_node_name(&device.node),
            job_id: target_node_name(&device.node),
            fleece_path,
            target_path,
            fleece_added: false,
            cbw_added: false,
            spliced: false,
            snap_added: false,
            target_added: false,
        })
    }

    /// Build the graph for one device. The fleece and target image files
    /// must exist already.
    ///
    /// `cbw_bitmap` restricts copy-before-write to clusters dirty in the
    /// chain bitmap; only set for incremental backups.
    pub async fn build(
        &mut self,
        client: &QmpClient,
        cbw_bitmap: Option<&str>,
        aio: &str,
        disable_cache: bool,
    ) -> Result<(), Error> {
        client
            .blockdev_add(json!({
                "driver": "qcow2",
                "node-name": self.fleece_node,
                "file": { "driver": "file", "filename": self.fleece_path },
            }))
            .await?;
        self.fleece_added = true;

        let mut cbw = json!({
            "driver": "copy-before-write",
            "node-name": self.cbw_node,
            "file": self.file_node,
            "target": self.fleece_node,
            "on-cbw-error": "break-snapshot",
            "cbw-timeout": 45,
        });
        if let Some(bitmap) = cbw_bitmap {
            cbw["bitmap"] = json!({ "node": self.node, "name": bitmap });
        }
        client.blockdev_add(cbw).await?;
        self.cbw_added = true;

        // redirect in-flight guest I/O through the filter
        client
            .blockdev_reopen(vec![json!({
                "driver": self.format,
                "node-name": self.node,
                "file": self.cbw_node,
            })])
            .await?;
        self.spliced = true;

        client
            .blockdev_add(json!({
                "driver": "snapshot-access",
                "node-name": self.snap_node,
                "file": self.cbw_node,
            }))
            .await?;
        self.snap_added = true;

        let mut target_file = json!({
            "driver": "file",
            "filename": self.target_path,
            "aio": aio,
        });
        if disable_cache {
            target_file["cache"] = json!({ "direct": true });
        }
        client
            .blockdev_add(json!({
                "driver": "qcow2",
                "node-name": self.target_node,
                "file": target_file,
            }))
            .await?;
        self.target_added = true;

        Ok(())
    }

    /// Remove the snapshot-access node (teardown step 2).
    pub async fn remove_snap(&mut self, client: &QmpClient) {
        if !self.snap_added {
            return;
        }
        if let Err(err) = client.blockdev_del(&self.snap_node).await {
            log::warn!("unable to remove snapshot node [{}]: {}", self.snap_node, err);
        }
        self.snap_added = false;
    }

    /// Undo the splice, restoring the original top node (teardown step 3).
    pub async fn unsplice(&mut self, client: &QmpClient) {
        if !self.spliced {
            return;
        }
        let result = client
            .blockdev_reopen(vec![json!({
                "driver": self.format,
                "node-name": self.node,
                "file": self.file_node,
            })])
            .await;
        if let Err(err) = result {
            log::warn!("unable to restore top node for [{}]: {}", self.node, err);
        }
        self.spliced = false;
    }

    /// Remove the copy-before-write filter (teardown step 4).
    pub async fn remove_cbw(&mut self, client: &QmpClient) {
        if !self.cbw_added {
            return;
        }
        if let Err(err) = client.blockdev_del(&self.cbw_node).await {
            log::warn!("unable to remove cbw filter [{}]: {}", self.cbw_node, err);
        }
        self.cbw_added = false;
    }

    /// Remove the target image blockdev (teardown step 5).
    pub async fn remove_target(&mut self, client: &QmpClient) {
        if !self.target_added {
            return;
        }
        if let Err(err) = client.blockdev_del(&self.target_node).await {
            log::warn!("unable to remove target node [{}]: {}", self.target_node, err);
        }
        self.target_added = false;
    }

    /// Remove the fleece blockdev and unlink its file (teardown step 6).
    /// The fleece is temporary on every exit path, success included.
    pub async fn remove_fleece(&mut self, client: &QmpClient) {
        if self.fleece_added {
            if let Err(err) = client.blockdev_del(&self.fleece_node).await {
                log::warn!("unable to remove fleece node [{}]: {}", self.fleece_node, err);
            }
            self.fleece_added = false;
        }
        if self.fleece_path.exists() {
            if let Err(err) = std::fs::remove_file(&self.fleece_path) {
                log::warn!("unable to unlink fleece image {:?}: {}", self.fleece_path, err);
            }
        }
    }
}

/// Create the temporary fleece image next to the target image.
pub fn create_fleece_image(
    tool: &ImageTool,
    device: &BlockDevice,
    device_dir: &Path,
    options: &QcowOptions,
) -> Result<PathBuf, Error> {
    let path = device_dir.join(format!("{}-fleece-{}.qcow2", NODE_PREFIX, device.node));
    if path.exists() {
        bail!("fleece image {:?} already exists, previous run left debris", path);
    }
    let filename = path
        .to_str()
        .ok_or_else(|| format_err!("non-utf8 fleece path {:?}", path))?;
    log::info!(
        "create fleece image: [{}], virtual size: [{}]",
        filename,
        device.virtual_size
    );
    tool.create(filename, "qcow2", device.virtual_size, None, options)?;
    Ok(path)
}

/// Transaction actions starting one backup job, translated from the
/// level's attribute table.
pub fn backup_job_action(
    topology: &Topology,
    sync: &str,
    bitmap: Option<&str>,
    speed: u64,
    compress: bool,
) -> Value {
    let mut args = json!({
        "device": topology.snap_node,
        "target": topology.target_node,
        "job-id": topology.job_id,
        "sync": sync,
        "speed": speed,
        "auto-finalize": false,
    });
    if compress {
        args["compress"] = json!(true);
    }
    if let Some(bitmap) = bitmap {
        args["bitmap"] = json!(bitmap);
        if sync == "incremental" {
            args["bitmap-mode"] = json!("on-success");
        }
    }
    crate::qmp::commands::transaction_backup(args)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blockdev::ImageFormat;

    fn device() -> BlockDevice {
        BlockDevice {
            node: "disk1".to_string(),
            device: "drive-virtio0".to_string(),
            qdev: None,
            format: ImageFormat::Qcow2,
            filename: "/images/disk1.qcow2".to_string(),
            virtual_size: 1024,
            has_bitmap: false,
            has_full_backup: false,
            bitmaps: Vec::new(),
            file_node: Some("#block113".to_string()),
        }
    }

    #[test]
    fn test_node_names_carry_prefix() {
        let topology = Topology::new(
            &device(),
            PathBuf::from("/t/b/disk1/fleece.qcow2"),
            PathBuf::from("/t/b/disk1/FULL-1-disk1.qcow2.partial"),
        )
        .unwrap();
        assert_eq!(topology.fleece_node, "qmpbackup-fleece-disk1");
        assert_eq!(topology.cbw_node, "qmpbackup-cbw-disk1");
        assert_eq!(topology.snap_node, "qmpbackup-snap-disk1");
        assert_eq!(topology.target_node, "qmpbackup-disk1");
        assert_eq!(topology.job_id, "qmpbackup-disk1");
    }

    #[test]
    fn test_missing_file_node_is_fatal() {
        let mut dev = device();
        dev.file_node = None;
        assert!(Topology::new(&dev, PathBuf::new(), PathBuf::new()).is_err());
    }

    #[test]
    fn test_backup_job_action_shapes() {
        let topology = Topology::new(
            &device(),
            PathBuf::from("/t/fleece.qcow2"),
            PathBuf::from("/t/target.qcow2"),
        )
        .unwrap();

        let action = backup_job_action(&topology, "full", None, 0, false);
        assert_eq!(action["type"], "blockdev-backup");
        assert_eq!(action["data"]["device"], "qmpbackup-snap-disk1");
        assert_eq!(action["data"]["target"], "qmpbackup-disk1");
        assert_eq!(action["data"]["sync"], "full");
        assert_eq!(action["data"]["auto-finalize"], false);
        assert!(action["data"].get("bitmap").is_none());
        assert!(action["data"].get("compress").is_none());

        let action = backup_job_action(
            &topology,
            "incremental",
            Some("qmpbackup-disk1-abc"),
            1048576,
            true,
        );
        assert_eq!(action["data"]["sync"], "incremental");
        assert_eq!(action["data"]["bitmap"], "qmpbackup-disk1-abc");
        assert_eq!(action["data"]["bitmap-mode"], "on-success");
        assert_eq!(action["data"]["speed"], 1048576);
        assert_eq!(action["data"]["compress"], true);
    }
}
