//! Block device discovery and selection.
//!
//! Turns the raw `query-block` payload into the filtered, ordered set of
//! backup-eligible devices with their derived attributes.

use anyhow::{bail, Error};
use serde_json::Value;

/// Reserved prefix for all nodes, jobs and bitmaps created by this tool.
/// Devices whose node name already carries it are internal helper nodes
/// from a previous or concurrent run and never eligible for backup.
pub const NODE_PREFIX: &str = "qmpbackup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageFormat {
    Qcow2,
    Raw,
    Other(String),
}

impl ImageFormat {
    pub fn parse(driver: &str) -> Self {
        match driver {
            "qcow2" => ImageFormat::Qcow2,
            "raw" => ImageFormat::Raw,
            other => ImageFormat::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Raw => "raw",
            ImageFormat::Other(other) => other,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, ImageFormat::Raw)
    }
}

/// One dirty bitmap as reported by the monitor.
#[derive(Debug, Clone)]
pub struct BlockDirtyBitmap {
    pub name: String,
    pub recording: bool,
    pub persistent: bool,
    pub granularity: u64,
    pub busy: bool,
}

/// One block node considered for backup.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub node: String,
    /// Bus id, may be empty for blockdev-only configurations.
    pub device: String,
    pub qdev: Option<String>,
    pub format: ImageFormat,
    pub filename: String,
    pub virtual_size: u64,
    pub has_bitmap: bool,
    /// Filled in by the orchestrator once the target directory is known.
    pub has_full_backup: bool,
    pub bitmaps: Vec<BlockDirtyBitmap>,
    /// Protocol node feeding the format node, needed to splice the
    /// copy-before-write filter in and out again.
    pub file_node: Option<String>,
}

impl BlockDevice {
    /// Name of the persistent chain bitmap for this device under `uuid`.
    pub fn bitmap_name(&self, uuid: &str) -> String {
        format!("{}-{}-{}", NODE_PREFIX, self.node, uuid)
    }

    /// Name of the non-persistent bitmap used by copy level backups.
    pub fn copy_bitmap_name(&self) -> String {
        format!("{}-copy-{}", NODE_PREFIX, self.node)
    }
}

fn parse_bitmaps(device: &Value, inserted: &Value) -> Vec<BlockDirtyBitmap> {
    // newer monitors report bitmaps on the device entry, older ones on
    // the inserted object
    let raw = device
        .get("dirty-bitmaps")
        .or_else(|| inserted.get("dirty-bitmaps"))
        .and_then(Value::as_array);

    let mut bitmaps = Vec::new();
    if let Some(raw) = raw {
        for bitmap in raw {
            let name = match bitmap["name"].as_str() {
                Some(name) => name.to_string(),
                None => continue,
            };
            bitmaps.push(BlockDirtyBitmap {
                name,
                recording: bitmap["recording"].as_bool().unwrap_or(false),
                persistent: bitmap["persistent"].as_bool().unwrap_or(false),
                granularity: bitmap["granularity"].as_u64().unwrap_or(0),
                busy: bitmap["busy"].as_bool().unwrap_or(false),
            });
        }
    }
    bitmaps
}

/// Decode a `json:`-encoded filename. RBD backed devices use the embedded
/// image name, otherwise the nested filename property is used.
fn decode_json_filename(device_id: &str, filename: &str) -> Option<String> {
    let encoded: Value = match serde_json::from_str(&filename[5..]) {
        Ok(encoded) => encoded,
        Err(err) => {
            log::warn!(
                "unable to decode filename json for device [{}]: {}",
                device_id,
                err
            );
            return None;
        }
    };

    if encoded["file"]["driver"] == "rbd" {
        log::info!("ceph device found, using image name");
        return encoded["file"]["image"].as_str().map(str::to_string);
    }

    match encoded["file"]["next"]["filename"].as_str() {
        Some(filename) => Some(filename.to_string()),
        None => {
            log::warn!(
                "json encoded setting found but no filename property set for device: [{}]",
                device_id
            );
            None
        }
    }
}

/// Find the protocol node feeding the format node `filename` belongs to.
fn resolve_file_node(named_nodes: &Value, filename: &str) -> Option<String> {
    named_nodes.as_array().and_then(|nodes| {
        nodes.iter().find_map(|entry| {
            if entry["drv"] == "file" && entry["file"] == filename {
                entry["node-name"].as_str().map(str::to_string)
            } else {
                None
            }
        })
    })
}

/// Turn the raw `query-block` output into the ordered list of
/// backup-eligible devices.
///
/// `include` and `exclude` are mutually exclusive (enforced by the CLI
/// before the monitor is contacted); names match the bus id first, then
/// the node name. Raw devices are only eligible with `include_raw`.
pub fn get_block_devices(
    blockinfo: &Value,
    named_nodes: &Value,
    include: &[String],
    exclude: &[String],
    uuid: Option<&str>,
    include_raw: bool,
) -> Result<Vec<BlockDevice>, Error> {
    let entries = match blockinfo.as_array() {
        Some(entries) => entries,
        None => bail!("malformed query-block reply: expected array"),
    };

    let mut devices = Vec::new();
    let mut matched_includes = Vec::new();

    for entry in entries {
        let device_id = entry["device"].as_str().unwrap_or("").to_string();

        let inserted = match entry.get("inserted") {
            Some(inserted) => inserted,
            None => {
                log::debug!("ignoring non-inserted device: [{}]", device_id);
                continue;
            }
        };

        if inserted["ro"].as_bool().unwrap_or(false) {
            log::debug!("ignoring read-only device: [{}]", device_id);
            continue;
        }

        // pflash holds firmware variables, never part of a backup
        if device_id.starts_with("pflash") {
            log::debug!("ignoring firmware device: [{}]", device_id);
            continue;
        }

        let node = match inserted["node-name"].as_str() {
            Some(node) => node.to_string(),
            None => {
                log::debug!("ignoring device without node name: [{}]", device_id);
                continue;
            }
        };

        if node.starts_with(NODE_PREFIX) {
            log::debug!("ignoring internal helper node: [{}]", node);
            continue;
        }

        // a device running from an overlay is backed up via its backing
        // image, the overlay only holds transient state
        let image = &inserted["image"];
        let (mut filename, format) = match image.get("backing-image") {
            Some(backing) => (
                backing["filename"].as_str().unwrap_or("").to_string(),
                ImageFormat::parse(backing["format"].as_str().unwrap_or("")),
            ),
            None => (
                image["filename"].as_str().unwrap_or("").to_string(),
                ImageFormat::parse(image["format"].as_str().unwrap_or("")),
            ),
        };

        if filename.starts_with("json:") {
            match decode_json_filename(&device_id, &filename) {
                Some(decoded) => filename = decoded,
                None => continue,
            }
        }

        if !include.is_empty() {
            if include.iter().any(|name| *name == device_id || *name == node) {
                matched_includes.push(if include.contains(&device_id) {
                    device_id.clone()
                } else {
                    node.clone()
                });
            } else {
                log::info!(
                    "device not in included disk list, ignoring: [{}:{}]",
                    device_id,
                    filename
                );
                continue;
            }
        } else if exclude.iter().any(|name| *name == device_id || *name == node) {
            log::info!("excluding device from backup: [{}:{}]", device_id, filename);
            continue;
        }

        if format.is_raw() && !include_raw {
            log::warn!(
                "excluding device with raw format from backup: [{}:{}]",
                device_id,
                filename
            );
            continue;
        }

        let bitmaps = parse_bitmaps(entry, inserted);
        let has_bitmap = match uuid {
            Some(uuid) => {
                let wanted = format!("{}-{}-{}", NODE_PREFIX, node, uuid);
                bitmaps.iter().any(|bitmap| bitmap.name == wanted)
            }
            None => bitmaps
                .iter()
                .any(|bitmap| bitmap.name.starts_with(NODE_PREFIX)),
        };

        let file_node = resolve_file_node(named_nodes, &filename);

        devices.push(BlockDevice {
            node,
            device: device_id,
            qdev: entry["qdev"].as_str().map(str::to_string),
            format,
            filename,
            virtual_size: image["virtual-size"].as_u64().unwrap_or(0),
            has_bitmap,
            has_full_backup: false,
            bitmaps,
            file_node,
        });
    }

    for name in include {
        if !matched_includes.contains(name) {
            bail!("device specified by include does not exist: [{}]", name);
        }
    }

    if devices.is_empty() {
        bail!("no device eligible for backup");
    }

    devices.sort_by(|a, b| a.node.cmp(&b.node));

    Ok(devices)
}
