//! API types and schemas shared by both command line tools.

use proxmox_schema::{api, const_regex, ApiStringFormat, Schema, StringSchema};
use serde::{Deserialize, Serialize};

const_regex! {
    pub BACKUP_UUID_REGEX = r"^[0-9a-f]{8}(?:-[0-9a-f]{4}){3}-[0-9a-f]{12}$";
}

pub const BACKUP_UUID_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&BACKUP_UUID_REGEX);

pub const BACKUP_UUID_SCHEMA: Schema =
    StringSchema::new("UUID binding a backup chain to its target directory.")
        .format(&BACKUP_UUID_FORMAT)
        .schema();

pub const MONITOR_SOCKET_SCHEMA: Schema =
    StringSchema::new("Path to the QMP monitor socket of the instance.").schema();

#[api()]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Backup level.
pub enum BackupLevel {
    /// Complete content of every selected device, starts a new chain.
    Full,
    /// Delta since the last bitmap clear, extends an existing chain.
    Inc,
    /// One-off full copy with a non-persistent bitmap, no chain continuation.
    Copy,
    /// Full on a fresh target directory, incremental afterwards.
    Auto,
}

impl BackupLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupLevel::Full => "full",
            BackupLevel::Inc => "inc",
            BackupLevel::Copy => "copy",
            BackupLevel::Auto => "auto",
        }
    }
}

#[api()]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Asynchronous I/O mode for the target image blockdev.
pub enum AioMode {
    /// Thread pool based I/O.
    Threads,
    /// Native io_uring based I/O.
    IoUring,
}

impl AioMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AioMode::Threads => "threads",
            AioMode::IoUring => "io_uring",
        }
    }
}

impl Default for AioMode {
    fn default() -> Self {
        AioMode::Threads
    }
}

#[api()]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Monitor state to display with the info command.
pub enum InfoKind {
    /// Block device overview.
    Blockdev,
    /// Dirty bitmap state per device.
    Bitmaps,
}
