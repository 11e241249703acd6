use anyhow::{bail, Error};
use serde_json::{json, Value};

use proxmox_router::cli::*;
use proxmox_schema::api;

use qmpbackup::api_types::{
    AioMode, BackupLevel, InfoKind, BACKUP_UUID_SCHEMA, MONITOR_SOCKET_SCHEMA,
};
use qmpbackup::backup::{run_backup, run_cleanup, BackupOptions};
use qmpbackup::blockdev::get_block_devices;
use qmpbackup::qmp::QmpClient;
use qmpbackup::tools::required_string_param;

fn comma_list(param: &Value, name: &str) -> Vec<String> {
    param[name]
        .as_str()
        .map(|list| {
            list.split(',')
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[api(
    input: {
        properties: {
            socket: {
                schema: MONITOR_SOCKET_SCHEMA,
            },
            level: {
                type: BackupLevel,
            },
            target: {
                type: String,
                description: "Backup target directory.",
            },
            include: {
                type: String,
                description: "Comma separated list of devices to backup, all others are skipped.",
                optional: true,
            },
            exclude: {
                type: String,
                description: "Comma separated list of devices to skip.",
                optional: true,
            },
            "agent-socket": {
                type: String,
                description: "Path to the guest agent socket.",
                optional: true,
            },
            quiesce: {
                type: Boolean,
                description: "Freeze guest filesystems around the backup snapshot point.",
                optional: true,
                default: false,
            },
            monthly: {
                type: Boolean,
                description: "Insert a YYYY-MM directory, rolling over to a new chain each month.",
                optional: true,
                default: false,
            },
            "no-subdir": {
                type: Boolean,
                description: "Use a flat target layout instead of one subdirectory per device.",
                optional: true,
                default: false,
            },
            "no-timestamp": {
                type: Boolean,
                description: "Place a timestamp-free FULL-<image> symlink next to full and copy backups.",
                optional: true,
                default: false,
            },
            "no-symlink": {
                type: Boolean,
                description: "Suppress the FULL-<image> convenience symlink.",
                optional: true,
                default: false,
            },
            compress: {
                type: Boolean,
                description: "Enable compressed writes on the target images.",
                optional: true,
                default: false,
            },
            "include-raw": {
                type: Boolean,
                description: "Also backup devices with raw format images.",
                optional: true,
                default: false,
            },
            "speed-limit": {
                type: Integer,
                description: "Backup job speed limit in bytes per second, 0 means unlimited.",
                optional: true,
                minimum: 0,
                default: 0,
            },
            uuid: {
                schema: BACKUP_UUID_SCHEMA,
                optional: true,
            },
            "remove-delay": {
                type: Integer,
                description: "Seconds to wait before removing the backup graph nodes during teardown.",
                optional: true,
                minimum: 0,
                default: 0,
            },
            "blockdev-aio": {
                type: AioMode,
                optional: true,
            },
            "blockdev-disable-cache": {
                type: Boolean,
                description: "Disable host page cache on the target image blockdev.",
                optional: true,
                default: false,
            },
        }
    }
)]
/// Backup the block devices of a running instance.
async fn create_backup(param: Value) -> Result<Value, Error> {
    let socket = required_string_param(&param, "socket")?;
    let target = required_string_param(&param, "target")?;
    let level: BackupLevel = serde_json::from_value(param["level"].clone())?;
    let aio = match param.get("blockdev-aio") {
        Some(value) if !value.is_null() => serde_json::from_value(value.clone())?,
        _ => AioMode::default(),
    };

    let options = BackupOptions {
        level,
        target: target.to_string(),
        include: comma_list(&param, "include"),
        exclude: comma_list(&param, "exclude"),
        agent_socket: param["agent-socket"].as_str().map(str::to_string),
        quiesce: param["quiesce"].as_bool().unwrap_or(false),
        monthly: param["monthly"].as_bool().unwrap_or(false),
        no_subdir: param["no-subdir"].as_bool().unwrap_or(false),
        no_timestamp: param["no-timestamp"].as_bool().unwrap_or(false),
        no_symlink: param["no-symlink"].as_bool().unwrap_or(false),
        compress: param["compress"].as_bool().unwrap_or(false),
        include_raw: param["include-raw"].as_bool().unwrap_or(false),
        speed_limit: param["speed-limit"].as_u64().unwrap_or(0),
        uuid: param["uuid"].as_str().map(str::to_string),
        remove_delay: param["remove-delay"].as_u64().unwrap_or(0),
        aio,
        disable_cache: param["blockdev-disable-cache"].as_bool().unwrap_or(false),
    };

    run_backup(socket, &options).await?;

    Ok(Value::Null)
}

#[api(
    input: {
        properties: {
            socket: {
                schema: MONITOR_SOCKET_SCHEMA,
            },
            show: {
                type: InfoKind,
            },
            "output-format": {
                schema: OUTPUT_FORMAT,
                optional: true,
            },
        }
    }
)]
/// Show block device or dirty bitmap state of a running instance.
async fn show_info(param: Value) -> Result<Value, Error> {
    let socket = required_string_param(&param, "socket")?;
    let show: InfoKind = serde_json::from_value(param["show"].clone())?;
    let output_format = get_output_format(&param);

    let client = QmpClient::connect(socket).await?;

    let name = client.query_name().await?;
    let status = client.query_status().await?;
    log::info!(
        "instance: [{}], status: [{}]",
        name["name"].as_str().unwrap_or("unknown"),
        status["status"].as_str().unwrap_or("unknown")
    );

    let blockinfo = client.query_block().await?;
    let named_nodes = client.query_named_block_nodes().await?;

    let devices = get_block_devices(&blockinfo, &named_nodes, &[], &[], None, true)?;

    let result = match show {
        InfoKind::Blockdev => Value::Array(
            devices
                .iter()
                .map(|device| {
                    json!({
                        "node": device.node,
                        "device": device.device,
                        "format": device.format.as_str(),
                        "filename": device.filename,
                        "virtual-size": device.virtual_size,
                        "has-bitmap": device.has_bitmap,
                    })
                })
                .collect(),
        ),
        InfoKind::Bitmaps => Value::Array(
            devices
                .iter()
                .map(|device| {
                    json!({
                        "node": device.node,
                        "bitmaps": device
                            .bitmaps
                            .iter()
                            .map(|bitmap| {
                                json!({
                                    "name": bitmap.name,
                                    "recording": bitmap.recording,
                                    "persistent": bitmap.persistent,
                                    "granularity": bitmap.granularity,
                                    "busy": bitmap.busy,
                                })
                            })
                            .collect::<Vec<_>>(),
                    })
                })
                .collect(),
        ),
    };

    client.close();

    format_and_print_result(&result, &output_format);

    Ok(Value::Null)
}

#[api(
    input: {
        properties: {
            socket: {
                schema: MONITOR_SOCKET_SCHEMA,
            },
            "remove-bitmap": {
                type: Boolean,
                description: "Remove the dirty bitmaps previous backups left behind.",
                optional: true,
                default: false,
            },
            uuid: {
                schema: BACKUP_UUID_SCHEMA,
                optional: true,
            },
        }
    }
)]
/// Cleanup helper state of previous backups.
async fn cleanup(param: Value) -> Result<Value, Error> {
    let socket = required_string_param(&param, "socket")?;

    if !param["remove-bitmap"].as_bool().unwrap_or(false) {
        bail!("nothing to do, specify --remove-bitmap");
    }

    run_cleanup(socket, param["uuid"].as_str()).await?;

    Ok(Value::Null)
}

fn main() {
    init_cli_logger("QMPBACKUP_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert("backup", CliCommand::new(&API_METHOD_CREATE_BACKUP))
        .insert("info", CliCommand::new(&API_METHOD_SHOW_INFO))
        .insert("cleanup", CliCommand::new(&API_METHOD_CLEANUP));

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| proxmox_async::runtime::main(future)),
    );
}
