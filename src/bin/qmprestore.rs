use std::path::PathBuf;

use anyhow::Error;
use serde_json::Value;

use proxmox_router::cli::*;
use proxmox_schema::api;

use qmpbackup::restore::{self, RestoreOptions};
use qmpbackup::tools::required_string_param;

fn restore_options(param: &Value) -> Result<RestoreOptions, Error> {
    Ok(RestoreOptions {
        dir: PathBuf::from(required_string_param(param, "dir")?),
        until: param["until"].as_str().map(str::to_string),
        filter: param["filter"].as_str().map(str::to_string),
        dry_run: param["dry-run"].as_bool().unwrap_or(false),
        skip_check: param["skip-check"].as_bool().unwrap_or(false),
        rate_limit: param["rate-limit"].as_u64(),
    })
}

#[api(
    input: {
        properties: {
            dir: {
                type: String,
                description: "Directory holding one device's backup chain.",
            },
            until: {
                type: String,
                description: "Truncate the chain after this file (inclusive).",
                optional: true,
            },
            filter: {
                type: String,
                description: "Only chain entries whose name contains this string participate.",
                optional: true,
            },
            "dry-run": {
                type: Boolean,
                description: "Print the tool invocations without applying any change.",
                optional: true,
                default: false,
            },
            "rate-limit": {
                type: Integer,
                description: "Commit rate limit in bytes per second.",
                optional: true,
                minimum: 0,
            },
            "skip-check": {
                type: Boolean,
                description: "Skip the per-file consistency check.",
                optional: true,
                default: false,
            },
        }
    }
)]
/// Rewrite the backing pointers so the chain is bootable in place.
fn rebase(param: Value) -> Result<Value, Error> {
    restore::rebase(&restore_options(&param)?)?;
    Ok(Value::Null)
}

#[api(
    input: {
        properties: {
            dir: {
                type: String,
                description: "Directory holding one device's backup chain.",
            },
            until: {
                type: String,
                description: "Truncate the chain after this file (inclusive).",
                optional: true,
            },
            filter: {
                type: String,
                description: "Only chain entries whose name contains this string participate.",
                optional: true,
            },
            "dry-run": {
                type: Boolean,
                description: "Print the tool invocations without applying any change.",
                optional: true,
                default: false,
            },
            "rate-limit": {
                type: Integer,
                description: "Commit rate limit in bytes per second.",
                optional: true,
                minimum: 0,
            },
            "skip-check": {
                type: Boolean,
                description: "Skip the per-file consistency check.",
                optional: true,
                default: false,
            },
        }
    }
)]
/// Collapse the chain into its base image.
fn commit(param: Value) -> Result<Value, Error> {
    restore::commit(&restore_options(&param)?)?;
    Ok(Value::Null)
}

#[api(
    input: {
        properties: {
            dir: {
                type: String,
                description: "Directory holding one device's backup chain.",
            },
            targetfile: {
                type: String,
                description: "File the merged image is written to; the chain stays untouched.",
            },
            until: {
                type: String,
                description: "Truncate the chain after this file (inclusive).",
                optional: true,
            },
            filter: {
                type: String,
                description: "Only chain entries whose name contains this string participate.",
                optional: true,
            },
            "dry-run": {
                type: Boolean,
                description: "Print the tool invocations without applying any change.",
                optional: true,
                default: false,
            },
            "rate-limit": {
                type: Integer,
                description: "Commit rate limit in bytes per second.",
                optional: true,
                minimum: 0,
            },
            "skip-check": {
                type: Boolean,
                description: "Skip the per-file consistency check.",
                optional: true,
                default: false,
            },
        }
    }
)]
/// Merge the chain into a new file, leaving every original file untouched.
fn merge(param: Value) -> Result<Value, Error> {
    let targetfile = PathBuf::from(required_string_param(&param, "targetfile")?);
    restore::merge(&restore_options(&param)?, &targetfile)?;
    Ok(Value::Null)
}

#[api(
    input: {
        properties: {
            dir: {
                type: String,
                description: "Directory holding one device's backup chain.",
            },
            until: {
                type: String,
                description: "Truncate the chain after this file (inclusive).",
                optional: true,
            },
            filter: {
                type: String,
                description: "Only chain entries whose name contains this string participate.",
                optional: true,
            },
            "dry-run": {
                type: Boolean,
                description: "Print the tool invocations without applying any change.",
                optional: true,
                default: false,
            },
            "rate-limit": {
                type: Integer,
                description: "Commit rate limit in bytes per second.",
                optional: true,
                minimum: 0,
            },
            "skip-check": {
                type: Boolean,
                description: "Skip the per-file consistency check.",
                optional: true,
                default: false,
            },
        }
    }
)]
/// Collapse the chain while keeping every increment reachable as an
/// internal qcow2 snapshot of the base image.
fn snapshotrebase(param: Value) -> Result<Value, Error> {
    restore::snapshotrebase(&restore_options(&param)?)?;
    Ok(Value::Null)
}

fn main() {
    init_cli_logger("QMPRESTORE_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert("rebase", CliCommand::new(&API_METHOD_REBASE))
        .insert("commit", CliCommand::new(&API_METHOD_COMMIT))
        .insert("merge", CliCommand::new(&API_METHOD_MERGE))
        .insert("snapshotrebase", CliCommand::new(&API_METHOD_SNAPSHOTREBASE));

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| proxmox_async::runtime::main(future)),
    );
}
