//! Driver for the external `qemu-img` tool.
//!
//! A thin subprocess runner around argv builders. In dry-run mode every
//! invocation is logged verbatim and nothing is executed, so callers can
//! print the exact commands a restore mode would run.

use std::path::Path;

use anyhow::{bail, format_err, Error};
use serde_json::Value;

const QEMU_IMG: &str = "qemu-img";

/// Run one image tool invocation and capture its output. A non-zero
/// exit is an error carrying the full command line and whatever the
/// tool wrote to stderr, so a failed restore step is diagnosable from
/// the log alone.
fn run_image_tool(argv: &[String]) -> Result<String, Error> {
    let output = std::process::Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .map_err(|err| format_err!("failed to execute {}: {}", argv[0], err))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let detail = if stderr.is_empty() {
            "no error output"
        } else {
            stderr
        };
        match output.status.code() {
            Some(code) => bail!("'{}' failed with status {}: {}", argv.join(" "), code, detail),
            None => bail!("'{}' terminated by signal", argv.join(" ")),
        }
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// qcow2 creation options propagated from the source image so targets
/// match the original layout.
#[derive(Debug, Default, Clone)]
pub struct QcowOptions {
    pub compat: Option<String>,
    pub cluster_size: Option<u64>,
    pub lazy_refcounts: bool,
}

impl QcowOptions {
    /// Extract the interesting options from `qemu-img info` output. Each
    /// option is best effort, a missing key only produces a warning.
    pub fn from_info(info: &Value) -> Self {
        let mut options = QcowOptions::default();

        match info["format-specific"]["data"]["compat"].as_str() {
            Some(compat) => options.compat = Some(compat.to_string()),
            None => log::warn!("unable to apply qcow specific compat option"),
        }
        match info["cluster-size"].as_u64() {
            Some(size) => options.cluster_size = Some(size),
            None => log::warn!("unable to apply qcow specific cluster_size option"),
        }
        options.lazy_refcounts = info["format-specific"]["data"]["lazy-refcounts"]
            .as_bool()
            .unwrap_or(false);

        options
    }

    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(compat) = &self.compat {
            args.push("-o".to_string());
            args.push(format!("compat={}", compat));
        }
        if let Some(size) = self.cluster_size {
            args.push("-o".to_string());
            args.push(format!("cluster_size={}", size));
        }
        if self.lazy_refcounts {
            args.push("-o".to_string());
            args.push("lazy_refcounts=on".to_string());
        }
        args
    }
}

pub fn info_argv(filename: &str) -> Vec<String> {
    vec![
        QEMU_IMG.to_string(),
        "info".to_string(),
        filename.to_string(),
        "--output".to_string(),
        "json".to_string(),
        "--force-share".to_string(),
    ]
}

pub fn check_argv(filename: &str) -> Vec<String> {
    vec![QEMU_IMG.to_string(), "check".to_string(), filename.to_string()]
}

pub fn create_argv(
    filename: &str,
    format: &str,
    size: u64,
    backing: Option<&str>,
    options: &QcowOptions,
) -> Vec<String> {
    let mut argv = vec![
        QEMU_IMG.to_string(),
        "create".to_string(),
        "-f".to_string(),
        format.to_string(),
    ];
    if let Some(backing) = backing {
        argv.push("-b".to_string());
        argv.push(backing.to_string());
        argv.push("-F".to_string());
        argv.push("qcow2".to_string());
    }
    argv.push(filename.to_string());
    argv.push("-o".to_string());
    argv.push(format!("size={}", size));
    if format == "qcow2" {
        argv.extend(options.to_args());
    }
    argv
}

pub fn rebase_argv(filename: &str, backing: &str) -> Vec<String> {
    vec![
        QEMU_IMG.to_string(),
        "rebase".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        "-F".to_string(),
        "qcow2".to_string(),
        "-b".to_string(),
        backing.to_string(),
        filename.to_string(),
        "-u".to_string(),
    ]
}

pub fn commit_argv(filename: &str, rate_limit: Option<u64>) -> Vec<String> {
    let mut argv = vec![QEMU_IMG.to_string(), "commit".to_string()];
    if let Some(rate) = rate_limit {
        argv.push("-r".to_string());
        argv.push(rate.to_string());
    }
    argv.push(filename.to_string());
    argv
}

pub fn snapshot_argv(filename: &str, name: &str) -> Vec<String> {
    vec![
        QEMU_IMG.to_string(),
        "snapshot".to_string(),
        "-c".to_string(),
        name.to_string(),
        filename.to_string(),
    ]
}

/// Runner for `qemu-img` invocations.
pub struct ImageTool {
    dry_run: bool,
}

impl ImageTool {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    fn run(&self, argv: Vec<String>) -> Result<String, Error> {
        log::info!("{}", argv.join(" "));
        if self.dry_run {
            return Ok(String::new());
        }
        run_image_tool(&argv)
    }

    /// Query image information. Read only, so it also runs in dry-run
    /// mode.
    pub fn info(&self, filename: &str) -> Result<Value, Error> {
        let output = run_image_tool(&info_argv(filename))?;
        serde_json::from_str(&output)
            .map_err(|err| format_err!("unable to parse image info for {:?} - {}", filename, err))
    }

    pub fn check(&self, filename: &str) -> Result<(), Error> {
        self.run(check_argv(filename)).map(|_| ())
    }

    pub fn create(
        &self,
        filename: &str,
        format: &str,
        size: u64,
        backing: Option<&str>,
        options: &QcowOptions,
    ) -> Result<(), Error> {
        self.run(create_argv(filename, format, size, backing, options))
            .map(|_| ())
    }

    pub fn rebase(&self, filename: &str, backing: &str) -> Result<(), Error> {
        self.run(rebase_argv(filename, backing)).map(|_| ())
    }

    /// Merge an image into its backing file. The rate limit is only ever
    /// forwarded here, no other invocation takes it.
    pub fn commit(&self, filename: &str, rate_limit: Option<u64>) -> Result<(), Error> {
        self.run(commit_argv(filename, rate_limit)).map(|_| ())
    }

    pub fn snapshot_create(&self, filename: &str, name: &str) -> Result<(), Error> {
        self.run(snapshot_argv(filename, name)).map(|_| ())
    }
}

/// Save the source image information next to the device directory. Used
/// to re-create targets with the same options as the original image.
pub fn save_info(tool: &ImageTool, config_path: &Path, filename: &str) -> Result<(), Error> {
    let info = tool.info(filename)?;
    std::fs::write(config_path, serde_json::to_vec_pretty(&info)?)
        .map_err(|err| format_err!("unable to write image info {:?} - {}", config_path, err))?;
    log::info!("saved image info: [{:?}]", config_path);
    Ok(())
}

/// Load previously saved image information, tolerating its absence.
pub fn load_info(config_path: &Path) -> QcowOptions {
    match std::fs::read(config_path) {
        Ok(data) => match serde_json::from_slice(&data) {
            Ok(info) => QcowOptions::from_info(&info),
            Err(err) => {
                log::warn!("unable to parse saved image info {:?}: {}", config_path, err);
                QcowOptions::default()
            }
        },
        Err(_) => QcowOptions::default(),
    }
}
