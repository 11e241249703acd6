//! Backup orchestrator.
//!
//! Drives one backup run: pre-run gate, bitmap lifecycle, fleecing
//! topology, transactional job start, event-driven completion tracking
//! and the fixed-order teardown that runs on every exit path.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use serde_json::Value;
use tokio::signal::unix::{signal, SignalKind};
use uuid::Uuid;

use crate::api_types::{AioMode, BackupLevel};
use crate::blockdev::{get_block_devices, BlockDevice, NODE_PREFIX};
use crate::image::{self, ImageTool};
use crate::layout::{self, BackupKind, Layout};
use crate::qga::{self, QgaClient};
use crate::qmp::commands::{transaction_bitmap_add, transaction_bitmap_clear};
use crate::qmp::{EventStream, QmpClient};

pub mod fleecing;

use fleecing::Topology;

/// All options of one backup run, resolved from the command line.
pub struct BackupOptions {
    pub level: BackupLevel,
    pub target: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub agent_socket: Option<String>,
    pub quiesce: bool,
    pub monthly: bool,
    pub no_subdir: bool,
    pub no_timestamp: bool,
    pub no_symlink: bool,
    pub compress: bool,
    pub include_raw: bool,
    pub speed_limit: u64,
    pub uuid: Option<String>,
    pub remove_delay: u64,
    pub aio: AioMode,
    pub disable_cache: bool,
}

/// The three concrete levels differ in exactly four attributes; `auto`
/// is collapsed to one of them before this table is consulted.
struct LevelTraits {
    sync: &'static str,
    persistent_bitmap: bool,
    creates_bitmap: bool,
    consumes_bitmap: bool,
}

fn level_traits(kind: BackupKind) -> LevelTraits {
    match kind {
        BackupKind::Full => LevelTraits {
            sync: "full",
            persistent_bitmap: true,
            creates_bitmap: true,
            consumes_bitmap: false,
        },
        BackupKind::Inc => LevelTraits {
            sync: "incremental",
            persistent_bitmap: true,
            creates_bitmap: false,
            consumes_bitmap: true,
        },
        BackupKind::Copy => LevelTraits {
            sync: "full",
            persistent_bitmap: false,
            creates_bitmap: true,
            consumes_bitmap: false,
        },
    }
}

fn check_config(options: &BackupOptions) -> Result<(), Error> {
    if !options.include.is_empty() && !options.exclude.is_empty() {
        bail!("--include and --exclude are mutually exclusive");
    }
    if options.include_raw && options.level == BackupLevel::Copy {
        bail!("--include-raw cannot be combined with copy level backups");
    }
    if options.compress && options.include_raw {
        bail!("--compress cannot be applied to raw format devices");
    }
    if options.quiesce && options.agent_socket.is_none() {
        bail!("--quiesce requires --agent-socket");
    }
    Ok(())
}

/// Collapse `auto` to `full` or `inc` based on the target directory
/// state: no uuid file (or a fresh month under `--monthly`) starts a new
/// chain.
fn resolve_level(options: &BackupOptions, layout: &Layout, epoch: i64) -> Result<BackupKind, Error> {
    let kind = match options.level {
        BackupLevel::Full => BackupKind::Full,
        BackupLevel::Inc => BackupKind::Inc,
        BackupLevel::Copy => BackupKind::Copy,
        BackupLevel::Auto => {
            let kind = if layout.read_uuid()?.is_none() {
                BackupKind::Full
            } else if options.monthly && !layout.run_root(epoch)?.exists() {
                BackupKind::Full
            } else {
                BackupKind::Inc
            };
            log::info!("auto backup mode: executing level [{}]", kind.as_str().to_lowercase());
            kind
        }
    };
    Ok(kind)
}

/// Determine the chain uuid for this run without writing anything yet;
/// the uuid file is only created once the pre-run gate has passed.
fn resolve_uuid(
    kind: BackupKind,
    options: &BackupOptions,
    layout: &Layout,
) -> Result<Option<String>, Error> {
    match kind {
        BackupKind::Copy => Ok(None),
        BackupKind::Full => match layout.read_uuid()? {
            Some(existing) => {
                if let Some(requested) = &options.uuid {
                    if *requested != existing {
                        bail!(
                            "requested uuid [{}] does not match existing uuid [{}] of target directory",
                            requested,
                            existing
                        );
                    }
                }
                Ok(Some(existing))
            }
            None => Ok(Some(
                options
                    .uuid
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            )),
        },
        BackupKind::Inc => match layout.read_uuid()? {
            Some(existing) => Ok(Some(existing)),
            None => bail!("target directory has no uuid file, execute a full backup first"),
        },
    }
}

/// Per-device pre-run gate. Must not cause any side effect; a failure
/// here aborts the run before the hypervisor graph is touched.
fn check_devices(
    kind: BackupKind,
    devices: &mut [BlockDevice],
    layout: &Layout,
    run_root: &Path,
    uuid: Option<&str>,
) -> Result<(), Error> {
    for device in devices.iter_mut() {
        let dir = layout.device_dir(run_root, device);

        if layout::dir_has_partial(&dir)? {
            bail!(
                "partial backup file found for device [{}] in {:?}, remove it before a new backup",
                device.node,
                dir
            );
        }

        device.has_full_backup = layout::dir_has_full(&dir)?;

        if kind != BackupKind::Inc {
            continue;
        }

        if !device.has_full_backup {
            bail!(
                "no full backup found for device [{}] in {:?}, unable to execute incremental backup",
                device.node,
                dir
            );
        }

        let uuid = uuid.expect("incremental backup without resolved uuid");
        let bitmap_name = device.bitmap_name(uuid);
        match device.bitmaps.iter().find(|bitmap| bitmap.name == bitmap_name) {
            Some(bitmap) if bitmap.recording && !bitmap.busy => (),
            Some(bitmap) => bail!(
                "bitmap [{}] of device [{}] is not ready for backup (recording={}, busy={})",
                bitmap.name,
                device.node,
                bitmap.recording,
                bitmap.busy
            ),
            None => bail!(
                "no bitmap matching uuid [{}] found for device [{}], unable to execute incremental backup",
                uuid,
                device.node
            ),
        }
    }
    Ok(())
}

/// Transient per-run state that teardown operates on.
#[derive(Default)]
struct RunState {
    topologies: Vec<Topology>,
    copy_bitmaps: Vec<(String, String)>,
    frozen: bool,
}

fn spawn_signal_task(
    client: Arc<QmpClient>,
    signal_caught: Arc<AtomicBool>,
) -> Result<tokio::task::JoinHandle<()>, Error> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => log::warn!("got interrupt signal"),
            _ = terminate.recv() => log::warn!("got terminate signal"),
        }
        signal_caught.store(true, Ordering::SeqCst);

        let jobs = match client.query_block_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                log::warn!("unable to query block jobs for cancellation: {}", err);
                return;
            }
        };
        if let Some(jobs) = jobs.as_array() {
            for job in jobs {
                if let Some(id) = job["device"].as_str() {
                    if id.starts_with(NODE_PREFIX) {
                        log::warn!("cancelling block job [{}]", id);
                        if let Err(err) = client.block_job_cancel(id, true).await {
                            log::warn!("unable to cancel block job [{}]: {}", id, err);
                        }
                    }
                }
            }
        }
    }))
}

fn spawn_progress_task(
    client: Arc<QmpClient>,
    files: Vec<(String, String)>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let jobs = match client.query_block_jobs().await {
                Ok(jobs) => jobs,
                Err(_) => break,
            };
            let jobs = match jobs.as_array() {
                Some(jobs) if !jobs.is_empty() => jobs.clone(),
                _ => continue,
            };
            for (job_id, file) in &files {
                for job in &jobs {
                    if job["device"] == job_id.as_str() {
                        let len = job["len"].as_u64().unwrap_or(0);
                        let offset = job["offset"].as_u64().unwrap_or(0);
                        let percent = if len > 0 { offset * 100 / len } else { 0 };
                        log::info!(
                            "[{}:{}] Wrote Offset: {}% ({} of {})",
                            job_id,
                            file,
                            percent,
                            offset,
                            len
                        );
                    }
                }
            }
        }
    })
}

/// Consume job events until every started job reached a terminal state.
///
/// Jobs run with `auto-finalize=false`: the `pending` state change is
/// answered with an explicit `job-finalize`, which guarantees the target
/// was durably flushed before the completion event fires.
async fn track_jobs(
    client: &QmpClient,
    events: &mut EventStream,
    job_ids: &HashSet<String>,
) -> Result<(), Error> {
    let mut completed: HashSet<String> = HashSet::new();

    while completed.len() < job_ids.len() {
        let event = events
            .wait(
                &[
                    "JOB_STATUS_CHANGE",
                    "BLOCK_JOB_COMPLETED",
                    "BLOCK_JOB_CANCELLED",
                    "BLOCK_JOB_ERROR",
                ],
                |event| {
                    let id = if event.event == "JOB_STATUS_CHANGE" {
                        event.data["id"].as_str()
                    } else {
                        event.data["device"].as_str()
                    };
                    matches!(id, Some(id) if job_ids.contains(id))
                },
                None,
            )
            .await?;

        match event.event.as_str() {
            "JOB_STATUS_CHANGE" => {
                let id = event.data["id"].as_str().unwrap_or("");
                let status = event.data["status"].as_str().unwrap_or("");
                log::debug!("job [{}] changed status to [{}]", id, status);
                if status == "pending" {
                    client.job_finalize(id).await?;
                }
            }
            "BLOCK_JOB_COMPLETED" => {
                let id = event.data["device"].as_str().unwrap_or("").to_string();
                if let Some(err) = event.data.get("error").and_then(Value::as_str) {
                    bail!("backup job [{}] failed: {}", id, err);
                }
                log::info!("backup job [{}] completed", id);
                completed.insert(id);
            }
            "BLOCK_JOB_CANCELLED" => {
                bail!(
                    "backup job [{}] was cancelled",
                    event.data["device"].as_str().unwrap_or("unknown")
                );
            }
            "BLOCK_JOB_ERROR" => {
                bail!(
                    "error during backup operation on job [{}]: action [{}], operation [{}]",
                    event.data["device"].as_str().unwrap_or("unknown"),
                    event.data["action"].as_str().unwrap_or("unknown"),
                    event.data["operation"].as_str().unwrap_or("unknown")
                );
            }
            _ => (),
        }
    }

    log::info!("saved all disks");
    Ok(())
}

/// Build topologies, start all jobs in one transaction and await their
/// completion. Everything registered in `state` is unwound by
/// [`teardown`] afterwards, no matter how this returns.
#[allow(clippy::too_many_arguments)]
async fn run_jobs(
    client: &Arc<QmpClient>,
    options: &BackupOptions,
    kind: BackupKind,
    uuid: Option<&str>,
    devices: &[BlockDevice],
    layout: &Layout,
    run_root: &Path,
    epoch: i64,
    agent: &mut Option<QgaClient>,
    state: &mut RunState,
) -> Result<(), Error> {
    let tool = ImageTool::new(false);
    let traits = level_traits(kind);

    for device in devices {
        let dir = layout.device_dir(run_root, device);
        proxmox_sys::fs::create_path(&dir, None, None)?;

        let config_path = run_root.join(format!("{}.config", layout::device_dir_name(device)));
        if let Err(err) = image::save_info(&tool, &config_path, &device.filename) {
            log::warn!("unable to get image info: [{}]", err);
        }
        let qcow_options = image::load_info(&config_path);

        let backing = if traits.consumes_bitmap {
            layout::latest_image_name(&dir)?
        } else {
            None
        };

        let basename = Path::new(&device.filename)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| format_err!("malformed image filename {:?}", device.filename))?;
        let target_path = dir.join(layout::partial_target_name(kind, epoch, basename));
        let target_str = target_path
            .to_str()
            .ok_or_else(|| format_err!("non-utf8 target path {:?}", target_path))?;
        log::info!(
            "create target backup image: [{}], virtual size: [{}]",
            target_str,
            device.virtual_size
        );
        tool.create(
            target_str,
            "qcow2",
            device.virtual_size,
            backing.as_deref(),
            &qcow_options,
        )?;

        let fleece_path = fleecing::create_fleece_image(&tool, device, &dir, &qcow_options)?;

        let mut topology = Topology::new(device, fleece_path, target_path)?;
        let cbw_bitmap = match (traits.consumes_bitmap, uuid) {
            (true, Some(uuid)) => Some(device.bitmap_name(uuid)),
            _ => None,
        };
        topology
            .build(
                client,
                cbw_bitmap.as_deref(),
                options.aio.as_str(),
                options.disable_cache,
            )
            .await?;
        state.topologies.push(topology);
    }

    if let Some(agent) = agent.as_mut() {
        state.frozen = qga::quiesce(agent).await;
    }

    // subscribe before the transaction so no event is lost
    let mut events = client.events();

    let mut actions = Vec::new();
    for (device, topology) in devices.iter().zip(state.topologies.iter()) {
        let mut job_bitmap = None;
        match kind {
            BackupKind::Full => {
                let bitmap = device.bitmap_name(uuid.expect("full backup without uuid"));
                if device.has_bitmap {
                    log::debug!("clearing existing bitmap [{}]", bitmap);
                    actions.push(transaction_bitmap_clear(&device.node, &bitmap));
                } else {
                    log::info!("creating new bitmap: [{}]", bitmap);
                    actions.push(transaction_bitmap_add(
                        &device.node,
                        &bitmap,
                        traits.persistent_bitmap,
                    ));
                }
            }
            BackupKind::Inc => {
                job_bitmap = Some(device.bitmap_name(uuid.expect("inc backup without uuid")));
            }
            BackupKind::Copy => {
                let bitmap = device.copy_bitmap_name();
                log::info!("copy backup: creating non-persistent bitmap: [{}]", bitmap);
                actions.push(transaction_bitmap_add(
                    &device.node,
                    &bitmap,
                    traits.persistent_bitmap,
                ));
                state.copy_bitmaps.push((device.node.clone(), bitmap));
            }
        }
        actions.push(fleecing::backup_job_action(
            topology,
            traits.sync,
            job_bitmap.as_deref(),
            options.speed_limit,
            options.compress,
        ));
    }

    log::debug!("created transaction: {:?}", actions);
    client.transaction(actions).await?;

    // the snapshot point is fixed now, no need to keep the guest frozen
    // while the jobs run
    if state.frozen {
        if let Some(agent) = agent.as_mut() {
            qga::thaw(agent).await;
        }
        state.frozen = false;
    }

    let files: Vec<(String, String)> = state
        .topologies
        .iter()
        .map(|topology| {
            let file = topology
                .target_path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            (topology.job_id.clone(), file)
        })
        .collect();
    let progress = spawn_progress_task(Arc::clone(client), files);

    let job_ids: HashSet<String> = state
        .topologies
        .iter()
        .map(|topology| topology.job_id.clone())
        .collect();
    let result = track_jobs(client, &mut events, &job_ids).await;

    progress.abort();

    result
}

/// Unwind the run in fixed reverse order. Every step is best effort:
/// failures degrade to warnings and never skip later steps.
async fn teardown(
    client: &QmpClient,
    agent: &mut Option<QgaClient>,
    state: &mut RunState,
    remove_delay: u64,
) {
    // step 1: thaw the guest, even if the freeze state is unclear
    if let Some(agent) = agent.as_mut() {
        qga::thaw(agent).await;
        state.frozen = false;
    }

    if remove_delay > 0 {
        log::info!("waiting {}s before removing backup graph nodes", remove_delay);
        tokio::time::sleep(Duration::from_secs(remove_delay)).await;
    }

    // step 2: snapshot-access nodes
    for topology in state.topologies.iter_mut() {
        topology.remove_snap(client).await;
    }
    // step 3: undo the copy-before-write splice
    for topology in state.topologies.iter_mut() {
        topology.unsplice(client).await;
    }
    // step 4: filter nodes
    for topology in state.topologies.iter_mut() {
        topology.remove_cbw(client).await;
    }
    // step 5: target blockdevs
    for topology in state.topologies.iter_mut() {
        topology.remove_target(client).await;
    }
    // step 6: fleece blockdevs and files
    for topology in state.topologies.iter_mut() {
        topology.remove_fleece(client).await;
    }
    // step 7: non-persistent copy bitmaps
    for (node, bitmap) in &state.copy_bitmaps {
        if let Err(err) = client.bitmap_remove(node, bitmap).await {
            log::warn!("unable to remove bitmap [{}] on [{}]: {}", bitmap, node, err);
        }
    }
    // step 8, the disconnect, is up to the caller
}

/// Execute one backup run.
pub async fn run_backup(socket: &str, options: &BackupOptions) -> Result<(), Error> {
    check_config(options)?;

    let layout = Layout::new(&options.target, options.monthly, options.no_subdir);
    let epoch = proxmox_time::epoch_i64();

    // a broken chain blocks the run before the monitor is contacted
    if let Some(partial) = layout::tree_find_partial(layout.root())? {
        bail!(
            "found partial backup file {:?}, backup chain may be broken; remove it before a new backup",
            partial
        );
    }

    let kind = resolve_level(options, &layout, epoch)?;
    let uuid = resolve_uuid(kind, options, &layout)?;

    let client = Arc::new(QmpClient::connect(socket).await?);

    let version = client.query_version().await?;
    log::info!(
        "connected to monitor, qemu version: {}.{}.{}",
        version["qemu"]["major"],
        version["qemu"]["minor"],
        version["qemu"]["micro"]
    );

    let blockinfo = client.query_block().await?;
    let named_nodes = client.query_named_block_nodes().await?;
    let mut devices = get_block_devices(
        &blockinfo,
        &named_nodes,
        &options.include,
        &options.exclude,
        uuid.as_deref(),
        options.include_raw,
    )?;

    let run_root = layout.run_root(epoch)?;
    check_devices(kind, &mut devices, &layout, &run_root, uuid.as_deref())?;

    // the gate passed, commit the chain uuid
    if kind == BackupKind::Full && layout.read_uuid()?.is_none() {
        let uuid = uuid.as_deref().expect("full backup without uuid");
        layout.create_uuid(uuid)?;
        log::info!("created uuid file: [{}]", uuid);
    }
    proxmox_sys::fs::create_path(&run_root, None, None)?;

    let signal_caught = Arc::new(AtomicBool::new(false));
    let signal_task = spawn_signal_task(Arc::clone(&client), Arc::clone(&signal_caught))?;

    let mut agent = match (&options.agent_socket, options.quiesce) {
        (Some(socket), true) => qga::connect_agent(socket).await,
        _ => None,
    };

    let mut state = RunState::default();
    let result = run_jobs(
        &client,
        options,
        kind,
        uuid.as_deref(),
        &devices,
        &layout,
        &run_root,
        epoch,
        &mut agent,
        &mut state,
    )
    .await;

    teardown(&client, &mut agent, &mut state, options.remove_delay).await;

    signal_task.abort();
    client.close();

    if signal_caught.load(Ordering::SeqCst) {
        bail!("backup aborted: signal caught, partial files remain for inspection");
    }
    result?;

    // only a clean run may drop the .partial suffix
    for topology in &state.topologies {
        let finished = layout::finalize_target(&topology.target_path)?;
        log::info!("renamed target image: [{:?}]", finished);
        if kind != BackupKind::Inc && options.no_timestamp && !options.no_symlink {
            layout::create_full_symlink(&finished)?;
        }
    }

    Ok(())
}

/// Remove the dirty bitmaps a previous backup chain left behind. With a
/// uuid only that chain's bitmaps are removed, otherwise everything
/// carrying the reserved prefix.
pub async fn run_cleanup(socket: &str, uuid: Option<&str>) -> Result<(), Error> {
    let client = QmpClient::connect(socket).await?;

    let blockinfo = client.query_block().await?;
    let entries = blockinfo
        .as_array()
        .ok_or_else(|| format_err!("malformed query-block reply: expected array"))?;

    let mut removed = 0;
    for entry in entries {
        let inserted = match entry.get("inserted") {
            Some(inserted) => inserted,
            None => continue,
        };
        let node = match inserted["node-name"].as_str() {
            Some(node) => node,
            None => continue,
        };
        let bitmaps = entry
            .get("dirty-bitmaps")
            .or_else(|| inserted.get("dirty-bitmaps"))
            .and_then(Value::as_array);
        let bitmaps = match bitmaps {
            Some(bitmaps) => bitmaps,
            None => continue,
        };

        for bitmap in bitmaps {
            let name = match bitmap["name"].as_str() {
                Some(name) => name,
                None => continue,
            };
            if !name.starts_with(NODE_PREFIX) {
                log::debug!("ignoring bitmap: [{}]", name);
                continue;
            }
            if let Some(uuid) = uuid {
                if !name.ends_with(uuid) {
                    log::debug!("bitmap [{}] does not match uuid, ignoring", name);
                    continue;
                }
            }
            log::info!("removing bitmap: [{}] on node [{}]", name, node);
            client.bitmap_remove(node, name).await?;
            removed += 1;
        }
    }

    if removed == 0 {
        log::info!("no bitmap to remove");
    }

    client.close();
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blockdev::{BlockDirtyBitmap, ImageFormat};
    use std::path::PathBuf;

    fn testdir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("qmpbackup-orch-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn options(target: &Path, level: BackupLevel) -> BackupOptions {
        BackupOptions {
            level,
            target: target.to_string_lossy().to_string(),
            include: Vec::new(),
            exclude: Vec::new(),
            agent_socket: None,
            quiesce: false,
            monthly: false,
            no_subdir: false,
            no_timestamp: false,
            no_symlink: false,
            compress: false,
            include_raw: false,
            speed_limit: 0,
            uuid: None,
            remove_delay: 0,
            aio: AioMode::Threads,
            disable_cache: false,
        }
    }

    fn device(node: &str, bitmaps: Vec<BlockDirtyBitmap>) -> BlockDevice {
        BlockDevice {
            node: node.to_string(),
            device: format!("drive-{}", node),
            qdev: None,
            format: ImageFormat::Qcow2,
            filename: format!("/images/{}.qcow2", node),
            virtual_size: 1024,
            has_bitmap: !bitmaps.is_empty(),
            has_full_backup: false,
            bitmaps,
            file_node: Some("#block123".to_string()),
        }
    }

    const UUID: &str = "11111111-2222-3333-4444-555555555555";

    fn chain_bitmap(node: &str, recording: bool, busy: bool) -> BlockDirtyBitmap {
        BlockDirtyBitmap {
            name: format!("qmpbackup-{}-{}", node, UUID),
            recording,
            persistent: true,
            granularity: 65536,
            busy,
        }
    }

    #[test]
    fn test_level_traits_table() {
        let full = level_traits(BackupKind::Full);
        assert_eq!(full.sync, "full");
        assert!(full.persistent_bitmap && full.creates_bitmap && !full.consumes_bitmap);

        let inc = level_traits(BackupKind::Inc);
        assert_eq!(inc.sync, "incremental");
        assert!(inc.persistent_bitmap && !inc.creates_bitmap && inc.consumes_bitmap);

        let copy = level_traits(BackupKind::Copy);
        assert_eq!(copy.sync, "full");
        assert!(!copy.persistent_bitmap && copy.creates_bitmap && !copy.consumes_bitmap);
    }

    #[test]
    fn test_config_rejections() {
        let dir = testdir("config");
        let mut opts = options(&dir, BackupLevel::Full);
        opts.include = vec!["disk1".to_string()];
        opts.exclude = vec!["disk2".to_string()];
        assert!(check_config(&opts).is_err());

        let mut opts = options(&dir, BackupLevel::Copy);
        opts.include_raw = true;
        assert!(check_config(&opts).is_err());

        let mut opts = options(&dir, BackupLevel::Full);
        opts.compress = true;
        opts.include_raw = true;
        assert!(check_config(&opts).is_err());

        let mut opts = options(&dir, BackupLevel::Full);
        opts.quiesce = true;
        assert!(check_config(&opts).is_err());
        opts.agent_socket = Some("/run/qga.sock".to_string());
        assert!(check_config(&opts).is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_auto_level_resolution() {
        let dir = testdir("auto");
        let opts = options(&dir, BackupLevel::Auto);
        let layout = Layout::new(&opts.target, false, false);
        let epoch = 1690000000;

        // empty directory starts a fresh chain
        assert_eq!(resolve_level(&opts, &layout, epoch).unwrap(), BackupKind::Full);

        layout.create_uuid(UUID).unwrap();
        assert_eq!(resolve_level(&opts, &layout, epoch).unwrap(), BackupKind::Inc);

        // a fresh month rolls over to a new chain
        let mut monthly = options(&dir, BackupLevel::Auto);
        monthly.monthly = true;
        let layout = Layout::new(&monthly.target, true, false);
        assert_eq!(
            resolve_level(&monthly, &layout, epoch).unwrap(),
            BackupKind::Full
        );
        std::fs::create_dir_all(layout.run_root(epoch).unwrap()).unwrap();
        assert_eq!(
            resolve_level(&monthly, &layout, epoch).unwrap(),
            BackupKind::Inc
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_uuid_resolution() {
        let dir = testdir("uuid");
        let layout = Layout::new(dir.to_str().unwrap(), false, false);

        // copy bypasses the uuid entirely
        let opts = options(&dir, BackupLevel::Copy);
        assert!(resolve_uuid(BackupKind::Copy, &opts, &layout).unwrap().is_none());

        // inc requires an existing chain
        let opts = options(&dir, BackupLevel::Inc);
        assert!(resolve_uuid(BackupKind::Inc, &opts, &layout).is_err());

        // full takes the caller supplied uuid on a fresh directory
        let mut opts = options(&dir, BackupLevel::Full);
        opts.uuid = Some(UUID.to_string());
        assert_eq!(
            resolve_uuid(BackupKind::Full, &opts, &layout).unwrap().unwrap(),
            UUID
        );

        layout.create_uuid(UUID).unwrap();
        assert_eq!(
            resolve_uuid(BackupKind::Inc, &opts, &layout).unwrap().unwrap(),
            UUID
        );

        // an existing uuid is reused, a conflicting request aborts
        opts.uuid = Some("99999999-0000-0000-0000-000000000000".to_string());
        assert!(resolve_uuid(BackupKind::Full, &opts, &layout).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_inc_gate() {
        let dir = testdir("gate");
        let layout = Layout::new(dir.to_str().unwrap(), false, false);
        let run_root = dir.clone();

        // no full backup present
        let mut devices = vec![device("disk1", vec![chain_bitmap("disk1", true, false)])];
        let err =
            check_devices(BackupKind::Inc, &mut devices, &layout, &run_root, Some(UUID)).unwrap_err();
        assert!(err.to_string().contains("no full backup"));

        let devdir = dir.join("disk1");
        std::fs::create_dir_all(&devdir).unwrap();
        std::fs::write(devdir.join("FULL-1690000000-disk1.qcow2"), b"x").unwrap();

        // bitmap ready
        assert!(
            check_devices(BackupKind::Inc, &mut devices, &layout, &run_root, Some(UUID)).is_ok()
        );
        assert!(devices[0].has_full_backup);

        // busy bitmap blocks the run
        let mut devices = vec![device("disk1", vec![chain_bitmap("disk1", true, true)])];
        let err =
            check_devices(BackupKind::Inc, &mut devices, &layout, &run_root, Some(UUID)).unwrap_err();
        assert!(err.to_string().contains("not ready"));

        // missing bitmap blocks the run
        let mut devices = vec![device("disk1", Vec::new())];
        let err =
            check_devices(BackupKind::Inc, &mut devices, &layout, &run_root, Some(UUID)).unwrap_err();
        assert!(err.to_string().contains("no bitmap matching uuid"));

        // a partial file blocks any level
        std::fs::write(devdir.join("INC-1690000100-disk1.qcow2.partial"), b"x").unwrap();
        let mut devices = vec![device("disk1", vec![chain_bitmap("disk1", true, false)])];
        let err =
            check_devices(BackupKind::Full, &mut devices, &layout, &run_root, Some(UUID)).unwrap_err();
        assert!(err.to_string().contains("partial"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
