//! Sandbox operations: provisioning, supervision, stop, removal, listing
//! and exec.
//!
//! `run` is the long-lived entry point the reconciler spawns one detached
//! process per box for. It provisions the sandbox end to end (namespace,
//! veth, NAT chains, route mirror, DNS proxy, staged rootfs, container),
//! then stays in the foreground refreshing the box spec until it is told to
//! stop or the container dies. `stop` and `remove` are its counterparts and
//! work from any process, surviving reconciler restarts in between.

use std::{io::IsTerminal, path::Path, time::Duration};

use getset::{CopyGetters, Getters};
use ipnetwork::Ipv4Network;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::{
    signal::unix::{signal as unix_signal, SignalKind},
    sync::watch,
    time::{interval_at, sleep, Instant},
};
use tracing::{info, warn};

use crate::{
    config::MachineConfig,
    container::{build_runtime_spec, write_runtime_spec, ContainerManager, ContainerStatus, OciRuntime},
    control::{ControlPlane, FileControlPlane, SandboxStatus},
    image::{stage_rootfs, ImageProvider, NativeImageStore},
    management::workdir::{
        ensure_machine_layout, ensure_sandbox_layout, list_sandboxes, load_sandbox_info,
        process_alive, read_pidfile, remove_pidfile, save_sandbox_info, write_pidfile, SandboxInfo,
    },
    net::{
        setup_veth, teardown_veth, CidrPool, DnsOverrides, DnsProxy, NamesAndAddrs, NetnsHandle,
        PortForwardManager, RouteMirror, RuleManager, RESERVATION_PREFIX,
    },
    utils::{sandbox_dir, ROOTFS_SUBDIR, RUNTIME_STATE_SUBDIR, STATUS_SUBDIR},
    BoxfleetError, BoxfleetResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long `stop` waits for a signalled run-process to wind down on its own.
///
/// Covers the run-process's own container stop escalation with headroom.
const RUNNER_STOP_TIMEOUT: Duration = Duration::from_secs(25);

/// How often `stop` re-checks a signalled run-process.
const RUNNER_STOP_POLL: Duration = Duration::from_millis(200);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One row of `sandbox list` output.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct SandboxListing {
    /// The box the sandbox serves.
    #[getset(get = "pub with_prefix")]
    box_id: String,

    /// The container state as the OCI runtime reports it.
    #[getset(get = "pub with_prefix")]
    status: ContainerStatus,

    /// Whether a run-process currently supervises the sandbox.
    #[getset(get_copy = "pub with_prefix")]
    runner_alive: bool,

    /// The reserved subnet, when the identity record is readable.
    #[getset(get_copy = "pub with_prefix")]
    cidr: Option<Ipv4Network>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Provisions a sandbox for an assigned box and supervises it until stopped.
///
/// Reports `provisioning`, `running` and a terminal `stopped` or `failed` to
/// the control plane along the way. A second invocation against a sandbox
/// that already has a live run-process is a quiet no-op.
pub async fn run(config: &MachineConfig, box_id: &str) -> BoxfleetResult<()> {
    let sandbox_dir = sandbox_dir(config.get_work_dir(), box_id);
    if let Some(pid) = read_pidfile(&sandbox_dir).await {
        if process_alive(pid) {
            info!(
                "sandbox {} already has a live run-process (pid {})",
                box_id, pid
            );
            return Ok(());
        }
    }

    let control = control_plane(config);
    control
        .report_sandbox_status(box_id, SandboxStatus::Provisioning)
        .await?;

    match provision_and_supervise(config, &control, box_id, &sandbox_dir).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Err(report_err) = control
                .report_sandbox_status(box_id, SandboxStatus::Failed)
                .await
            {
                warn!(
                    "could not report failure of sandbox {}: {}",
                    box_id, report_err
                );
            }
            Err(e)
        }
    }
}

/// Stops a sandbox's run-process and container, leaving its networking and
/// on-disk state in place so a later `run` can pick it back up.
pub async fn stop(config: &MachineConfig, box_id: &str) -> BoxfleetResult<()> {
    let sandbox_dir = sandbox_dir(config.get_work_dir(), box_id);
    if !sandbox_dir.is_dir() {
        info!("sandbox {} has no state, nothing to stop", box_id);
        return Ok(());
    }

    // A live run-process owns the container; ask it to wind down first.
    if let Some(pid) = read_pidfile(&sandbox_dir).await {
        if process_alive(pid) {
            info!("signalling run-process {} of sandbox {}", pid, box_id);
            if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!("could not signal run-process {}: {}", pid, e);
            }

            let deadline = Instant::now() + RUNNER_STOP_TIMEOUT;
            while process_alive(pid) {
                if Instant::now() >= deadline {
                    warn!("run-process {} ignored SIGTERM, killing it", pid);
                    let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
                    break;
                }
                sleep(RUNNER_STOP_POLL).await;
            }
        }
        remove_pidfile(&sandbox_dir).await;
    }

    // The run-process may have died uncleanly or never existed; stop the
    // container directly as well.
    let container = container_for(config, &sandbox_dir)?;
    container.stop_or_kill().await?;

    let control = control_plane(config);
    if let Err(e) = control
        .report_sandbox_status(box_id, SandboxStatus::Stopped)
        .await
    {
        warn!("could not report stop of sandbox {}: {}", box_id, e);
    }

    info!("sandbox {} stopped", box_id);
    Ok(())
}

/// Stops a sandbox and tears down everything it owns: container, NAT chains,
/// veth pair, network namespace and the sandbox directory itself.
pub async fn remove(config: &MachineConfig, box_id: &str) -> BoxfleetResult<()> {
    let sandbox_dir = sandbox_dir(config.get_work_dir(), box_id);
    if !sandbox_dir.is_dir() {
        info!("sandbox {} has no state, nothing to remove", box_id);
        return Ok(());
    }

    stop(config, box_id).await?;

    // Network names derive from the box id alone; the recorded subnet only
    // matters for address assignment, so teardown tolerates a lost record.
    let cidr = match load_sandbox_info(&sandbox_dir).await {
        Some(info) => info.get_cidr(),
        None => placeholder_cidr(config),
    };
    let names = NamesAndAddrs::derive(box_id, cidr)?;

    let container = container_for(config, &sandbox_dir)?;
    container.destroy().await?;

    RuleManager::new(names.clone()).purge().await?;
    teardown_veth(&names).await?;
    NetnsHandle::remove(names.get_namespace()).await?;

    tokio::fs::remove_dir_all(&sandbox_dir).await?;

    info!("sandbox {} removed", box_id);
    Ok(())
}

/// Lists every sandbox directory on this machine with its probed state.
///
/// A sandbox that cannot be probed is still listed; its status degrades to
/// `unknown` rather than failing the whole listing.
pub async fn list(config: &MachineConfig) -> BoxfleetResult<Vec<SandboxListing>> {
    let ids = list_sandboxes(config.get_work_dir()).await?;
    let mut listings = Vec::with_capacity(ids.len());

    for box_id in ids {
        listings.push(inspect(config, &box_id).await);
    }

    Ok(listings)
}

/// Runs a command inside a sandbox's container, returning its exit code.
pub async fn exec(config: &MachineConfig, box_id: &str, command: &[String]) -> BoxfleetResult<i32> {
    let sandbox_dir = sandbox_dir(config.get_work_dir(), box_id);
    if !sandbox_dir.is_dir() {
        return Err(BoxfleetError::SandboxNotFound(box_id.to_string()));
    }

    let container = container_for(config, &sandbox_dir)?;
    let tty = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
    container.exec(command, tty).await
}

/// Whether a sandbox is considered healthy by the reconciler: a live
/// run-process, or failing that, a running container.
pub async fn is_healthy(config: &MachineConfig, box_id: &str) -> bool {
    let sandbox_dir = sandbox_dir(config.get_work_dir(), box_id);
    if !sandbox_dir.is_dir() {
        return false;
    }

    if let Some(pid) = read_pidfile(&sandbox_dir).await {
        if process_alive(pid) {
            return true;
        }
    }

    match container_for(config, &sandbox_dir) {
        Ok(container) => container.is_running().await.unwrap_or(false),
        Err(_) => false,
    }
}

/// Builds the file-backed control plane the machine config points at.
pub(super) fn control_plane(config: &MachineConfig) -> FileControlPlane {
    FileControlPlane::new(
        config.boxes_path(),
        config.get_work_dir().join(STATUS_SUBDIR),
    )
}

async fn provision_and_supervise(
    config: &MachineConfig,
    control: &FileControlPlane,
    box_id: &str,
    sandbox_dir: &Path,
) -> BoxfleetResult<()> {
    ensure_machine_layout(config).await?;
    ensure_sandbox_layout(sandbox_dir).await?;

    // Resolve the assignment first so a stale invocation cannot resurrect a
    // box the control plane no longer places here.
    let assignment = control
        .list_assigned_boxes(config.get_machine_id())
        .await?
        .into_iter()
        .find(|a| a.get_id() == box_id)
        .ok_or_else(|| BoxfleetError::AssignmentGone(box_id.to_string()))?;

    if !assignment.get_enabled() {
        info!("box {} is assigned but disabled, nothing to run", box_id);
        control
            .report_sandbox_status(box_id, SandboxStatus::Stopped)
            .await?;
        return Ok(());
    }

    if let Some(existing) = load_sandbox_info(sandbox_dir).await {
        if existing.get_box_uuid() != assignment.get_uuid() {
            return Err(BoxfleetError::SandboxConflict {
                sandbox: box_id.to_string(),
                existing: existing.get_box_uuid().to_string(),
                requested: assignment.get_uuid().to_string(),
            });
        }
    }

    write_pidfile(sandbox_dir).await?;

    let box_spec = control.get_box_spec(box_id).await?;

    let pool = CidrPool::new(*config.get_cidr_pool(), config.get_work_dir());
    let cidr = pool.reserve(box_id).await?;
    let sandbox_info = SandboxInfo::new(box_id, assignment.get_uuid(), cidr);
    save_sandbox_info(sandbox_dir, &sandbox_info).await?;

    let names = NamesAndAddrs::derive(box_id, cidr)?;
    info!(
        "provisioning sandbox {} in {} ({})",
        box_id,
        names.get_namespace(),
        cidr
    );

    let netns = NetnsHandle::ensure(names.get_namespace()).await?;
    setup_veth(&names).await?;

    let rules = RuleManager::new(names.clone());
    rules.setup().await?;

    let route_mirror = RouteMirror::start(names.clone()).await?;
    route_mirror.settle().await;

    let overrides = DnsOverrides::new();
    overrides.replace(box_spec.get_dns_overrides().clone()).await;
    let dns = DnsProxy::start(&netns, &names, overrides).await?;

    let store = NativeImageStore::new(config.image_store_dir());
    let prepared = store.prepare(box_spec.image_or(config.get_infra_image())).await?;

    let rootfs_dir = sandbox_dir.join(ROOTFS_SUBDIR);
    if !rootfs_dir.is_dir() {
        stage_rootfs(prepared.get_rootfs_dir(), &rootfs_dir).await?;
    }

    let container = container_for(config, sandbox_dir)?;
    let runtime_spec =
        build_runtime_spec(sandbox_dir, &names, prepared.get_manifest(), &box_spec, box_id)?;
    write_runtime_spec(&container.bundle_dir(), &runtime_spec).await?;
    container.ensure_running().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut forwards = PortForwardManager::new(rules);
    forwards
        .sync(box_spec.get_port_forwards(), &shutdown_rx)
        .await?;

    control
        .report_sandbox_status(box_id, SandboxStatus::Running)
        .await?;
    info!("sandbox {} is running", box_id);

    supervise(config, control, box_id, &container, &dns, &mut forwards, &shutdown_rx).await?;

    // Wind down. Rule rotation must not start a new step past this point.
    let _ = shutdown_tx.send(true);

    let stop_result = container.stop_or_kill().await;

    if let Err(e) = dns.shutdown().await {
        warn!("dns proxy shutdown for sandbox {}: {}", box_id, e);
    }
    if let Err(e) = route_mirror.shutdown().await {
        warn!("route mirror shutdown for sandbox {}: {}", box_id, e);
    }

    stop_result?;

    control
        .report_sandbox_status(box_id, SandboxStatus::Stopped)
        .await?;
    remove_pidfile(sandbox_dir).await;
    info!("sandbox {} stopped", box_id);

    Ok(())
}

/// Stays in the foreground until a stop signal, a dropped assignment or a
/// dead container. Each poll re-reads the box spec and applies what changed:
/// DNS overrides take effect on the next lookup, port-forward changes roll
/// through the two-chain rotation.
async fn supervise(
    config: &MachineConfig,
    control: &FileControlPlane,
    box_id: &str,
    container: &ContainerManager,
    dns: &DnsProxy,
    forwards: &mut PortForwardManager,
    shutdown: &watch::Receiver<bool>,
) -> BoxfleetResult<()> {
    let mut sigterm = unix_signal(SignalKind::terminate())?;
    let mut sigint = unix_signal(SignalKind::interrupt())?;

    let period = config.poll_interval();
    let mut ticks = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("sandbox {} received SIGTERM, winding down", box_id);
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("sandbox {} received SIGINT, winding down", box_id);
                return Ok(());
            }
            _ = ticks.tick() => {
                match control.get_box_spec(box_id).await {
                    Ok(spec) => {
                        dns.overrides().replace(spec.get_dns_overrides().clone()).await;
                        match forwards.sync(spec.get_port_forwards(), shutdown).await {
                            Ok(true) => info!("sandbox {} port forwards rotated", box_id),
                            Ok(false) => {}
                            Err(e) => {
                                warn!("port-forward refresh for sandbox {} failed: {}", box_id, e);
                            }
                        }
                    }
                    Err(BoxfleetError::AssignmentGone(_)) => {
                        info!("box {} is no longer assigned, winding down", box_id);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("control plane unavailable, keeping last spec for {}: {}", box_id, e);
                    }
                }

                match container.is_running().await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("container of sandbox {} is no longer running", box_id);
                        return Ok(());
                    }
                    Err(e) => warn!("container probe for sandbox {} failed: {}", box_id, e),
                }
            }
        }
    }
}

async fn inspect(config: &MachineConfig, box_id: &str) -> SandboxListing {
    let sandbox_dir = sandbox_dir(config.get_work_dir(), box_id);

    let runner_alive = match read_pidfile(&sandbox_dir).await {
        Some(pid) => process_alive(pid),
        None => false,
    };
    let cidr = load_sandbox_info(&sandbox_dir)
        .await
        .map(|info| info.get_cidr());

    let status = match container_for(config, &sandbox_dir) {
        Ok(container) => match container.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!("status probe for sandbox {} failed: {}", box_id, e);
                ContainerStatus::Other("unknown".to_string())
            }
        },
        Err(e) => {
            warn!("status probe for sandbox {} failed: {}", box_id, e);
            ContainerStatus::Other("unknown".to_string())
        }
    };

    SandboxListing {
        box_id: box_id.to_string(),
        status,
        runner_alive,
        cidr,
    }
}

fn container_for(config: &MachineConfig, sandbox_dir: &Path) -> BoxfleetResult<ContainerManager> {
    let runtime = OciRuntime::new(
        config.get_oci_runtime(),
        sandbox_dir.join(RUNTIME_STATE_SUBDIR),
    )?;
    Ok(ContainerManager::new(runtime, sandbox_dir))
}

fn placeholder_cidr(config: &MachineConfig) -> Ipv4Network {
    Ipv4Network::new(config.get_cidr_pool().network(), RESERVATION_PREFIX)
        .unwrap_or(*config.get_cidr_pool())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
