//! The per-machine reconciliation loop.
//!
//! A single-threaded loop compares the boxes the control plane assigns to
//! this machine against the sandboxes that exist on disk, then closes the
//! gap: every enabled box without a healthy sandbox gets a detached
//! run-process, every sandbox the control plane no longer wants gets stopped
//! and removed. Lifecycle work always happens in subprocesses so a wedged
//! sandbox cannot take the loop down with it.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use rand::Rng;
use tokio::{
    process::Command,
    signal::unix::{signal as unix_signal, SignalKind},
    time::sleep,
};
use tracing::{info, warn};

use crate::{
    config::{MachineConfig, DEFAULT_MACHINE_CONFIG_FILENAME, DEFAULT_STATUS_HEARTBEAT_SECS},
    control::{BoxAssignment, ControlPlane, FileControlPlane, MachineStatus},
    management::{
        sandbox,
        workdir::{ensure_machine_layout, list_sandboxes, runner_log_path},
    },
    utils::sandbox_dir,
    BoxfleetError, BoxfleetResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The minimum cadence at which an unchanged machine status is re-reported.
const STATUS_HEARTBEAT: Duration = Duration::from_secs(DEFAULT_STATUS_HEARTBEAT_SECS);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The actions one reconciliation pass decided on.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReconcilePlan {
    /// Enabled boxes that need a run-process spawned.
    to_start: Vec<String>,

    /// Sandboxes the desired set no longer contains.
    to_remove: Vec<String>,
}

/// Deduplicates machine status reports: a status is only sent when it
/// changed, or when the heartbeat cadence says a repeat is due.
struct StatusReporter {
    last: Option<MachineStatus>,
    last_report: Instant,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ReconcilePlan {
    fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_remove.is_empty()
    }
}

impl StatusReporter {
    fn new() -> Self {
        Self {
            last: None,
            last_report: Instant::now(),
        }
    }

    async fn report(&mut self, control: &FileControlPlane, machine_id: &str, status: MachineStatus) {
        let heartbeat_due = self.last_report.elapsed() >= STATUS_HEARTBEAT;
        if self.last == Some(status) && !heartbeat_due {
            return;
        }

        match control.report_machine_status(machine_id, status).await {
            Ok(()) => {
                self.last = Some(status);
                self.last_report = Instant::now();
            }
            Err(e) => warn!("could not report machine status {}: {}", status, e),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs the reconciliation loop until a stop signal arrives.
///
/// Shutdown runs one final pass against an empty desired set, stopping and
/// removing every sandbox before the process exits.
pub async fn start(config: MachineConfig) -> BoxfleetResult<()> {
    config.validate()?;
    ensure_machine_layout(&config).await?;
    let config_path = persist_config(&config).await?;

    let control = sandbox::control_plane(&config);
    let mut reporter = StatusReporter::new();
    reporter
        .report(&control, config.get_machine_id(), MachineStatus::Starting)
        .await;

    let mut sigterm = unix_signal(SignalKind::terminate())?;
    let mut sigint = unix_signal(SignalKind::interrupt())?;

    info!(
        "machine {} reconciling every {}s",
        config.get_machine_id(),
        config.get_poll_interval_secs()
    );

    loop {
        let status = match reconcile_pass(&config, &control, &config_path, false).await {
            Ok(true) => MachineStatus::Reconciling,
            Ok(false) => MachineStatus::Running,
            Err(e) => {
                warn!("reconciliation pass failed: {}", e);
                MachineStatus::Reconciling
            }
        };
        reporter
            .report(&control, config.get_machine_id(), status)
            .await;

        tokio::select! {
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            _ = sleep(jittered(config.poll_interval())) => {}
        }
    }

    info!(
        "machine {} shutting down, draining sandboxes",
        config.get_machine_id()
    );
    if let Err(e) = reconcile_pass(&config, &control, &config_path, true).await {
        warn!("final drain pass failed: {}", e);
    }

    Ok(())
}

/// Runs one pass and returns whether it changed anything.
async fn reconcile_pass(
    config: &MachineConfig,
    control: &FileControlPlane,
    config_path: &Path,
    drain: bool,
) -> BoxfleetResult<bool> {
    let assignments = if drain {
        Vec::new()
    } else {
        control
            .list_assigned_boxes(config.get_machine_id())
            .await?
    };
    let existing = list_sandboxes(config.get_work_dir()).await?;

    let mut healthy = HashSet::new();
    for assignment in &assignments {
        if !assignment.get_enabled() {
            continue;
        }
        if sandbox::is_healthy(config, assignment.get_id()).await {
            healthy.insert(assignment.get_id().clone());
        }
    }

    let plan = plan_pass(&assignments, &existing, &healthy);
    let changed = !plan.is_empty();

    for box_id in &plan.to_start {
        if let Err(e) = spawn_run(config, config_path, box_id).await {
            warn!("could not spawn run-process for box {}: {}", box_id, e);
        }
    }

    for box_id in &plan.to_remove {
        // Removal is pointless while the container may still be alive.
        if let Err(e) = run_lifecycle(config_path, "stop", box_id).await {
            warn!("sandbox {} stop failed, retrying next pass: {}", box_id, e);
            continue;
        }
        if let Err(e) = run_lifecycle(config_path, "remove", box_id).await {
            warn!("sandbox {} remove failed, retrying next pass: {}", box_id, e);
        }
    }

    Ok(changed)
}

/// Decides what one pass has to do, from desired and observed state alone.
fn plan_pass(
    assignments: &[BoxAssignment],
    existing: &[String],
    healthy: &HashSet<String>,
) -> ReconcilePlan {
    let desired: HashSet<String> = assignments
        .iter()
        .filter(|a| a.get_enabled())
        .map(|a| a.get_id().clone())
        .collect();

    let mut to_start: Vec<String> = desired
        .iter()
        .filter(|id| !healthy.contains(*id))
        .cloned()
        .collect();
    to_start.sort();

    let to_remove: Vec<String> = existing
        .iter()
        .filter(|id| !desired.contains(*id))
        .cloned()
        .collect();

    ReconcilePlan {
        to_start,
        to_remove,
    }
}

/// Spawns the detached run-process for one box.
///
/// The child gets its own session so it survives reconciler restarts; its
/// output lands in the sandbox's `runner.log`.
async fn spawn_run(
    config: &MachineConfig,
    config_path: &Path,
    box_id: &str,
) -> BoxfleetResult<()> {
    let sandbox_dir = sandbox_dir(config.get_work_dir(), box_id);
    tokio::fs::create_dir_all(&sandbox_dir).await?;

    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(runner_log_path(&sandbox_dir))?;

    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command
        .args(["sandbox", "run", "--box", box_id, "--config"])
        .arg(config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log));

    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let child = command.spawn()?;
    if let Some(pid) = child.id() {
        info!("spawned run-process {} for box {}", pid, box_id);
    }

    Ok(())
}

/// Runs an awaited `sandbox stop` or `sandbox remove` subprocess.
async fn run_lifecycle(config_path: &Path, action: &str, box_id: &str) -> BoxfleetResult<()> {
    let exe = std::env::current_exe()?;
    let status = Command::new(exe)
        .args(["sandbox", action, "--box", box_id, "--config"])
        .arg(config_path)
        .status()
        .await?;

    if !status.success() {
        return Err(BoxfleetError::custom(anyhow::anyhow!(
            "sandbox {} subprocess for box {} exited with {}",
            action,
            box_id,
            status
        )));
    }

    Ok(())
}

/// Writes the resolved configuration where lifecycle subprocesses expect it.
async fn persist_config(config: &MachineConfig) -> BoxfleetResult<PathBuf> {
    let path = config
        .get_work_dir()
        .join(DEFAULT_MACHINE_CONFIG_FILENAME);
    let contents = serde_yaml::to_string(config)?;
    tokio::fs::write(&path, contents).await?;
    Ok(path)
}

fn jittered(period: Duration) -> Duration {
    let max_jitter = (period.as_millis() / 10).max(1) as u64;
    period + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn assignment(id: &str, enabled: bool) -> BoxAssignment {
        BoxAssignment::new(id, Uuid::new_v4(), enabled)
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_plan_pass_empty_inputs() {
        let plan = plan_pass(&[], &[], &HashSet::new());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_pass_starts_unhealthy_enabled_boxes() {
        let assignments = [
            assignment("worker", true),
            assignment("api", true),
            assignment("cache", true),
        ];
        let healthy: HashSet<String> = ["cache".to_string()].into();

        let plan = plan_pass(&assignments, &ids(&["api", "cache"]), &healthy);

        assert_eq!(plan.to_start, ids(&["api", "worker"]));
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn test_plan_pass_removes_disabled_and_unassigned() {
        let assignments = [assignment("api", true), assignment("worker", false)];
        let healthy: HashSet<String> = ["api".to_string()].into();

        let plan = plan_pass(
            &assignments,
            &ids(&["api", "orphan", "worker"]),
            &healthy,
        );

        assert!(plan.to_start.is_empty());
        assert_eq!(plan.to_remove, ids(&["orphan", "worker"]));
    }

    #[test]
    fn test_plan_pass_steady_state_is_empty() {
        let assignments = [assignment("api", true)];
        let healthy: HashSet<String> = ["api".to_string()].into();

        let plan = plan_pass(&assignments, &ids(&["api"]), &healthy);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_jittered_stays_within_bounds() {
        let period = Duration::from_secs(5);
        for _ in 0..64 {
            let delay = jittered(period);
            assert!(delay >= period);
            assert!(delay <= period + Duration::from_millis(500));
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_status_reports_deduplicate() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let status_dir = temp.path().join("status");
        let control = FileControlPlane::new(temp.path().join("boxes.yaml"), status_dir.clone());
        let machine_status = status_dir.join("machine.json");

        let mut reporter = StatusReporter::new();
        reporter
            .report(&control, "m-1", MachineStatus::Starting)
            .await;
        assert!(machine_status.is_file());

        // An unchanged status inside the heartbeat window is suppressed.
        tokio::fs::remove_file(&machine_status).await?;
        reporter
            .report(&control, "m-1", MachineStatus::Starting)
            .await;
        assert!(!machine_status.exists());

        // A changed status goes out immediately.
        reporter
            .report(&control, "m-1", MachineStatus::Running)
            .await;
        assert!(machine_status.is_file());

        // An unchanged status past the heartbeat window goes out again.
        tokio::fs::remove_file(&machine_status).await?;
        reporter.last_report = Instant::now() - STATUS_HEARTBEAT - Duration::from_secs(1);
        reporter
            .report(&control, "m-1", MachineStatus::Running)
            .await;
        assert!(machine_status.is_file());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_drain_pass_without_state_changes_nothing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = MachineConfig::builder()
            .machine_id("m-1")
            .work_dir(temp.path().to_path_buf())
            .build();
        let control = sandbox::control_plane(&config);

        // Drain never consults the assignment file, so none is needed.
        let changed = reconcile_pass(&config, &control, &temp.path().join("machine.yaml"), true)
            .await?;
        assert!(!changed);

        Ok(())
    }
}
