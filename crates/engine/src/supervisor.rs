//! Spawn, terminate and reattach the OS processes behind queue entries.
//!
//! Each child runs in its own process group and writes stdout/stderr to files
//! under `<logs_root>/<queue id>/`. A restarted engine can therefore find the
//! process again by pid and keep reading its output.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use runq_core::{lock_unpoisoned, ProcessFingerprint, QueueId};
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, RefreshKind, System};
use tokio::sync::watch;

use crate::error::SupervisorError;

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnSpec {
    /// Executable, resolved through `PATH`.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SpawnSpec {
    /// Shell-like rendering, recorded in the fingerprint.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    /// Exit code, when the process exited normally and we reaped it.
    pub code: Option<i32>,
    /// Terminating signal, when known.
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Exit of a process we were not the parent of.
    pub const UNKNOWN: ProcessExit = ProcessExit { code: None, signal: None };
}

/// Graceful signal sent before SIGKILL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl TermSignal {
    fn as_nix(self) -> Signal {
        match self {
            TermSignal::Interrupt => Signal::SIGINT,
            TermSignal::Terminate => Signal::SIGTERM,
        }
    }
}

/// A live (or recently exited) supervised process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    /// Process id, also the process group id.
    pub pid: u32,
    /// Owning queue entry.
    pub task_id: QueueId,
    /// Identity recorded for restart checks.
    pub fingerprint: ProcessFingerprint,
    /// File receiving stdout.
    pub stdout_path: PathBuf,
    /// File receiving stderr.
    pub stderr_path: PathBuf,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    /// Resolves once the process is gone.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit.clone();
        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // watcher dropped without a verdict
                return ProcessExit::UNKNOWN;
            }
        }
    }

    /// Exit record, if the process already ended.
    pub fn try_exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Whether the exit was observed.
    pub fn has_exited(&self) -> bool {
        self.try_exit().is_some()
    }
}

/// Outcome of [`ProcessSupervisor::reconcile`].
#[derive(Debug)]
pub enum Reconciliation {
    /// The recorded process is still ours to supervise.
    Reattached(ProcessHandle),
    /// It is gone or was replaced; the reason is user-facing.
    Lost(String),
}

struct Observed {
    start_time_secs: u64,
    status: ProcessStatus,
}

type Registry = Mutex<HashMap<QueueId, Vec<ProcessHandle>>>;

/// The registry here is the only mapping from queue entry to live processes.
/// An entry may own several processes; they share the entry's output files.
pub struct ProcessSupervisor {
    logs_root: PathBuf,
    terminate_grace: Duration,
    liveness_poll: Duration,
    registry: Arc<Registry>,
}

impl ProcessSupervisor {
    /// Supervisor writing output under `logs_root`.
    pub fn new(logs_root: PathBuf, terminate_grace: Duration, liveness_poll: Duration) -> Self {
        Self {
            logs_root,
            terminate_grace,
            liveness_poll,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Directory holding the output files for `task_id`.
    pub fn output_dir(&self, task_id: &QueueId) -> PathBuf {
        self.logs_root.join(sanitize_component(task_id.as_str()))
    }

    /// Start `spec` for `task_id` in a fresh process group.
    pub async fn spawn(&self, task_id: &QueueId, spec: &SpawnSpec) -> Result<ProcessHandle, SupervisorError> {
        let dir = self.output_dir(task_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SupervisorError::OutputFiles { path: dir.clone(), source })?;
        let stdout_path = dir.join("stdout.log");
        let stderr_path = dir.join("stderr.log");
        let stdout = open_append(&stdout_path)?;
        let stderr = open_append(&stderr_path)?;

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(false);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            program: spec.program.clone(),
            source: std::io::Error::other("process exited before its pid was read"),
        })?;

        let start_time_secs = observe(pid).await.map(|o| o.start_time_secs);
        let fingerprint = ProcessFingerprint {
            start_time_secs,
            command: spec.command_line(),
        };

        let (tx, rx) = watch::channel(None);
        let handle = ProcessHandle {
            pid,
            task_id: task_id.clone(),
            fingerprint,
            stdout_path,
            stderr_path,
            exit: rx,
        };
        self.register(&handle);

        let registry = Arc::clone(&self.registry);
        let owner = task_id.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ProcessExit {
                    code: status.code(),
                    signal: status.signal(),
                },
                Err(e) => {
                    tracing::warn!(queue_id = %owner, pid, error = %e, "wait on child failed");
                    ProcessExit::UNKNOWN
                }
            };
            tracing::debug!(queue_id = %owner, pid, code = ?exit.code, signal = ?exit.signal, "process exited");
            tx.send_replace(Some(exit));
            unregister(&registry, &owner, pid);
        });

        tracing::info!(queue_id = %task_id, pid, program = %spec.program, "process spawned");
        Ok(handle)
    }

    /// Check whether a pid recorded before a restart still belongs to
    /// `task_id`. A live, non-zombie process whose start time is within one
    /// second of the recorded one is reattached; its exit is detected by
    /// polling. Pid reuse within that second is not detected.
    pub async fn reconcile(
        &self,
        task_id: &QueueId,
        pid: u32,
        fingerprint: Option<&ProcessFingerprint>,
    ) -> Reconciliation {
        if pid == 0 || i32::try_from(pid).is_err() {
            return Reconciliation::Lost(format!("recorded pid {pid} is not a valid process id"));
        }
        let Some(observed) = observe(pid).await else {
            return Reconciliation::Lost(format!("process {pid} is no longer running"));
        };
        if matches!(observed.status, ProcessStatus::Zombie | ProcessStatus::Dead) {
            return Reconciliation::Lost(format!("process {pid} has exited"));
        }
        match fingerprint.and_then(|f| f.start_time_secs) {
            Some(recorded) if recorded.abs_diff(observed.start_time_secs) > 1 => {
                return Reconciliation::Lost(format!(
                    "pid {pid} now belongs to a different process (started at {}, expected {recorded})",
                    observed.start_time_secs
                ));
            }
            Some(_) => {}
            None => {
                tracing::warn!(queue_id = %task_id, pid, "no start time recorded; reattaching on liveness alone");
            }
        }

        let dir = self.output_dir(task_id);
        let (tx, rx) = watch::channel(None);
        let handle = ProcessHandle {
            pid,
            task_id: task_id.clone(),
            fingerprint: fingerprint.cloned().unwrap_or_default(),
            stdout_path: dir.join("stdout.log"),
            stderr_path: dir.join("stderr.log"),
            exit: rx,
        };
        self.register(&handle);

        let registry = Arc::clone(&self.registry);
        let owner = task_id.clone();
        let period = self.liveness_poll;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                if !is_alive(pid) {
                    break;
                }
            }
            tracing::debug!(queue_id = %owner, pid, "reattached process is gone");
            tx.send_replace(Some(ProcessExit::UNKNOWN));
            unregister(&registry, &owner, pid);
        });

        tracing::info!(queue_id = %task_id, pid, "process reattached");
        Reconciliation::Reattached(handle)
    }

    /// A handle for output left behind by a process that is already gone, so
    /// the streamer can drain it.
    pub fn finished_handle(&self, task_id: &QueueId, pid: Option<u32>) -> ProcessHandle {
        let dir = self.output_dir(task_id);
        let (_tx, rx) = watch::channel(Some(ProcessExit::UNKNOWN));
        ProcessHandle {
            pid: pid.unwrap_or(0),
            task_id: task_id.clone(),
            fingerprint: ProcessFingerprint::default(),
            stdout_path: dir.join("stdout.log"),
            stderr_path: dir.join("stderr.log"),
            exit: rx,
        }
    }

    /// Signal the process group, wait the grace period, then SIGKILL.
    pub async fn terminate(&self, handle: &ProcessHandle, signal: TermSignal) -> Result<ProcessExit, SupervisorError> {
        self.terminate_all(std::slice::from_ref(handle), signal).await?;
        Ok(handle.try_exit().unwrap_or(ProcessExit::UNKNOWN))
    }

    /// Terminate every process registered for `task_id`. Returns how many
    /// were.
    pub async fn terminate_task(&self, task_id: &QueueId) -> Result<usize, SupervisorError> {
        let handles = self.handles(task_id);
        self.terminate_all(&handles, TermSignal::Terminate).await?;
        Ok(handles.len())
    }

    /// All groups are signalled before any grace period starts, so several
    /// processes share one deadline per stage.
    async fn terminate_all(&self, handles: &[ProcessHandle], signal: TermSignal) -> Result<(), SupervisorError> {
        let live: Vec<&ProcessHandle> = handles.iter().filter(|h| !h.has_exited()).collect();
        if live.is_empty() {
            return Ok(());
        }
        for handle in &live {
            tracing::info!(queue_id = %handle.task_id, pid = handle.pid, signal = ?signal, "terminating process");
            signal_group(handle.pid, signal.as_nix())?;
        }
        if self.wait_all(&live).await {
            return Ok(());
        }

        let survivors: Vec<&ProcessHandle> = live.into_iter().filter(|h| !h.has_exited()).collect();
        for handle in &survivors {
            tracing::warn!(queue_id = %handle.task_id, pid = handle.pid, "grace period elapsed; sending SIGKILL");
            signal_group(handle.pid, Signal::SIGKILL)?;
        }
        if !self.wait_all(&survivors).await {
            for handle in survivors.iter().filter(|h| !h.has_exited()) {
                tracing::error!(queue_id = %handle.task_id, pid = handle.pid, "process survived SIGKILL");
            }
        }
        Ok(())
    }

    /// Wait up to one grace period for every handle. True if all exited.
    async fn wait_all(&self, handles: &[&ProcessHandle]) -> bool {
        let deadline = tokio::time::Instant::now() + self.terminate_grace;
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle.wait()).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Registered processes of `task_id`, oldest first.
    pub fn handles(&self, task_id: &QueueId) -> Vec<ProcessHandle> {
        lock_unpoisoned(&self.registry)
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of registered processes across all entries.
    pub fn live_count(&self) -> usize {
        lock_unpoisoned(&self.registry).values().map(Vec::len).sum()
    }

    fn register(&self, handle: &ProcessHandle) {
        let mut registry = lock_unpoisoned(&self.registry);
        let owned = registry.entry(handle.task_id.clone()).or_default();
        if !owned.is_empty() {
            tracing::debug!(queue_id = %handle.task_id, pid = handle.pid, running = owned.len(), "entry owns several processes");
        }
        owned.push(handle.clone());
    }
}

fn unregister(registry: &Registry, task_id: &QueueId, pid: u32) {
    let mut registry = lock_unpoisoned(registry);
    if let Some(owned) = registry.get_mut(task_id) {
        owned.retain(|h| h.pid != pid);
        if owned.is_empty() {
            registry.remove(task_id);
        }
    }
}

fn open_append(path: &Path) -> Result<std::fs::File, SupervisorError> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| SupervisorError::OutputFiles {
            path: path.to_path_buf(),
            source,
        })
}

/// Group first; fall back to the single pid when the group is gone or not
/// ours. A vanished process is not an error.
fn signal_group(pid: u32, signal: Signal) -> Result<(), SupervisorError> {
    let target = Pid::from_raw(pid as i32);
    match killpg(target, signal) {
        Ok(()) => return Ok(()),
        Err(Errno::ESRCH) | Err(Errno::EPERM) => {}
        Err(source) => {
            return Err(SupervisorError::Signal { pid, signal: signal.as_str(), source });
        }
    }
    match kill(target, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(SupervisorError::Signal { pid, signal: signal.as_str(), source }),
    }
}

fn is_alive(pid: u32) -> bool {
    // EPERM: exists but belongs to someone else
    matches!(kill(Pid::from_raw(pid as i32), None::<Signal>), Ok(()) | Err(Errno::EPERM))
}

async fn observe(pid: u32) -> Option<Observed> {
    let join = tokio::task::spawn_blocking(move || {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = System::new_with_specifics(RefreshKind::nothing());
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, ProcessRefreshKind::nothing());
        system.process(pid).map(|p| Observed {
            start_time_secs: p.start_time(),
            status: p.status(),
        })
    });
    match join.await {
        Ok(observed) => observed,
        Err(e) => {
            tracing::warn!(pid, error = %e, "process probe failed");
            None
        }
    }
}

fn sanitize_component(s: &str) -> String {
    s.replace(['/', '\\', ':'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> SpawnSpec {
        SpawnSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    fn supervisor(root: &Path) -> ProcessSupervisor {
        ProcessSupervisor::new(root.to_path_buf(), Duration::from_millis(500), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn spawn_writes_output_files_and_reports_exit() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        let id = QueueId::from_string("q1");
        let handle = sup.spawn(&id, &sh("echo out; echo err >&2; exit 3")).await.unwrap();
        assert!(handle.fingerprint.start_time_secs.is_some());
        assert_eq!(handle.fingerprint.command, "sh -c echo out; echo err >&2; exit 3");

        let exit = handle.wait().await;
        assert_eq!(exit.code, Some(3));
        assert_eq!(std::fs::read_to_string(&handle.stdout_path).unwrap(), "out\n");
        assert_eq!(std::fs::read_to_string(&handle.stderr_path).unwrap(), "err\n");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sup.live_count(), 0);
    }

    #[tokio::test]
    async fn spawn_failure_is_typed() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        let spec = SpawnSpec {
            program: "/definitely/not/a/program".into(),
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
        };
        let err = sup.spawn(&QueueId::from_string("q1"), &spec).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn terminate_escalates_to_sigkill() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        let id = QueueId::from_string("stubborn");
        let handle = sup.spawn(&id, &sh("trap '' TERM; sleep 30")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sup.terminate_task(&id).await.unwrap(), 1);
        let exit = handle.wait().await;
        assert_eq!(exit.signal, Some(Signal::SIGKILL as i32));
        assert_eq!(sup.terminate_task(&QueueId::from_string("unknown")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn terminate_task_reaches_every_process_of_the_entry() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        let id = QueueId::from_string("pair");
        let first = sup.spawn(&id, &sh("sleep 30")).await.unwrap();
        let second = sup.spawn(&id, &sh("sleep 30")).await.unwrap();
        assert_eq!(sup.live_count(), 2);
        assert_eq!(sup.handles(&id).len(), 2);

        assert_eq!(sup.terminate_task(&id).await.unwrap(), 2);
        assert_eq!(first.wait().await.signal, Some(Signal::SIGTERM as i32));
        assert_eq!(second.wait().await.signal, Some(Signal::SIGTERM as i32));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sup.live_count(), 0);
        assert!(sup.handles(&id).is_empty());
    }

    #[tokio::test]
    async fn reconcile_dead_pid_is_lost() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        let id = QueueId::from_string("q1");
        match sup.reconcile(&id, i32::MAX as u32, None).await {
            Reconciliation::Lost(reason) => assert!(reason.contains("no longer running")),
            Reconciliation::Reattached(_) => panic!("pid should not exist"),
        }
        assert!(matches!(sup.reconcile(&id, 0, None).await, Reconciliation::Lost(_)));
    }

    #[tokio::test]
    async fn reconcile_rejects_mismatched_start_time() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        let id = QueueId::from_string("q1");
        let handle = sup.spawn(&id, &sh("sleep 5")).await.unwrap();
        let stale = ProcessFingerprint {
            start_time_secs: handle.fingerprint.start_time_secs.map(|s| s - 3600),
            command: handle.fingerprint.command.clone(),
        };
        let other = supervisor(dir.path());
        assert!(matches!(other.reconcile(&id, handle.pid, Some(&stale)).await, Reconciliation::Lost(_)));
        sup.terminate(&handle, TermSignal::Terminate).await.unwrap();
    }

    #[tokio::test]
    async fn reattached_process_exit_is_detected_by_polling() {
        let dir = tempdir().unwrap();
        let original = supervisor(dir.path());
        let id = QueueId::from_string("q1");
        let spawned = original.spawn(&id, &sh("sleep 30")).await.unwrap();

        let restarted = supervisor(dir.path());
        let Reconciliation::Reattached(handle) =
            restarted.reconcile(&id, spawned.pid, Some(&spawned.fingerprint)).await
        else {
            panic!("live process should reattach");
        };
        assert_eq!(handle.stdout_path, spawned.stdout_path);
        assert!(!handle.has_exited());

        restarted.terminate(&handle, TermSignal::Terminate).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.unwrap();
        assert_eq!(exit, ProcessExit::UNKNOWN);
    }
}
