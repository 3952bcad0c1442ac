//! Periodic merge loop and the git worktree merge source.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use runq_core::{lock_unpoisoned, Event};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{EventBus, PublishOptions};
use crate::dispatcher::raised;

/// A finished unit of work waiting to be merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkUnit {
    /// Directory name of the unit.
    pub name: String,
    /// Branch holding the unit's commits.
    pub branch: String,
    /// Worktree path.
    pub path: PathBuf,
}

/// Result of merging one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The branch is merged.
    Merged,
    /// The merge was rolled back.
    Conflict {
        /// What the merge tool reported.
        detail: String,
    },
}

/// Where the merge loop finds work and how it merges it.
#[async_trait]
pub trait MergeSource: Send + Sync {
    /// Units that are complete and not yet attempted.
    async fn completed_units(&self) -> anyhow::Result<Vec<WorkUnit>>;
    /// Merge one unit. An error leaves the unit to be retried next tick.
    async fn merge(&self, unit: &WorkUnit) -> anyhow::Result<MergeOutcome>;
}

/// Counts for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopTickReport {
    /// Units returned by the scan.
    pub scanned: usize,
    /// Units merged.
    pub merged: usize,
    /// Units that conflicted or errored.
    pub failed: usize,
}

/// Runs a [`MergeSource`] on a fixed interval, independent of the
/// dispatcher's concurrency ceiling.
pub struct LoopsManager {
    source: Arc<dyn MergeSource>,
    bus: Arc<EventBus>,
    interval: Duration,
    tick_lock: tokio::sync::Mutex<()>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LoopsManager {
    /// Create a stopped loop.
    pub fn new(source: Arc<dyn MergeSource>, bus: Arc<EventBus>, interval: Duration) -> Self {
        Self {
            source,
            bus,
            interval,
            tick_lock: tokio::sync::Mutex::new(()),
            stop: watch::Sender::new(false),
            handle: Mutex::new(None),
        }
    }

    /// One tick. Waits for a tick already in progress.
    pub async fn run_once(&self) -> LoopTickReport {
        let _tick = self.tick_lock.lock().await;
        let mut report = LoopTickReport::default();

        let units = match self.source.completed_units().await {
            Ok(units) => units,
            Err(e) => {
                tracing::warn!(error = %e, "merge scan failed");
                self.emit("loops.scan.failed", json!({ "error": format!("{e:#}") }));
                return report;
            }
        };
        report.scanned = units.len();

        for unit in &units {
            match self.source.merge(unit).await {
                Ok(MergeOutcome::Merged) => {
                    tracing::info!(unit = %unit.name, branch = %unit.branch, "unit merged");
                    report.merged += 1;
                    self.emit(
                        "loops.merge.succeeded",
                        json!({ "unit": unit.name, "branch": unit.branch }),
                    );
                }
                Ok(MergeOutcome::Conflict { detail }) => {
                    tracing::warn!(unit = %unit.name, branch = %unit.branch, "merge conflict");
                    report.failed += 1;
                    self.emit(
                        "loops.merge.failed",
                        json!({ "unit": unit.name, "branch": unit.branch, "conflict": true, "error": detail }),
                    );
                }
                Err(e) => {
                    tracing::warn!(unit = %unit.name, branch = %unit.branch, error = %e, "merge failed");
                    report.failed += 1;
                    self.emit(
                        "loops.merge.failed",
                        json!({ "unit": unit.name, "branch": unit.branch, "conflict": false, "error": format!("{e:#}") }),
                    );
                }
            }
        }
        report
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value) {
        self.bus
            .publish(Event::new(event_type, payload), PublishOptions::default());
    }

    /// Spawn the interval loop. The first tick fires one interval from now.
    pub fn start(self: &Arc<Self>) {
        let mut handle = lock_unpoisoned(&self.handle);
        if handle.is_some() {
            return;
        }
        self.stop.send_replace(false);
        let this = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        *handle = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + this.interval;
            let mut tick = tokio::time::interval_at(start, this.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = raised(&mut stop) => break,
                }
                let report = this.run_once().await;
                if report.scanned > 0 {
                    tracing::info!(scanned = report.scanned, merged = report.merged, failed = report.failed, "merge tick");
                }
            }
        }));
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "merge loop started");
    }

    /// Stop the loop, letting a tick in progress finish.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        let handle = lock_unpoisoned(&self.handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "merge loop ended abnormally");
            }
            tracing::info!("merge loop stopped");
        }
    }
}

const MERGED_PREFIX: &str = "merged ";
const CONFLICT_PREFIX: &str = "conflict ";

/// Merges branches of finished git worktrees into the main checkout.
///
/// A unit is a directory under `worktrees_root` containing the marker file.
/// The marker's first line names the branch. After an attempt the marker is
/// rewritten to `merged <branch>` or `conflict <branch>` so it is not picked
/// up again.
#[derive(Debug, Clone)]
pub struct GitWorktreeMerger {
    repo_root: PathBuf,
    worktrees_root: PathBuf,
    marker: String,
}

impl GitWorktreeMerger {
    /// Merger for `repo_root`, scanning `worktrees_root` for `marker` files.
    pub fn new(repo_root: PathBuf, worktrees_root: PathBuf, marker: impl Into<String>) -> Self {
        Self {
            repo_root,
            worktrees_root,
            marker: marker.into(),
        }
    }

    async fn write_marker(&self, unit: &WorkUnit, contents: String) -> anyhow::Result<()> {
        let path = unit.path.join(&self.marker);
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("rewrite marker {}", path.display()))
    }
}

async fn git(dir: &Path, args: &[&str]) -> anyhow::Result<Output> {
    tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("run git {}", args.join(" ")))
}

fn combined_output(out: &Output) -> String {
    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    format!("{}\n{}", stdout.trim(), stderr.trim()).trim().to_string()
}

#[async_trait]
impl MergeSource for GitWorktreeMerger {
    async fn completed_units(&self) -> anyhow::Result<Vec<WorkUnit>> {
        let mut dir = tokio::fs::read_dir(&self.worktrees_root)
            .await
            .with_context(|| format!("read worktrees root {}", self.worktrees_root.display()))?;
        let mut units = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            let marker = path.join(&self.marker);
            let contents = match tokio::fs::read_to_string(&marker).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(marker = %marker.display(), error = %e, "unreadable marker");
                    continue;
                }
            };
            let first = contents.lines().next().unwrap_or("").trim();
            if first.is_empty() {
                tracing::warn!(marker = %marker.display(), "marker does not name a branch");
                continue;
            }
            if first.starts_with(MERGED_PREFIX) || first.starts_with(CONFLICT_PREFIX) {
                continue;
            }
            units.push(WorkUnit {
                name: entry.file_name().to_string_lossy().into_owned(),
                branch: first.to_string(),
                path,
            });
        }
        units.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(units)
    }

    async fn merge(&self, unit: &WorkUnit) -> anyhow::Result<MergeOutcome> {
        let out = git(&self.repo_root, &["merge", "--no-ff", "--no-edit", &unit.branch]).await?;
        if out.status.success() {
            self.write_marker(unit, format!("{MERGED_PREFIX}{}\n", unit.branch))
                .await?;
            return Ok(MergeOutcome::Merged);
        }

        let detail = combined_output(&out);
        let in_progress = self.repo_root.join(".git").join("MERGE_HEAD").exists();
        if !in_progress {
            // refused before touching the tree (unknown branch, dirty checkout)
            anyhow::bail!("git merge {} failed: {detail}", unit.branch);
        }

        let abort = git(&self.repo_root, &["merge", "--abort"]).await?;
        if !abort.status.success() {
            anyhow::bail!(
                "git merge --abort after conflict on {} failed: {}",
                unit.branch,
                combined_output(&abort)
            );
        }
        self.write_marker(unit, format!("{CONFLICT_PREFIX}{}\n{detail}\n", unit.branch))
            .await?;
        Ok(MergeOutcome::Conflict { detail })
    }
}
