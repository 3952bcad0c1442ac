//! Tails supervised process output into the store and out to live
//! subscribers.
//!
//! The persisted stream offset only ever covers complete lines, so a restart
//! resumes exactly after the last stored line. One pump runs per queue entry
//! no matter how many processes write to its files.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use runq_core::{lock_unpoisoned, now_ms, LogSource, NewLogLine, TaskLog};
use runq_storage::Store;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::supervisor::ProcessHandle;

const MAX_CHUNK: usize = 256 * 1024;
const BACKFILL_BATCH: usize = 500;

struct Tail {
    source: LogSource,
    path: PathBuf,
    offset: u64,
}

/// Live state of one entry's pump.
struct Pump {
    sender: broadcast::Sender<TaskLog>,
    // appended to only; the length tells the pump whether it saw them all
    handles: Vec<ProcessHandle>,
    done: watch::Receiver<bool>,
}

/// Captures output of supervised processes.
pub struct OutputStreamer {
    store: Arc<dyn Store>,
    poll: Duration,
    capacity: usize,
    pumps: Mutex<HashMap<String, Pump>>,
}

impl OutputStreamer {
    /// Streamer polling files every `poll`, with `capacity` lines of live buffer per entry.
    pub fn new(store: Arc<dyn Store>, poll: Duration, capacity: usize) -> Self {
        Self {
            store,
            poll,
            capacity,
            pumps: Mutex::new(HashMap::new()),
        }
    }

    /// Start pumping `handle`'s output files. When a pump for the same entry
    /// is already running, the process joins it instead. The returned task
    /// ends once every joined process exited and the files are drained.
    pub fn attach(self: &Arc<Self>, handle: &ProcessHandle) -> JoinHandle<()> {
        let task_id = handle.task_id.to_string();
        let mut pumps = lock_unpoisoned(&self.pumps);
        if let Some(pump) = pumps.get_mut(&task_id) {
            pump.handles.push(handle.clone());
            tracing::debug!(queue_id = %task_id, pid = handle.pid, "process joined running output pump");
            let mut done = pump.done.clone();
            return tokio::spawn(async move {
                // sender dropped means the pump is gone too
                let _ = done.wait_for(|finished| *finished).await;
            });
        }

        let (sender, _) = broadcast::channel(self.capacity);
        let (done_tx, done) = watch::channel(false);
        pumps.insert(
            task_id.clone(),
            Pump {
                sender,
                handles: vec![handle.clone()],
                done,
            },
        );
        drop(pumps);

        let this = Arc::clone(self);
        let files = (handle.stdout_path.clone(), handle.stderr_path.clone());
        tokio::spawn(async move {
            if let Err(e) = this.pump(&task_id, files).await {
                tracing::warn!(queue_id = %task_id, error = %e, "output pump stopped");
                lock_unpoisoned(&this.pumps).remove(&task_id);
            }
            done_tx.send_replace(true);
        })
    }

    async fn pump(&self, task_id: &str, (stdout, stderr): (PathBuf, PathBuf)) -> anyhow::Result<()> {
        let mut tails = [
            Tail {
                source: LogSource::Stdout,
                offset: self.store.stream_offset(task_id, LogSource::Stdout)?,
                path: stdout,
            },
            Tail {
                source: LogSource::Stderr,
                offset: self.store.stream_offset(task_id, LogSource::Stderr)?,
                path: stderr,
            },
        ];
        loop {
            let handles = self.joined(task_id);
            let exited = handles.iter().all(ProcessHandle::has_exited);
            for tail in &mut tails {
                self.drain(task_id, tail, exited).await?;
            }
            if exited && self.finish(task_id, handles.len()) {
                tracing::debug!(queue_id = %task_id, processes = handles.len(), "output drained");
                return Ok(());
            }
            match handles.iter().find(|h| !h.has_exited()) {
                Some(live) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll) => {}
                        _ = live.wait() => {}
                    }
                }
                None => tokio::time::sleep(self.poll).await,
            }
        }
    }

    fn joined(&self, task_id: &str) -> Vec<ProcessHandle> {
        lock_unpoisoned(&self.pumps)
            .get(task_id)
            .map(|p| p.handles.clone())
            .unwrap_or_default()
    }

    /// Retire the pump unless a process joined after `seen` were drained.
    fn finish(&self, task_id: &str, seen: usize) -> bool {
        let mut pumps = lock_unpoisoned(&self.pumps);
        if pumps.get(task_id).is_some_and(|p| p.handles.len() > seen) {
            return false;
        }
        pumps.remove(task_id);
        true
    }

    /// Persist every complete line past the tail's offset. With `flush`, a
    /// trailing unterminated fragment is persisted as a line too.
    async fn drain(&self, task_id: &str, tail: &mut Tail, flush: bool) -> anyhow::Result<()> {
        loop {
            let chunk = read_chunk(&tail.path, tail.offset).await?;
            if chunk.is_empty() {
                return Ok(());
            }
            let full = chunk.len() == MAX_CHUNK;
            let (mut lines, mut consumed) = split_lines(&chunk);
            if consumed < chunk.len() && ((consumed == 0 && full) || (flush && !full)) {
                // overlong line, or the final fragment after exit
                lines.push(decode_line(&chunk[consumed..]));
                consumed = chunk.len();
            }
            if consumed > 0 {
                let offset = tail.offset + consumed as u64;
                self.persist(task_id, tail.source, lines, offset)?;
                tail.offset = offset;
            }
            if !full {
                return Ok(());
            }
        }
    }

    fn persist(&self, task_id: &str, source: LogSource, lines: Vec<String>, offset: u64) -> anyhow::Result<()> {
        let timestamp = now_ms();
        let batch: Vec<NewLogLine> = lines
            .into_iter()
            .map(|line| NewLogLine { timestamp, line })
            .collect();
        let stored = self.store.append_logs(task_id, source, &batch, offset)?;
        if let Some(pump) = lock_unpoisoned(&self.pumps).get(task_id) {
            let tx = &pump.sender;
            for row in stored {
                // no receivers is fine
                let _ = tx.send(row);
            }
        }
        Ok(())
    }

    /// Follow lines of `task_id` with id greater than `after_id`: stored ones
    /// first, then live ones, without gaps or duplicates.
    ///
    /// Only a pump that is running at call time is followed. A subscription
    /// taken before the entry's first process was attached (still queued, or
    /// between two runs) ends once the stored lines are returned; callers
    /// that want live output re-subscribe from [`LogSubscription::last_seen`]
    /// while [`OutputStreamer::is_streaming`] is true.
    pub fn subscribe(&self, task_id: &str, after_id: i64) -> LogSubscription {
        let rx = lock_unpoisoned(&self.pumps)
            .get(task_id)
            .map(|pump| pump.sender.subscribe());
        LogSubscription {
            store: Arc::clone(&self.store),
            task_id: task_id.to_string(),
            last_seen: after_id,
            backlog: VecDeque::new(),
            backfill: true,
            rx,
        }
    }

    /// Stored lines after a watermark.
    pub fn read(&self, task_id: &str, after_id: i64, limit: usize) -> anyhow::Result<Vec<TaskLog>> {
        self.store.logs_after(task_id, after_id, limit)
    }

    /// Whether a pump is currently attached for `task_id`.
    pub fn is_streaming(&self, task_id: &str) -> bool {
        lock_unpoisoned(&self.pumps).contains_key(task_id)
    }
}

/// Cursor over one task's log lines. See [`OutputStreamer::subscribe`].
pub struct LogSubscription {
    store: Arc<dyn Store>,
    task_id: String,
    last_seen: i64,
    backlog: VecDeque<TaskLog>,
    backfill: bool,
    rx: Option<broadcast::Receiver<TaskLog>>,
}

impl LogSubscription {
    /// Next line, or `None` once the task stopped streaming and everything
    /// stored has been returned.
    pub async fn next(&mut self) -> anyhow::Result<Option<TaskLog>> {
        loop {
            while let Some(line) = self.backlog.pop_front() {
                if line.id > self.last_seen {
                    self.last_seen = line.id;
                    return Ok(Some(line));
                }
            }
            if self.backfill {
                let rows = self.store.logs_after(&self.task_id, self.last_seen, BACKFILL_BATCH)?;
                self.backfill = rows.len() == BACKFILL_BATCH;
                if !rows.is_empty() {
                    self.backlog.extend(rows);
                    continue;
                }
            }
            let Some(rx) = self.rx.as_mut() else {
                return Ok(None);
            };
            match rx.recv().await {
                Ok(line) if line.id > self.last_seen => {
                    self.last_seen = line.id;
                    return Ok(Some(line));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(queue_id = %self.task_id, skipped, "log subscriber lagged; backfilling");
                    self.backfill = true;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    self.backfill = true;
                }
            }
        }
    }

    /// Highest id returned so far.
    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }
}

async fn read_chunk(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.take(MAX_CHUNK as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Complete lines in `buf` and the number of bytes they span, newline
/// included.
fn split_lines(buf: &[u8]) -> (Vec<String>, usize) {
    let Some(last) = buf.iter().rposition(|b| *b == b'\n') else {
        return (Vec::new(), 0);
    };
    let lines = buf[..last].split(|b| *b == b'\n').map(decode_line).collect();
    (lines, last + 1)
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
