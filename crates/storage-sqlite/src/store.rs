use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use runq_core::{
    lock_unpoisoned, EpochMs, LogSource, NewLogLine, ProcessFingerprint, QueueId, QueueState,
    QueuedTask, Task, TaskId, TaskLog, TransitionPatch,
};
use runq_storage::Store;

const QUEUE_COLUMNS: &str = "id, task_type, payload_json, state, priority, enqueued_at, \
     started_at, completed_at, error, failure_kind, retry_count, external_task_id, pid, \
     process_started_at, process_command";

const TASK_COLUMNS: &str = "id, title, status, priority, task_type, created_at, updated_at, \
     started_at, completed_at, error_message, failure_kind, execution_summary, exit_code, \
     duration_ms, queue_id";

/// Durable store on a single SQLite file, WAL journal.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open sqlite db {}", db_path.display()))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        tracing::debug!(path = %db_path.display(), journal_mode = %mode, "opened store");
        Self::init(conn)
    }

    /// A private in-memory database. Same schema, nothing persisted.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).context("apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_col<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_col<T>(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(|s| parse_col(idx, s)).transpose()
}

fn map_queued(r: &Row<'_>) -> rusqlite::Result<QueuedTask> {
    let payload_json: String = r.get(2)?;
    let payload = serde_json::from_str(&payload_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let command: Option<String> = r.get(14)?;
    let process_started_at: Option<i64> = r.get(13)?;
    Ok(QueuedTask {
        id: QueueId::from_string(r.get::<_, String>(0)?),
        task_type: r.get(1)?,
        payload,
        state: parse_col(3, r.get(3)?)?,
        priority: r.get(4)?,
        enqueued_at: r.get(5)?,
        started_at: r.get(6)?,
        completed_at: r.get(7)?,
        error: r.get(8)?,
        failure_kind: parse_opt_col(9, r.get(9)?)?,
        retry_count: r.get::<_, i64>(10)? as u32,
        external_task_id: r.get(11)?,
        pid: r.get::<_, Option<i64>>(12)?.map(|p| p as u32),
        fingerprint: command.map(|command| ProcessFingerprint {
            start_time_secs: process_started_at.map(|s| s as u64),
            command,
        }),
    })
}

fn map_task(r: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: TaskId::from_string(r.get::<_, String>(0)?),
        title: r.get(1)?,
        status: parse_col(2, r.get(2)?)?,
        priority: r.get(3)?,
        task_type: r.get(4)?,
        created_at: r.get(5)?,
        updated_at: r.get(6)?,
        started_at: r.get(7)?,
        completed_at: r.get(8)?,
        error_message: r.get(9)?,
        failure_kind: parse_opt_col(10, r.get(10)?)?,
        execution_summary: r.get(11)?,
        exit_code: r.get(12)?,
        duration_ms: r.get(13)?,
        queue_id: r.get::<_, Option<String>>(14)?.map(QueueId::from_string),
    })
}

fn map_log(r: &Row<'_>) -> rusqlite::Result<TaskLog> {
    Ok(TaskLog {
        id: r.get(0)?,
        task_id: r.get(1)?,
        timestamp: r.get(2)?,
        source: parse_col(3, r.get(3)?)?,
        line: r.get(4)?,
    })
}

impl Store for SqliteStore {
    fn insert_queued(&self, entry: &QueuedTask) -> Result<()> {
        let conn = lock_unpoisoned(&self.conn);
        let payload_json = serde_json::to_string(&entry.payload)?;
        let fingerprint = entry.fingerprint.as_ref();
        conn.execute(
            &format!("INSERT INTO queued_tasks({QUEUE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
            params![
                entry.id.as_str(),
                entry.task_type,
                payload_json,
                entry.state.as_str(),
                entry.priority,
                entry.enqueued_at,
                entry.started_at,
                entry.completed_at,
                entry.error,
                entry.failure_kind.map(|k| k.as_str()),
                entry.retry_count as i64,
                entry.external_task_id,
                entry.pid.map(i64::from),
                fingerprint.and_then(|f| f.start_time_secs).map(|s| s as i64),
                fingerprint.map(|f| f.command.as_str()),
            ],
        )
        .with_context(|| format!("insert queue entry {}", entry.id))?;
        Ok(())
    }

    fn get_queued(&self, id: &QueueId) -> Result<Option<QueuedTask>> {
        let conn = lock_unpoisoned(&self.conn);
        let entry = conn
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM queued_tasks WHERE id=?1"),
                params![id.as_str()],
                map_queued,
            )
            .optional()?;
        Ok(entry)
    }

    fn list_queued(&self) -> Result<Vec<QueuedTask>> {
        let conn = lock_unpoisoned(&self.conn);
        let mut stmt = conn.prepare(&format!("SELECT {QUEUE_COLUMNS} FROM queued_tasks ORDER BY seq"))?;
        let rows = stmt.query_map([], map_queued)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn claim_next_pending(&self, started_at: EpochMs) -> Result<Option<QueuedTask>> {
        let mut conn = lock_unpoisoned(&self.conn);
        let tx = conn.transaction()?;
        let next: Option<String> = tx
            .query_row(
                "SELECT id FROM queued_tasks WHERE state='pending'
                 ORDER BY priority ASC, enqueued_at ASC, seq ASC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        let Some(id) = next else {
            tx.commit()?;
            return Ok(None);
        };
        tx.execute(
            "UPDATE queued_tasks SET state='running', started_at=?1 WHERE id=?2 AND state='pending'",
            params![started_at, id],
        )?;
        let entry = tx.query_row(
            &format!("SELECT {QUEUE_COLUMNS} FROM queued_tasks WHERE id=?1"),
            params![id],
            map_queued,
        )?;
        tx.commit()?;
        Ok(Some(entry))
    }

    fn transition(
        &self,
        id: &QueueId,
        from: QueueState,
        to: QueueState,
        patch: &TransitionPatch,
    ) -> Result<bool> {
        let conn = lock_unpoisoned(&self.conn);
        let changed = conn.execute(
            "UPDATE queued_tasks SET state=?1,
                started_at=COALESCE(?2, started_at),
                completed_at=COALESCE(?3, completed_at),
                error=COALESCE(?4, error),
                failure_kind=COALESCE(?5, failure_kind)
             WHERE id=?6 AND state=?7",
            params![
                to.as_str(),
                patch.started_at,
                patch.completed_at,
                patch.error,
                patch.failure_kind.map(|k| k.as_str()),
                id.as_str(),
                from.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn record_process(&self, id: &QueueId, pid: u32, fingerprint: &ProcessFingerprint) -> Result<bool> {
        let conn = lock_unpoisoned(&self.conn);
        let changed = conn.execute(
            "UPDATE queued_tasks SET pid=?1, process_started_at=?2, process_command=?3
             WHERE id=?4 AND state='running'",
            params![
                i64::from(pid),
                fingerprint.start_time_secs.map(|s| s as i64),
                fingerprint.command,
                id.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            &format!("INSERT INTO tasks({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
            params![
                task.id.as_str(),
                task.title,
                task.status.as_str(),
                task.priority,
                task.task_type,
                task.created_at,
                task.updated_at,
                task.started_at,
                task.completed_at,
                task.error_message,
                task.failure_kind.map(|k| k.as_str()),
                task.execution_summary,
                task.exit_code,
                task.duration_ms,
                task.queue_id.as_ref().map(|q| q.as_str()),
            ],
        )
        .with_context(|| format!("insert task {}", task.id))?;
        Ok(())
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let conn = lock_unpoisoned(&self.conn);
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id=?1"),
                params![id.as_str()],
                map_task,
            )
            .optional()?;
        Ok(task)
    }

    fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = lock_unpoisoned(&self.conn);
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map([], map_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn update_task(&self, task: &Task) -> Result<bool> {
        let conn = lock_unpoisoned(&self.conn);
        let changed = conn.execute(
            "UPDATE tasks SET title=?1, status=?2, priority=?3, task_type=?4, updated_at=?5,
                started_at=?6, completed_at=?7, error_message=?8, failure_kind=?9,
                execution_summary=?10, exit_code=?11, duration_ms=?12, queue_id=?13
             WHERE id=?14",
            params![
                task.title,
                task.status.as_str(),
                task.priority,
                task.task_type,
                task.updated_at,
                task.started_at,
                task.completed_at,
                task.error_message,
                task.failure_kind.map(|k| k.as_str()),
                task.execution_summary,
                task.exit_code,
                task.duration_ms,
                task.queue_id.as_ref().map(|q| q.as_str()),
                task.id.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn append_logs(
        &self,
        task_id: &str,
        source: LogSource,
        lines: &[NewLogLine],
        offset: u64,
    ) -> Result<Vec<TaskLog>> {
        let mut conn = lock_unpoisoned(&self.conn);
        let tx = conn.transaction()?;
        let mut stored = Vec::with_capacity(lines.len());
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO task_logs(task_id, timestamp, source, line) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for line in lines {
                insert.execute(params![task_id, line.timestamp, source.as_str(), line.line])?;
                stored.push(TaskLog {
                    id: tx.last_insert_rowid(),
                    task_id: task_id.to_string(),
                    timestamp: line.timestamp,
                    source,
                    line: line.line.clone(),
                });
            }
        }
        tx.execute(
            "INSERT INTO stream_offsets(task_id, source, byte_offset) VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id, source) DO UPDATE SET byte_offset=excluded.byte_offset",
            params![task_id, source.as_str(), offset as i64],
        )?;
        tx.commit()
            .with_context(|| format!("commit {} log lines for {task_id}", lines.len()))?;
        Ok(stored)
    }

    fn logs_after(&self, task_id: &str, after: i64, limit: usize) -> Result<Vec<TaskLog>> {
        let conn = lock_unpoisoned(&self.conn);
        let mut stmt = conn.prepare_cached(
            "SELECT id, task_id, timestamp, source, line FROM task_logs
             WHERE task_id=?1 AND id>?2 ORDER BY id ASC LIMIT ?3",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![task_id, after, limit], map_log)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn stream_offset(&self, task_id: &str, source: LogSource) -> Result<u64> {
        let conn = lock_unpoisoned(&self.conn);
        let offset: Option<i64> = conn
            .query_row(
                "SELECT byte_offset FROM stream_offsets WHERE task_id=?1 AND source=?2",
                params![task_id, source.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(offset.unwrap_or(0) as u64)
    }
}
