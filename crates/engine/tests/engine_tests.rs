use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use runq_core::{FailureKind, LogSource, QueueState, TaskStatus};
use runq_engine::{
    handler_fn, CreateTaskRequest, EngineConfig, EnqueueOptions, EventBus, HandlerOutcome,
    PublishOptions, Runtime, SpawnSpec, SubscribeOptions,
};
use runq_storage::{MemoryStore, Store};
use runq_storage_sqlite::SqliteStore;
use serde_json::json;
use tempfile::TempDir;

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 10,
        output_poll_ms: 20,
        liveness_poll_ms: 50,
        terminate_grace_ms: 200,
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

fn memory_runtime(cfg: EngineConfig) -> Runtime {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    Runtime::build(cfg, store).unwrap()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn sh(script: &str) -> SpawnSpec {
    SpawnSpec {
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
        cwd: None,
        env: Default::default(),
    }
}

fn pid_gone(pid: u32) -> bool {
    matches!(kill(Pid::from_raw(pid as i32), None::<Signal>), Err(Errno::ESRCH))
}

fn all_settled(rt: &Runtime) -> bool {
    rt.queue()
        .list()
        .unwrap()
        .iter()
        .all(|e| e.state.is_terminal())
}

#[tokio::test]
async fn concurrency_ceiling_is_respected() {
    let dir = tempfile::tempdir().unwrap();
    let rt = memory_runtime(EngineConfig { max_concurrent: 2, ..config(&dir) });
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        rt.dispatcher().register_handler(
            "work",
            handler_fn(move |_payload, _ctx| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(HandlerOutcome::default())
                }
            }),
        );
    }
    for i in 0..5 {
        rt.queue()
            .enqueue("work", json!({ "n": i }), 0, EnqueueOptions::default())
            .unwrap();
    }
    rt.boot().await.unwrap();
    eventually("all entries settled", || all_settled(&rt)).await;

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(rt
        .queue()
        .list()
        .unwrap()
        .iter()
        .all(|e| e.state == QueueState::Completed));
    rt.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn lower_priority_number_runs_first() {
    let dir = tempfile::tempdir().unwrap();
    let rt = memory_runtime(EngineConfig { max_concurrent: 1, ..config(&dir) });
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let order = Arc::clone(&order);
        rt.dispatcher().register_handler(
            "record",
            handler_fn(move |payload, _ctx| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(payload["p"].as_i64().unwrap_or(-1));
                    Ok(HandlerOutcome::default())
                }
            }),
        );
    }
    rt.queue().enqueue("record", json!({"p": 5}), 5, EnqueueOptions::default()).unwrap();
    rt.queue().enqueue("record", json!({"p": 1}), 1, EnqueueOptions::default()).unwrap();
    rt.boot().await.unwrap();
    eventually("both entries settled", || all_settled(&rt)).await;

    assert_eq!(*order.lock().unwrap(), vec![1, 5]);
    rt.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn handler_over_budget_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let rt = memory_runtime(EngineConfig { task_timeout_ms: 100, ..config(&dir) });
    rt.dispatcher().register_handler(
        "hang",
        handler_fn(|_payload, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(HandlerOutcome::default())
        }),
    );
    let id = rt.queue().enqueue("hang", json!({}), 0, EnqueueOptions::default()).unwrap();
    rt.boot().await.unwrap();
    eventually("timeout", || all_settled(&rt)).await;

    let entry = rt.queue().get(&id).unwrap().unwrap();
    assert_eq!(entry.state, QueueState::Failed);
    assert_eq!(entry.failure_kind, Some(FailureKind::Timeout));
    assert!(entry.error.unwrap().contains("timed out"));
    assert_eq!(rt.bus().recent("task.timeout", 10).len(), 1);
    rt.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn restart_fails_entries_whose_process_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("runq.db");
    let task_id = {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db).unwrap());
        let rt = Runtime::build(config(&dir), store).unwrap();
        let task = rt
            .bridge()
            .create_task(CreateTaskRequest {
                title: "orphan".into(),
                task_type: "agent_run".into(),
                payload: json!({"program": "true"}),
                priority: 0,
            })
            .unwrap();
        let entry = rt.queue().dequeue().unwrap().unwrap();
        rt.queue()
            .record_process(&entry.id, i32::MAX as u32, &Default::default())
            .unwrap();
        task.id
    };

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db).unwrap());
    let rt = Runtime::build(config(&dir), store).unwrap();
    let (hydrated, reconnected) = rt.boot().await.unwrap();
    assert_eq!(hydrated.total, 1);
    assert_eq!(reconnected.reconnected, 0);
    assert_eq!(reconnected.failed, 1);

    let task = rt.bridge().get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure_kind, Some(FailureKind::ProcessLost));
    let entry = rt.queue().get(task.queue_id.as_ref().unwrap()).unwrap().unwrap();
    assert_eq!(entry.state, QueueState::Failed);
    assert_eq!(entry.failure_kind, Some(FailureKind::ProcessLost));
    rt.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn enqueued_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("runq.db");
    let id = {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db).unwrap());
        let rt = Runtime::build(config(&dir), store).unwrap();
        rt.queue()
            .enqueue("agent_run", json!({"program": "echo", "args": ["hi"]}), 4, EnqueueOptions::default())
            .unwrap()
    };

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db).unwrap());
    let rt = Runtime::build(config(&dir), store).unwrap();
    let report = rt.queue().hydrate().unwrap();
    assert_eq!(report.total, 1);
    assert_eq!(report.pending, 1);
    assert!(report.running.is_empty());
    let entry = rt.queue().get(&id).unwrap().unwrap();
    assert_eq!(entry.task_type, "agent_run");
    assert_eq!(entry.payload, json!({"program": "echo", "args": ["hi"]}));
    assert_eq!(entry.priority, 4);
}

#[test]
fn failing_subscriber_does_not_block_others() {
    let bus = EventBus::new(100);
    let seen = Arc::new(AtomicUsize::new(0));
    let subs: Vec<_> = (0..3)
        .map(|i| {
            let seen = Arc::clone(&seen);
            bus.subscribe("task.*", SubscribeOptions::default(), move |_event| {
                if i == 1 {
                    anyhow::bail!("second subscriber fails");
                }
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .collect();

    let report = bus.publish(
        runq_core::Event::new("task.queued", json!({})),
        PublishOptions::default(),
    );
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(subs.len(), 3);
}

#[tokio::test]
async fn agent_run_streams_output_into_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let rt = memory_runtime(config(&dir));
    let task = rt
        .bridge()
        .create_task(CreateTaskRequest {
            title: "say hello".into(),
            task_type: "agent_run".into(),
            payload: json!({
                "program": "sh",
                "args": ["-c", "echo hello; echo oops >&2; printf tail"],
            }),
            priority: 0,
        })
        .unwrap();
    rt.boot().await.unwrap();

    eventually("task completed", || {
        rt.bridge().get_task(&task.id).unwrap().status == TaskStatus::Completed
    })
    .await;
    eventually("output persisted", || {
        rt.bridge().task_logs(&task.id, 0, 100).unwrap().len() == 3
    })
    .await;

    let task = rt.bridge().get_task(&task.id).unwrap();
    assert_eq!(task.exit_code, Some(0));
    assert!(task.execution_summary.unwrap().contains("exited with code 0"));

    let logs = rt.bridge().task_logs(&task.id, 0, 100).unwrap();
    let stdout: Vec<&str> = logs
        .iter()
        .filter(|l| l.source == LogSource::Stdout)
        .map(|l| l.line.as_str())
        .collect();
    assert_eq!(stdout, vec!["hello", "tail"]);
    assert!(logs
        .iter()
        .any(|l| l.source == LogSource::Stderr && l.line == "oops"));
    rt.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn shutdown_aborts_running_processes() {
    let dir = tempfile::tempdir().unwrap();
    let rt = memory_runtime(config(&dir));
    let task = rt
        .bridge()
        .create_task(CreateTaskRequest {
            title: "forever".into(),
            task_type: "agent_run".into(),
            payload: json!({"program": "sh", "args": ["-c", "sleep 30"]}),
            priority: 0,
        })
        .unwrap();
    rt.boot().await.unwrap();
    eventually("process spawned", || rt.supervisor().live_count() == 1).await;

    let report = rt.shutdown(Duration::from_millis(100)).await;
    assert_eq!(report.aborted, 1);
    let entry = rt.queue().get(task.queue_id.as_ref().unwrap()).unwrap().unwrap();
    assert_eq!(entry.failure_kind, Some(FailureKind::ShutdownAbort));
    eventually("process reaped", || rt.supervisor().live_count() == 0).await;
}

#[tokio::test]
async fn timeout_kills_the_agent_process() {
    let dir = tempfile::tempdir().unwrap();
    let rt = memory_runtime(EngineConfig { task_timeout_ms: 200, ..config(&dir) });
    let id = rt
        .queue()
        .enqueue("agent_run", json!({"program": "sleep", "args": ["30"]}), 0, EnqueueOptions::default())
        .unwrap();
    rt.boot().await.unwrap();
    eventually("timeout", || all_settled(&rt)).await;

    let entry = rt.queue().get(&id).unwrap().unwrap();
    assert_eq!(entry.failure_kind, Some(FailureKind::Timeout));
    assert_eq!(rt.bus().recent("task.timeout", 10).len(), 1);
    let pid = entry.pid.unwrap();
    eventually("process reaped", || rt.supervisor().live_count() == 0).await;
    eventually("pid gone", || pid_gone(pid)).await;
    rt.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn every_process_of_a_timed_out_entry_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let rt = memory_runtime(EngineConfig { task_timeout_ms: 400, ..config(&dir) });
    let pids = Arc::new(Mutex::new(Vec::new()));
    {
        let pids = Arc::clone(&pids);
        rt.dispatcher().register_handler(
            "pair",
            handler_fn(move |_payload, ctx| {
                let pids = Arc::clone(&pids);
                async move {
                    let first = ctx.spawn(&sh("sleep 30")).await?;
                    let second = ctx.spawn(&sh("sleep 30")).await?;
                    pids.lock().unwrap().extend([first.pid, second.pid]);
                    first.wait().await;
                    second.wait().await;
                    Ok(HandlerOutcome::default())
                }
            }),
        );
    }
    let id = rt.queue().enqueue("pair", json!({}), 0, EnqueueOptions::default()).unwrap();
    rt.boot().await.unwrap();
    eventually("timeout", || all_settled(&rt)).await;

    assert_eq!(rt.queue().get(&id).unwrap().unwrap().failure_kind, Some(FailureKind::Timeout));
    let pids = pids.lock().unwrap().clone();
    assert_eq!(pids.len(), 2);
    eventually("both processes gone", || pids.iter().all(|pid| pid_gone(*pid))).await;
    eventually("registry empty", || rt.supervisor().live_count() == 0).await;
    rt.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn output_of_several_processes_is_stored_once() {
    let dir = tempfile::tempdir().unwrap();
    let rt = memory_runtime(config(&dir));
    rt.dispatcher().register_handler(
        "two_steps",
        handler_fn(|_payload, ctx| async move {
            let first = ctx.spawn(&sh("echo A")).await?;
            let second = ctx.spawn(&sh("sleep 0.2; echo B")).await?;
            first.wait().await;
            second.wait().await;
            Ok(HandlerOutcome::default())
        }),
    );
    let id = rt.queue().enqueue("two_steps", json!({}), 0, EnqueueOptions::default()).unwrap();
    rt.boot().await.unwrap();
    eventually("entry settled", || all_settled(&rt)).await;
    eventually("output drained", || !rt.streamer().is_streaming(id.as_str())).await;

    let lines: Vec<String> = rt
        .streamer()
        .read(id.as_str(), 0, 10)
        .unwrap()
        .into_iter()
        .map(|l| l.line)
        .collect();
    assert_eq!(lines, vec!["A", "B"]);
    assert_eq!(rt.queue().get(&id).unwrap().unwrap().state, QueueState::Completed);
    rt.shutdown(Duration::from_secs(1)).await;
}

/// Queue a task on a first runtime over `db` and start its process the way a
/// handler would, without booting. Returns the task id and the pid.
async fn start_before_restart(
    dir: &TempDir,
    db: &std::path::Path,
    script: &str,
) -> (runq_core::TaskId, u32) {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(db).unwrap());
    let rt = Runtime::build(config(dir), store).unwrap();
    let task = rt
        .bridge()
        .create_task(CreateTaskRequest {
            title: "survivor".into(),
            task_type: "agent_run".into(),
            payload: serde_json::to_value(sh(script)).unwrap(),
            priority: 0,
        })
        .unwrap();
    let entry = rt.queue().dequeue().unwrap().unwrap();
    let handle = rt.supervisor().spawn(&entry.id, &sh(script)).await.unwrap();
    rt.queue()
        .record_process(&entry.id, handle.pid, &handle.fingerprint)
        .unwrap();
    (task.id, handle.pid)
}

#[tokio::test]
async fn restart_reattaches_a_live_process_and_completes_it() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("runq.db");
    let (task_id, _pid) = start_before_restart(&dir, &db, "sleep 1; echo done").await;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db).unwrap());
    let rt = Runtime::build(config(&dir), store).unwrap();
    let (_, reconnected) = rt.boot().await.unwrap();
    assert_eq!(reconnected.reconnected, 1);
    assert_eq!(reconnected.failed, 0);

    eventually("task completed", || {
        rt.bridge().get_task(&task_id).unwrap().status == TaskStatus::Completed
    })
    .await;
    let entry_id = rt.bridge().get_task(&task_id).unwrap().queue_id.unwrap();
    eventually("output drained", || !rt.streamer().is_streaming(entry_id.as_str())).await;
    let lines: Vec<String> = rt
        .bridge()
        .task_logs(&task_id, 0, 10)
        .unwrap()
        .into_iter()
        .map(|l| l.line)
        .collect();
    assert_eq!(lines, vec!["done"]);
    assert_eq!(rt.queue().get(&entry_id).unwrap().unwrap().state, QueueState::Completed);
    rt.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn adopted_entry_past_its_budget_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("runq.db");
    let (task_id, pid) = start_before_restart(&dir, &db, "sleep 30").await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db).unwrap());
    let rt = Runtime::build(EngineConfig { task_timeout_ms: 300, ..config(&dir) }, store).unwrap();
    let (_, reconnected) = rt.boot().await.unwrap();
    assert_eq!(reconnected.reconnected, 1);

    eventually("task failed", || {
        rt.bridge().get_task(&task_id).unwrap().status == TaskStatus::Failed
    })
    .await;
    let task = rt.bridge().get_task(&task_id).unwrap();
    assert_eq!(task.failure_kind, Some(FailureKind::Timeout));
    eventually("adopted process killed", || pid_gone(pid)).await;
    rt.shutdown(Duration::from_secs(1)).await;
}
