#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! runq daemon: owns the SQLite store, runs the engine and serves the task
//! API.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use runq_engine::{EngineConfig, Runtime};
use runq_storage::Store;
use runq_storage_sqlite::SqliteStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod http;

#[derive(Parser, Debug)]
#[command(name = "runqd")]
struct Args {
    /// TOML config file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum handlers running at once.
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Dispatcher poll interval in milliseconds.
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Per-task timeout in milliseconds.
    #[arg(long)]
    task_timeout_ms: Option<u64>,

    /// Merge loop interval in milliseconds.
    #[arg(long)]
    merge_interval_ms: Option<u64>,

    /// Directory for the database and process output.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:3000
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

impl Args {
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut cfg = match &self.config {
            Some(path) => EngineConfig::load_from(path)?,
            None => EngineConfig::default(),
        };
        if let Some(v) = self.max_concurrent {
            cfg.max_concurrent = v;
        }
        if let Some(v) = self.poll_interval_ms {
            cfg.poll_interval_ms = v;
        }
        if let Some(v) = self.task_timeout_ms {
            cfg.task_timeout_ms = v;
        }
        if let Some(v) = self.merge_interval_ms {
            cfg.merge_interval_ms = v;
        }
        if let Some(v) = &self.data_dir {
            cfg.data_dir = v.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler failed; shutting down");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = args.engine_config()?;
    tokio::fs::create_dir_all(cfg.logs_root())
        .await
        .with_context(|| format!("create {}", cfg.logs_root().display()))?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg.db_path())?);
    let grace = cfg.shutdown_grace();
    let rt = Arc::new(Runtime::build(cfg, store)?);
    let (hydrated, reconnected) = rt.boot().await?;
    tracing::info!(
        pending = hydrated.pending,
        reconnected = reconnected.reconnected,
        lost = reconnected.failed,
        "engine ready"
    );

    let app = http::router(Arc::clone(&rt));
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    tracing::info!(listen = %args.listen, "daemon starting");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = rt.shutdown(grace).await;
    tracing::info!(
        finished = report.finished_naturally,
        aborted = report.aborted,
        "daemon stopped"
    );
    Ok(())
}
