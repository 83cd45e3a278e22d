mod file_adapter;
mod tail_transport;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use file_adapter::FileServiceAdapter;
use pc_core::clients::HistoryQuery;
use pc_core::JobClass;
use pc_state::{keys, parse_bool_flag, PcRuntime, RefreshPhase, RuntimeConfig, StreamState};
use serde_json::{json, Value};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tail_transport::TailTransport;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "pc-watch")]
struct Args {
    #[arg(long, default_value = "")]
    project_dir: String,
    #[arg(long, default_value = "generation")]
    class: String,
    #[arg(long, default_value = "")]
    job: String,
    #[arg(long, default_value = "")]
    project: String,
    #[arg(long, default_value = "")]
    shot: String,
    #[arg(long, default_value_t = 0)]
    limit: u32,
    #[arg(long, default_value_t = false)]
    auto_refresh: bool,
    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
    #[arg(long, default_value_t = false)]
    exit_on_close: bool,
}

#[derive(Debug, Clone)]
struct Config {
    root: PathBuf,
    class: JobClass,
    job: Option<String>,
    query: HistoryQuery,
    poll: Duration,
    exit_on_close: bool,
    runtime: RuntimeConfig,
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn resolve_project_dir(flag: &str) -> Result<PathBuf> {
    if let Some(dir) = non_empty(flag) {
        return Ok(PathBuf::from(dir));
    }
    if let Some(dir) = std::env::var("PC_PROJECT_DIR").ok().as_deref().and_then(non_empty) {
        return Ok(PathBuf::from(dir));
    }
    std::env::current_dir().context("resolve working directory")
}

fn load_config() -> Result<Config> {
    let args = Args::parse();
    let root = resolve_project_dir(&args.project_dir)?;
    if !root.is_dir() {
        bail!("project dir {} does not exist", root.display());
    }
    let class: JobClass = args
        .class
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown job class {:?}", args.class))?;

    let mut runtime = RuntimeConfig::from_env().context("read PC_* environment")?;
    runtime.auto_refresh = runtime.auto_refresh || args.auto_refresh;
    if args.limit > 0 {
        runtime.history_limit = args.limit;
    }

    let query = HistoryQuery {
        project: non_empty(&args.project),
        shot_id: non_empty(&args.shot),
        limit: Some(runtime.history_limit),
        ..HistoryQuery::default()
    };

    Ok(Config {
        root,
        class,
        job: non_empty(&args.job),
        query,
        poll: Duration::from_millis(args.poll_ms.max(10)),
        exit_on_close: args.exit_on_close,
        runtime,
    })
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_enabled = std::env::var("PC_LOG_STDOUT")
        .ok()
        .as_deref()
        .and_then(parse_bool_flag)
        .unwrap_or(false);
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}

fn watched_keys(config: &Config) -> Vec<String> {
    let mut watched: Vec<String> = [
        keys::active_id(config.class),
        keys::stream_state(config.class),
        keys::record_cache(config.class),
        keys::GENERATION_HISTORY_REFRESH_IN_FLIGHT,
        keys::GENERATION_HISTORY_ERROR,
        keys::GENERATION_METRICS_CACHE,
    ]
    .into_iter()
    .map(str::to_string)
    .collect();
    if let Some(job) = &config.job {
        watched.push(keys::job_error(job));
    }
    watched
}

fn print_update(key: &str, value: &Value) {
    let line = json!({"at": Utc::now().to_rfc3339(), "key": key, "value": value});
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
}

/// Waits for the reconciling refresh a finished generation job schedules.
async fn settle_history(runtime: &PcRuntime) {
    let wait = async {
        while runtime.scheduler().phase() != RefreshPhase::Idle {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    if tokio::time::timeout(SETTLE_TIMEOUT, wait).await.is_err() {
        warn!(event = "history_settle_timeout");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_logging();

    let runtime = PcRuntime::new(
        config.runtime.clone(),
        Arc::new(FileServiceAdapter::new(config.root.clone())),
        Arc::new(TailTransport::new(config.root.clone(), config.poll)),
        config.query.clone(),
    );
    let store = runtime.store().clone();

    let mut subscriptions = Vec::new();
    for key in watched_keys(&config) {
        let printed = key.clone();
        subscriptions.push(store.on(&key, move |value| print_update(&printed, value)));
    }
    let closed = Arc::new(Notify::new());
    {
        let closed = closed.clone();
        subscriptions.push(store.on(keys::stream_state(config.class), move |value| {
            if value.as_str() == Some(StreamState::Closed.as_str()) {
                closed.notify_one();
            }
        }));
    }

    info!(
        event = "pc_watch_start",
        root = %config.root.display(),
        class = config.class.as_str(),
        job = config.job.as_deref().unwrap_or("")
    );

    let tracking = match &config.job {
        Some(job) => {
            let state = runtime.track(config.class, job).await;
            info!(event = "pc_watch_track", job = %job, state = state.as_str());
            true
        }
        None => {
            runtime.scheduler().schedule_refresh();
            false
        }
    };

    if tracking && config.exit_on_close {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = closed.notified() => {
                if config.class == JobClass::Generation {
                    settle_history(&runtime).await;
                }
            }
        }
    } else {
        let _ = tokio::signal::ctrl_c().await;
    }

    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    runtime.shutdown().await;
    info!(event = "pc_watch_stop");

    if let Some(job) = &config.job {
        if let Some(error) = store.get(&keys::job_error(job)).filter(|value| !value.is_null()) {
            bail!("job {job} reported a stream error: {error}");
        }
    }
    Ok(())
}
