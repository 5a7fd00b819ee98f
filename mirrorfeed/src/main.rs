/*
mirrorfeed - single-binary main.rs
Starts the Rocket HTTP+SSE surface and runs the background scheduler inside
the same process.
*/

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use common::Config;
use regex::Regex;
use reqwest::Client;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use mirrorfeed::broker::Broker;
use mirrorfeed::gateway::GatewayPool;
use mirrorfeed::scheduler::Scheduler;
use mirrorfeed::server::{self, AppState};
use mirrorfeed::storage::Store;

#[derive(Parser, Debug)]
#[command(name = "mirrorfeed", about = "Fetch orchestration engine + REST/SSE server")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Disable the background scheduler (serve HTTP only)
    #[arg(long)]
    no_worker: bool,

    /// Run the scheduler only (do not bind the HTTP server)
    #[arg(long)]
    worker_only: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            eprintln!("specified config file not found: {}", p.display());
            return Err(anyhow::anyhow!("config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = match Config::load_with_defaults(
        if default_path.exists() {
            Some(&default_path)
        } else {
            None
        },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return Err(e.into());
        }
    };

    let _log_guard = init_logging(&args.log_level, &config.log_path);
    info!(default = ?default_path, r#override = ?override_path, "configuration loaded");

    let conn = common::open_sqlite_connection(&config.storage_path).await?;
    let store = Arc::new(Store::new(conn).await?);
    info!(storage_path = %config.storage_path, "store opened");

    if store.get_targets().await?.is_empty() && !config.targets.is_empty() {
        info!(count = config.targets.len(), "seeding targets from configuration");
        for seed in &config.targets {
            store
                .add_target(&seed.kind, &seed.value, seed.poll_interval_seconds)
                .await?;
        }
    }

    let gateway = Arc::new(GatewayPool::new(
        &config.nitter_instances,
        config.max_requests_per_instance_per_minute,
        config.backoff_base_seconds,
    )?);

    let broker = if config.enable_sse {
        Some(Arc::new(Broker::new()))
    } else {
        None
    };

    let html_fallback_pattern = Regex::new(&config.html_fallback_pattern)
        .map_err(|e| anyhow::anyhow!("invalid html_fallback_pattern: {e}"))?;

    let http = Client::builder().user_agent(config.user_agent.clone()).build()?;

    let scheduler = Scheduler::new(
        store.clone(),
        gateway.clone(),
        broker.clone(),
        http.clone(),
        html_fallback_pattern.clone(),
        config.keep_only_last_n_per_target,
    );
    let queue_size = scheduler.queue_size.clone();
    let last_run = scheduler.last_run.clone();
    let shutdown_notify = scheduler.shutdown_handle();

    if args.worker_only {
        info!("starting in worker-only mode");
        let scheduler_run = scheduler.run();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, notifying scheduler to shutdown");
                shutdown_notify.notify_waiters();
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            _ = scheduler_run => {}
        }
        info!("worker-only run finished");
        return Ok(());
    }

    let mut worker_handle = None;
    if !args.no_worker {
        info!("spawning background scheduler task");
        worker_handle = Some(tokio::spawn(async move {
            scheduler.run().await;
        }));
    } else {
        info!("background scheduler disabled via CLI (--no-worker)");
    }

    let state = AppState {
        store: store.clone(),
        gateway: gateway.clone(),
        broker,
        http,
        html_fallback_pattern,
        keep_only_last_n_per_target: config.keep_only_last_n_per_target,
        queue_size: queue_size.clone(),
        last_run: last_run.clone(),
    };

    info!("launching Rocket HTTP server");
    let rocket_result = server::build_rocket(state).launch().await;
    if let Err(e) = rocket_result {
        error!(%e, "Rocket server failed");
    }

    info!("HTTP server stopped; notifying scheduler to shutdown");
    shutdown_notify.notify_waiters();

    if let Some(handle) = worker_handle {
        match tokio::time::timeout(Duration::from_secs(20), handle).await {
            Ok(Ok(())) => info!("scheduler exited cleanly"),
            Ok(Err(join_err)) => error!(%join_err, "scheduler task panicked"),
            Err(_) => info!("timed out waiting for scheduler to exit; continuing shutdown"),
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Sets up a tracing subscriber writing to stdout and to `log_path`
/// non-blockingly. The returned guard must stay alive for the process
/// lifetime or the file writer is flushed and dropped prematurely.
fn init_logging(log_level: &str, log_path: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let path = PathBuf::from(log_path);
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let _ = std::fs::create_dir_all(&directory);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "mirrorfeed.log".to_string());

    let file_appender = tracing_appender::rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .init();

    guard
}
