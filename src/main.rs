mod config;
mod event;
mod queue;
mod report;
mod server;
mod storage;
mod worker;

use anyhow::{Context, Result};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::prelude::*;

use crate::{
    config::{Backend, Config},
    queue::{EventQueue, InMemoryQueue, RedisQueue},
    server::{IngestState, ReportState},
    storage::{InMemoryStorage, PostgresStorage, Storage},
    worker::{Worker, WorkerSettings},
};

const DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which part of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
enum Role {
    Ingest,
    Worker,
    Report,
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    set_up_tracing()?;
    let role = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<Role>()
            .with_context(|| format!("Unknown role '{arg}', expected ingest, worker, report or all"))?,
        None => Role::All,
    };
    let config = Config::from_env()?;
    info!("Starting {} with {} backend", role.as_ref(), config.backend.as_ref());
    if config.backend == Backend::Memory && role != Role::All {
        warn!("The memory backend is not shared between processes");
    }

    let backends = make_backends(&config)?;
    let ingest = matches!(role, Role::Ingest | Role::All).then(|| IngestState {
        queue: backends.ingest_queue.clone(),
        queue_name: config.events_queue.clone(),
    });
    let report = matches!(role, Role::Report | Role::All).then(|| ReportState {
        store: backends.store.clone(),
    });

    match role {
        Role::Worker => run_worker(&config, backends.worker_queue, backends.store).await,
        Role::Ingest | Role::Report => {
            let app = server::make_server(ingest, report);
            server::serve(app, config.http_port, shutdown_signal()).await
        }
        Role::All => {
            let app = server::make_server(ingest, report);
            serve_alongside_worker(
                server::serve(app, config.http_port, shutdown_signal()),
                run_worker(&config, backends.worker_queue, backends.store),
            )
            .await
        }
    }
}

/// Queue and store handles, constructed once and passed down.
struct Backends {
    /// Used by `POST /event`.
    ingest_queue: Arc<dyn EventQueue + Send + Sync>,
    /// Used by the worker. A separate client so that its blocking pops never
    /// hold up an enqueue.
    worker_queue: Arc<dyn EventQueue + Send + Sync>,
    store: Arc<dyn Storage + Send + Sync>,
}

fn make_backends(config: &Config) -> Result<Backends> {
    let backends = match config.backend {
        Backend::External => {
            let redis_queue = || {
                RedisQueue::new(&config.redis_url(), config.queue_timeout)
                    .context("Invalid Redis address")
            };
            let store = PostgresStorage::connect_lazy(&config.database_url, DB_ACQUIRE_TIMEOUT)
                .context("Invalid DATABASE_URL")?;
            Backends {
                ingest_queue: Arc::new(redis_queue()?),
                worker_queue: Arc::new(redis_queue()?),
                store: Arc::new(store),
            }
        }
        Backend::Memory => {
            // Both roles have to see the same lists.
            let queue = Arc::new(InMemoryQueue::new());
            Backends {
                ingest_queue: queue.clone(),
                worker_queue: queue,
                store: Arc::new(InMemoryStorage::new()),
            }
        }
    };
    Ok(backends)
}

/// Runs the HTTP server and the worker together. A worker that fails, e.g. because
/// the store never became ready, is logged and the server keeps accepting events.
async fn serve_alongside_worker(
    server: impl Future<Output = Result<()>>,
    worker: impl Future<Output = Result<()>>,
) -> Result<()> {
    let worker = async {
        if let Err(error) = worker.await {
            error!("Worker stopped, ingestion and reporting stay up: {error:#}");
        }
        Ok::<(), anyhow::Error>(())
    };
    tokio::try_join!(server, worker)?;
    Ok(())
}

async fn run_worker(
    config: &Config,
    queue: Arc<dyn EventQueue + Send + Sync>,
    store: Arc<dyn Storage + Send + Sync>,
) -> Result<()> {
    info!("Processor starting; connecting to {}", config.redis_url());
    let worker = Worker::new(queue, store, WorkerSettings::from_config(config));
    worker.run(shutdown_signal()).await?;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("Cannot listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
}

fn set_up_tracing() -> Result<()> {
    #[cfg(windows)]
    let with_color = nu_ansi_term::enable_ansi_support().is_ok();
    #[cfg(not(windows))]
    let with_color = true;

    let fmt_layer = fmt::layer().with_ansi(with_color).with_target(false);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(if cfg!(debug_assertions) { "debug" } else { "info" }))?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    Ok(())
}
