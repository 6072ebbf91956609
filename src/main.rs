//! # Collection Engine
//!
//! Edge data-acquisition engine: polls field devices over Modbus TCP/RTU,
//! MQTT, and BACnet/IP, runs readings through a validation/scaling pipeline,
//! and fans the results out to a cache sink and a history sink.
//!
//! ## Architecture
//!
//! ```text
//! Device (Modbus/MQTT/BACnet) → Protocol Driver → Worker → Pipeline → Cache sink
//!                                                                   ↘ History sink
//! ```
//!
//! ## Responsibilities
//!
//! 1. Read device/point configuration from the configuration store
//! 2. Maintain one Worker per enabled device, each owning a protocol driver
//! 3. Poll points, validate/scale/deadband readings, fan out to sinks
//! 4. Reconnect with exponential backoff on connection loss
//! 5. Expose `/metrics` and `/healthz` for monitoring
//!
//! ## NOT Responsible For
//!
//! - Device/point provisioning (owned by the configuration store's writer)
//! - Alerting/rules evaluation (consumes history/cache downstream)
//! - User-facing authentication (no user-facing endpoints)

use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod config_registry;
mod drivers;
mod errors;
mod manager;
mod metrics;
mod model;
mod pipeline;
mod reconnect;
mod repository;
mod sinks;
mod worker;
mod worker_factory;

use config::{exit_codes, Config};
use manager::WorkerManager;
use metrics::MetricsServer;
use repository::Repository;
use sinks::{CacheSink, HistorySink};
use worker_factory::WorkerFactory;

/// Top-level startup failure, tagged with the exit code it maps to per the
/// CLI/environment contract. Runtime errors once the engine is up (a single
/// device failing to connect, a sink hiccup) never reach here — those are
/// logged and handled in place by the Manager/Worker.
#[derive(Error, Debug)]
enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),
    #[error("configuration store error: {0}")]
    Schema(#[source] errors::EngineError),
}

impl StartupError {
    fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => exit_codes::CONFIG_ERROR,
            StartupError::Schema(_) => exit_codes::SCHEMA_ERROR,
        }
    }
}

fn main() -> ExitCode {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(exit_codes::STARTUP_ERROR as u8);
        }
    };

    match rt.block_on(run()) {
        Ok(()) => ExitCode::from(exit_codes::CLEAN_SHUTDOWN as u8),
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run() -> Result<(), StartupError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulseone_collector=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting collection engine v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().map_err(StartupError::Config)?;
    info!(environment = %config.environment, "configuration loaded");

    let repository = Arc::new(
        Repository::connect(&config.database.sqlite_path)
            .await
            .map_err(StartupError::Schema)?,
    );
    info!("connected to configuration store");

    // Sink construction failing at startup is the one place a sink error is
    // fatal to the process: once running, a Worker tolerates a sink outage
    // and keeps polling, buffering what it can.
    let cache = Arc::new(tokio::sync::Mutex::new(
        CacheSink::connect(&config.cache.url())
            .await
            .map_err(StartupError::Schema)?,
    ));
    info!("connected to cache sink");

    let history = Arc::new(
        HistorySink::new(sinks::history::HistoryConfig {
            url: config.history.url(),
            database: config.history.database.clone(),
            token: config.history.token.clone(),
            ..Default::default()
        })
        .map_err(StartupError::Schema)?,
    );
    history.clone().start();
    info!("history sink ready");

    let factory = WorkerFactory::new(repository.clone(), cache.clone(), history.clone());
    let manager = Arc::new(WorkerManager::new(repository.clone(), factory, cache.clone()));

    manager
        .start_all_active_workers()
        .await
        .map_err(StartupError::Schema)?;
    info!("active device workers started");

    let metrics_server = MetricsServer::new(config.metrics_port, manager.clone());
    let metrics_handle = tokio::spawn(async move {
        if let Err(e) = metrics_server.serve().await {
            error!(error = %e, "metrics server error");
        }
    });
    info!(port = config.metrics_port, "metrics/healthz listening");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining workers");

    let snapshot = manager.status_snapshot().await;
    for worker in snapshot.workers {
        if let Err(e) = manager.stop_worker(worker.device_id).await {
            error!(device_id = %worker.device_id, error = %e, "error stopping worker during shutdown");
        }
    }

    metrics_handle.abort();
    info!("collection engine stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("SIGINT received");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("SIGTERM received");
        }
    }
}
