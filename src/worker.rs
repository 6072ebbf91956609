//! Per-device Worker: owns one Driver instance and runs its poll loop,
//! write queue and reconnect policy as three cooperating tasks.

use crate::drivers::ProtocolDriver;
use crate::errors::{EngineError, EngineResult};
use crate::model::{DataPoint, DeviceSettings, Quality, Value};
use crate::pipeline::{to_current_value, Pipeline};
use crate::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::sinks::{CacheSink, HistorySink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Coarse Worker lifecycle state, surfaced in status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Paused,
    Reconnecting,
    DeviceOffline,
    MaxRetriesExceeded,
    Stopping,
    Error,
    Maintenance,
    Simulation,
    Calibration,
    ManualOverride,
    EmergencyStop,
    BypassMode,
    DiagnosticMode,
}

impl WorkerState {
    fn rejects_writes(&self) -> bool {
        matches!(self, WorkerState::Maintenance | WorkerState::EmergencyStop | WorkerState::BypassMode)
    }

    fn suspends_polling(&self) -> bool {
        matches!(
            self,
            WorkerState::Maintenance
                | WorkerState::Simulation
                | WorkerState::Calibration
                | WorkerState::ManualOverride
                | WorkerState::EmergencyStop
                | WorkerState::BypassMode
                | WorkerState::DiagnosticMode
                | WorkerState::Paused
        )
    }
}

struct WriteRequest {
    point: DataPoint,
    value: Value,
    reply: oneshot::Sender<EngineResult<()>>,
}

/// Shared, lock-protected Worker state. Cheap to clone via `Arc`; handed to
/// the Manager as the registry value.
pub struct Worker {
    device_id: Uuid,
    device_name: String,
    state: Arc<RwLock<WorkerState>>,
    driver: Arc<Mutex<Box<dyn ProtocolDriver>>>,
    points: Arc<RwLock<Vec<DataPoint>>>,
    settings: DeviceSettings,
    cache: Arc<Mutex<CacheSink>>,
    history: Arc<HistorySink>,
    write_tx: mpsc::Sender<WriteRequest>,
    write_rx: Mutex<Option<mpsc::Receiver<WriteRequest>>>,
    stopping: Arc<AtomicBool>,
    read_count: Arc<std::sync::atomic::AtomicU64>,
}

impl Worker {
    pub fn new(
        device_id: Uuid,
        device_name: String,
        driver: Box<dyn ProtocolDriver>,
        points: Vec<DataPoint>,
        settings: DeviceSettings,
        cache: Arc<Mutex<CacheSink>>,
        history: Arc<HistorySink>,
    ) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(64);
        Arc::new(Self {
            device_id,
            device_name,
            state: Arc::new(RwLock::new(WorkerState::Stopped)),
            driver: Arc::new(Mutex::new(driver)),
            points: Arc::new(RwLock::new(points)),
            settings,
            cache,
            history,
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            stopping: Arc::new(AtomicBool::new(false)),
            read_count: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        })
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.driver.lock().await.is_connected()
    }

    /// Transitions the Worker to `new_state`, updating the `WORKER_STATE`
    /// gauge so exactly one (device_id, state) pair reads 1 at a time.
    async fn set_state(&self, new_state: WorkerState) {
        let mut guard = self.state.write().await;
        let old_state = *guard;
        *guard = new_state;
        drop(guard);

        if old_state == new_state {
            return;
        }
        let device_id = self.device_id.to_string();
        crate::metrics::WORKER_STATE
            .with_label_values(&[&device_id, &format!("{old_state:?}")])
            .set(0.0);
        crate::metrics::WORKER_STATE
            .with_label_values(&[&device_id, &format!("{new_state:?}")])
            .set(1.0);
    }

    /// Initial connect attempt plus spawn of the poll/write tasks. Resolves
    /// once the first connect attempt completes, success or failure — a
    /// failed attempt still leaves the Worker alive in `RECONNECTING`.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        self.set_state(WorkerState::Starting).await;
        self.stopping.store(false, Ordering::SeqCst);

        if let Err(e) = self.driver.lock().await.initialize().await {
            error!(device_id = %self.device_id, error = %e, "driver initialization failed");
            self.set_state(WorkerState::Error).await;
            return Err(e);
        }

        let points_snapshot = self.points.read().await.clone();
        match self.driver.lock().await.connect(&points_snapshot).await {
            Ok(()) => {
                self.set_state(WorkerState::Running).await;
                crate::metrics::ACTIVE_CONNECTIONS
                    .with_label_values(&[&self.device_id.to_string(), self.driver.lock().await.protocol_type().as_str()])
                    .set(1.0);
                info!(device_id = %self.device_id, "worker connected");
            }
            Err(e) => {
                warn!(device_id = %self.device_id, error = %e, "initial connect failed, entering reconnect");
                self.set_state(WorkerState::Reconnecting).await;
            }
        }

        self.spawn_poll_task();
        self.spawn_write_task();
        Ok(())
    }

    fn spawn_poll_task(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.poll_loop().await;
        });
    }

    fn spawn_write_task(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.write_loop().await;
        });
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut pipeline = Pipeline::new();
        let mut policy = ReconnectPolicy::new(
            ReconnectConfig {
                initial_backoff_ms: self.settings.retry_interval_ms,
                max_backoff_ms: self.settings.backoff_time_ms,
                backoff_multiplier: 2.0,
                max_retry_attempts: self.settings.retry_count,
            },
            self.driver.lock().await.statistics(),
        );

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            let state = *self.state.read().await;
            if matches!(state, WorkerState::Stopped | WorkerState::Stopping | WorkerState::MaxRetriesExceeded | WorkerState::Error) {
                break;
            }

            if state == WorkerState::Reconnecting {
                if policy.is_max_retries_reached() {
                    self.set_state(WorkerState::MaxRetriesExceeded).await;
                    error!(device_id = %self.device_id, "max reconnect attempts exceeded");
                    continue;
                }
                let delay = policy.next_backoff();
                sleep(delay).await;
                if self.stopping.load(Ordering::SeqCst) {
                    break;
                }
                let points_snapshot = self.points.read().await.clone();
                match self.driver.lock().await.connect(&points_snapshot).await {
                    Ok(()) => {
                        policy.record_connect_success();
                        self.set_state(WorkerState::Running).await;
                        let protocol = self.driver.lock().await.protocol_type().as_str();
                        crate::metrics::ACTIVE_CONNECTIONS
                            .with_label_values(&[&self.device_id.to_string(), protocol])
                            .set(1.0);
                        info!(device_id = %self.device_id, "reconnected");
                    }
                    Err(e) => {
                        policy.record_connect_failure();
                        crate::metrics::DRIVER_ERRORS
                            .with_label_values(&[&self.device_id.to_string(), self.driver.lock().await.protocol_type().as_str(), "reconnect"])
                            .inc();
                        debug!(device_id = %self.device_id, error = %e, "reconnect attempt failed");
                    }
                }
                continue;
            }

            if state.suspends_polling() {
                sleep(Duration::from_millis(self.settings.polling_interval_ms)).await;
                continue;
            }

            self.run_poll_cycle(&mut pipeline).await;

            if *self.state.read().await == WorkerState::Running {
                sleep(Duration::from_millis(self.settings.polling_interval_ms)).await;
            }
        }
    }

    async fn run_poll_cycle(self: &Arc<Self>, pipeline: &mut Pipeline) {
        let points = self.points.read().await.clone();
        if points.is_empty() {
            return;
        }

        let read_result = self.driver.lock().await.read_values(&points).await;

        let readings = match read_result {
            Ok(readings) => readings,
            Err(e) if e.code().is_connection_class() => {
                warn!(device_id = %self.device_id, error = %e, "connection-class error, entering reconnect");
                crate::metrics::DRIVER_ERRORS
                    .with_label_values(&[&self.device_id.to_string(), self.driver.lock().await.protocol_type().as_str(), "connection"])
                    .inc();
                crate::metrics::ACTIVE_CONNECTIONS
                    .with_label_values(&[&self.device_id.to_string(), self.driver.lock().await.protocol_type().as_str()])
                    .set(0.0);
                self.set_state(WorkerState::Reconnecting).await;
                self.mark_all_not_connected(&points).await;
                return;
            }
            Err(e) => {
                error!(device_id = %self.device_id, error = %e, "unrecoverable driver error");
                crate::metrics::DRIVER_ERRORS
                    .with_label_values(&[&self.device_id.to_string(), self.driver.lock().await.protocol_type().as_str(), "unrecoverable"])
                    .inc();
                self.set_state(WorkerState::Error).await;
                return;
            }
        };

        let point_by_id: std::collections::HashMap<_, _> = points.iter().map(|p| (p.id, p)).collect();
        for reading in readings {
            let Some(point) = point_by_id.get(&reading.point_id) else { continue };
            let quality = if reading.error.is_some() { Quality::Bad } else { Quality::Good };
            let (tv, fan_out) = pipeline.process(point, reading.value, quality);
            let read_count = self.read_count.fetch_add(1, Ordering::Relaxed) + 1;
            let cv = to_current_value(self.device_id, &tv, "poll", read_count);

            crate::metrics::READINGS_INGESTED
                .with_label_values(&[&self.device_id.to_string(), &point.id.to_string()])
                .inc();

            if fan_out.to_cache {
                if let Err(e) = self.cache.lock().await.write(&cv).await {
                    warn!(device_id = %self.device_id, error = %e, "cache sink write failed");
                }
            }
            if fan_out.to_history {
                if let Err(e) = self.history.add_reading(self.device_id, &cv).await {
                    warn!(device_id = %self.device_id, error = %e, "history sink write failed");
                }
            }
        }
    }

    /// Preserves each point's last-known value/timestamp in the cache,
    /// only downgrading quality — never fabricates a reading.
    async fn mark_all_not_connected(&self, points: &[DataPoint]) {
        let mut cache = self.cache.lock().await;
        for point in points {
            let now = chrono::Utc::now();
            let previous = cache.read(self.device_id, point.id).await.ok().flatten();
            let (value, value_timestamp) = match previous {
                Some(prev) => (prev.value, prev.value_timestamp),
                None => (Value::Bool(false), now),
            };
            let cv = crate::model::CurrentValue {
                device_id: self.device_id,
                point_id: point.id,
                value,
                quality: Quality::NotConnected,
                value_timestamp,
                quality_timestamp: now,
                source: "reconnect".to_string(),
                read_count: 0,
            };
            let _ = cache.write(&cv).await;
        }
    }

    async fn write_loop(self: Arc<Self>) {
        let mut rx = match self.write_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        while let Some(req) = rx.recv().await {
            if self.stopping.load(Ordering::SeqCst) {
                let _ = req.reply.send(Err(EngineError::AccessDenied("worker is stopping".into())));
                continue;
            }

            let state = *self.state.read().await;
            if state.rejects_writes() {
                let _ = req.reply.send(Err(EngineError::AccessDenied(format!("writes are rejected in state {state:?}"))));
                continue;
            }

            if state == WorkerState::Simulation {
                let mut pipeline = Pipeline::new();
                let (tv, fan_out) = pipeline.process(&req.point, Some(req.value.clone()), Quality::Good);
                let cv = to_current_value(self.device_id, &tv, "simulated", 0);
                if fan_out.to_cache {
                    let _ = self.cache.lock().await.write(&cv).await;
                }
                let _ = req.reply.send(Ok(()));
                continue;
            }

            let result = self.driver.lock().await.write_value(&req.point, req.value).await;
            let _ = req.reply.send(result);
        }
    }

    /// Enqueue a write; the write task drains ahead of the next poll cycle.
    pub async fn write_data_point(&self, point: DataPoint, value: Value) -> EngineResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest { point, value, reply: reply_tx })
            .await
            .map_err(|_| EngineError::SystemError("write queue closed".into()))?;
        reply_rx.await.map_err(|_| EngineError::SystemError("write reply dropped".into()))?
    }

    pub async fn set_operator_state(&self, new_state: WorkerState) {
        self.set_state(new_state).await;
    }

    pub async fn reload_points(&self, points: Vec<DataPoint>) {
        *self.points.write().await = points;
    }

    /// Requests a graceful stop and waits up to `deadline` for the poll and
    /// write tasks to observe it.
    pub async fn stop(&self, deadline: Duration) -> EngineResult<()> {
        self.set_state(WorkerState::Stopping).await;
        self.stopping.store(true, Ordering::SeqCst);

        let wait = sleep(deadline);
        tokio::pin!(wait);
        // The tasks poll `stopping` at most once per polling_interval_ms;
        // a short settle delay gives them a chance to exit before we force
        // the driver closed from here.
        tokio::select! {
            _ = sleep(Duration::from_millis(50)) => {}
            _ = &mut wait => {}
        }

        self.driver.lock().await.disconnect().await.ok();
        self.set_state(WorkerState::Stopped).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_and_emergency_stop_reject_writes() {
        assert!(WorkerState::Maintenance.rejects_writes());
        assert!(WorkerState::EmergencyStop.rejects_writes());
        assert!(WorkerState::BypassMode.rejects_writes());
        assert!(!WorkerState::Running.rejects_writes());
        assert!(!WorkerState::Simulation.rejects_writes());
    }

    #[test]
    fn operator_states_suspend_polling_but_running_does_not() {
        assert!(WorkerState::Maintenance.suspends_polling());
        assert!(WorkerState::Simulation.suspends_polling());
        assert!(WorkerState::Paused.suspends_polling());
        assert!(!WorkerState::Running.suspends_polling());
        assert!(!WorkerState::Reconnecting.suspends_polling());
    }
}
