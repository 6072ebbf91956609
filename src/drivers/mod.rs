//! Protocol driver layer: one implementation per wire protocol, all
//! reachable through the [`ProtocolDriver`] trait so the Worker never
//! branches on protocol type.

pub mod bacnet;
pub mod factory;
pub mod modbus_common;
pub mod modbus_rtu;
pub mod modbus_tcp;
pub mod mqtt;

use crate::errors::EngineError;
use crate::model::{DataPoint, Value};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Coarse connection state surfaced in status snapshots and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

use serde::{Deserialize, Serialize};

/// Atomic counters kept by every driver instance. Shared (via `Arc`) between
/// the driver and its owning Worker so the Worker's reconnect policy can
/// read them without a round trip through the driver's own lock.
#[derive(Debug, Default)]
pub struct DriverStatistics {
    pub reads_ok: AtomicU64,
    pub reads_failed: AtomicU64,
    pub writes_ok: AtomicU64,
    pub writes_failed: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_error_at_unix_ms: AtomicU64,
}

impl DriverStatistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_read(&self, ok: bool) {
        if ok {
            self.reads_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads_failed.fetch_add(1, Ordering::Relaxed);
            self.touch_error();
        }
    }

    pub fn record_write(&self, ok: bool) {
        if ok {
            self.writes_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.writes_failed.fetch_add(1, Ordering::Relaxed);
            self.touch_error();
        }
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn touch_error(&self) {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.last_error_at_unix_ms.store(now, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DriverStatisticsSnapshot {
        DriverStatisticsSnapshot {
            reads_ok: self.reads_ok.load(Ordering::Relaxed),
            reads_failed: self.reads_failed.load(Ordering::Relaxed),
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_error_at_unix_ms: self.last_error_at_unix_ms.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.reads_ok.store(0, Ordering::Relaxed);
        self.reads_failed.store(0, Ordering::Relaxed);
        self.writes_ok.store(0, Ordering::Relaxed);
        self.writes_failed.store(0, Ordering::Relaxed);
        self.reconnects.store(0, Ordering::Relaxed);
        self.last_error_at_unix_ms.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DriverStatisticsSnapshot {
    pub reads_ok: u64,
    pub reads_failed: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub reconnects: u64,
    pub last_error_at_unix_ms: u64,
}

/// One decoded reading returned by a driver's `read_values`, paired with the
/// point it was read for. The Pipeline attaches quality/scaling semantics;
/// the driver only reports what it observed on the wire.
#[derive(Debug, Clone)]
pub struct RawReading {
    pub point_id: uuid::Uuid,
    pub value: Option<Value>,
    pub error: Option<EngineError>,
}

/// Protocol-agnostic surface the Worker drives. Every method is
/// cancel-safe: the Worker may drop a pending future (on stop/shutdown)
/// without leaving the driver in an inconsistent state.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    /// One-time setup (parse config, validate addresses). Called once,
    /// before the first `connect`.
    async fn initialize(&mut self) -> Result<(), EngineError>;

    /// Connects and, where the protocol requires it (MQTT topic
    /// subscriptions, BACnet Who-Is/I-Am discovery), performs whatever
    /// setup depends on knowing the full point list up front. Called again
    /// on every reconnect attempt.
    async fn connect(&mut self, points: &[DataPoint]) -> Result<(), EngineError>;

    async fn disconnect(&mut self) -> Result<(), EngineError>;

    fn is_connected(&self) -> bool;

    /// Read the current value of every point in `points`. Drivers that can
    /// batch contiguous addresses (Modbus) do so internally; the caller
    /// always gets back one [`RawReading`] per requested point, in any
    /// order.
    async fn read_values(&mut self, points: &[DataPoint]) -> Result<Vec<RawReading>, EngineError>;

    async fn write_value(&mut self, point: &DataPoint, value: Value) -> Result<(), EngineError>;

    fn protocol_type(&self) -> crate::model::ProtocolTag;

    fn status(&self) -> DriverStatus;

    fn last_error(&self) -> Option<String>;

    fn statistics(&self) -> Arc<DriverStatistics>;

    fn reset_statistics(&self) {
        self.statistics().reset();
    }
}
