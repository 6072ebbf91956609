//! Builds a not-yet-started [`Worker`] for a device, per the five-step
//! process: resolve protocol → load settings → load points → merge driver
//! config → instantiate driver and sinks.

use crate::config_registry::ProtocolConfigRegistry;
use crate::drivers::factory::create_driver;
use crate::errors::EngineResult;
use crate::model::{Device, DriverConfig};
use crate::repository::Repository;
use crate::sinks::{CacheSink, HistorySink};
use crate::worker::Worker;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

pub struct WorkerFactory {
    repository: Arc<Repository>,
    cache: Arc<Mutex<CacheSink>>,
    history: Arc<HistorySink>,
}

impl WorkerFactory {
    pub fn new(repository: Arc<Repository>, cache: Arc<Mutex<CacheSink>>, history: Arc<HistorySink>) -> Self {
        Self { repository, cache, history }
    }

    /// Step 1-5 of the device -> Worker build process. Each step fails with
    /// a distinct, named error so the Manager can log precisely why a
    /// device never came up.
    pub async fn create_worker(&self, device: &Device) -> EngineResult<Arc<Worker>> {
        // Step 1: protocol tag is decoded at repository read time; an
        // unparseable protocol column already failed there. A device
        // reaching this point always has a valid tag.
        let protocol = device.protocol;

        // Step 2: settings, defaulted if missing.
        let settings = match self.repository.find_settings(device.id).await {
            Ok(s) => s,
            Err(_) => {
                let defaults = crate::model::DeviceSettings::default();
                defaults.validate()?;
                defaults
            }
        };

        // Step 3: enabled points; empty is allowed.
        let points = self.repository.find_datapoints_for_device(device.id).await?;

        // Step 4: registry defaults merged with whatever the device's own
        // points specify, then validated against the protocol's required
        // keys (BACnet's discovery range, MQTT's client id, ...).
        let properties = ProtocolConfigRegistry::build(protocol, &points).map_err(|e| {
            error!(device_id = %device.id, error = %e, "driver config validation failed");
            e
        })?;
        let driver_config = DriverConfig {
            device_id: device.id,
            endpoint: device.endpoint.clone(),
            timeout_ms: settings.read_timeout_ms,
            retry_count: settings.retry_count,
            properties,
        };

        // Step 5: instantiate driver, wire sinks, wrap in Worker.
        let driver = create_driver(protocol, driver_config).map_err(|e| {
            error!(device_id = %device.id, error = %e, "failed to instantiate protocol driver");
            e
        })?;

        let worker = Worker::new(device.id, device.name.clone(), driver, points, settings, self.cache.clone(), self.history.clone());

        info!(device_id = %device.id, protocol = protocol.as_str(), "worker built, not yet started");
        Ok(worker)
    }

    /// Builds a Worker for every enabled device; a single device's failure
    /// is logged and does not stop the others.
    pub async fn create_all_active_workers(&self) -> EngineResult<Vec<Arc<Worker>>> {
        let devices = self.repository.find_all_active_devices().await?;
        let mut workers = Vec::with_capacity(devices.len());

        for device in devices {
            match self.create_worker(&device).await {
                Ok(worker) => workers.push(worker),
                Err(e) => error!(device_id = %device.id, error = %e, "failed to build worker for device, skipping"),
            }
        }

        Ok(workers)
    }
}
