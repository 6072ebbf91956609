//! Cache sink: the always-on "latest value" store, backed by Redis.
//!
//! Every processed reading is written here regardless of the Pipeline's
//! fan-out decision for history, so readers always see the most recent
//! value/quality pair for a point even between history writes.

use crate::errors::EngineResult;
use crate::model::CurrentValue;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct CacheSink {
    conn: ConnectionManager,
}

fn current_value_key(device_id: uuid::Uuid, point_id: uuid::Uuid) -> String {
    format!("device:{device_id}:point:{point_id}")
}

impl CacheSink {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| crate::errors::EngineError::ConnectionTimeout(5000))??;
        Ok(Self { conn })
    }

    pub async fn write(&mut self, value: &CurrentValue) -> EngineResult<()> {
        let key = current_value_key(value.device_id, value.point_id);
        let payload = serde_json::to_string(value).map_err(|e| crate::errors::EngineError::SystemError(e.to_string()))?;
        let timer = Instant::now();
        let _: () = self.conn.set(&key, payload).await?;
        crate::metrics::CACHE_WRITE_LATENCY
            .with_label_values(&[&value.device_id.to_string()])
            .observe(timer.elapsed().as_secs_f64());
        debug!(point_id = %value.point_id, "wrote current value to cache");
        Ok(())
    }

    pub async fn write_batch(&mut self, values: &[CurrentValue]) -> EngineResult<()> {
        for value in values {
            self.write(value).await?;
        }
        Ok(())
    }

    pub async fn read(&mut self, device_id: uuid::Uuid, point_id: uuid::Uuid) -> EngineResult<Option<CurrentValue>> {
        let key = current_value_key(device_id, point_id);
        let payload: Option<String> = self.conn.get(&key).await?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(|e| crate::errors::EngineError::DataCorruption(e.to_string())))
            .transpose()
    }

    pub async fn publish_status(&mut self, device_id: uuid::Uuid, status_json: &str) -> EngineResult<()> {
        let key = format!("worker:{device_id}:status");
        let _: () = self.conn.set(&key, status_json).await?;
        Ok(())
    }

    pub async fn ping(&mut self) -> EngineResult<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_includes_device_id_and_point_id() {
        let device_id = uuid::Uuid::nil();
        let point_id = uuid::Uuid::nil();
        let key = current_value_key(device_id, point_id);
        assert_eq!(
            key,
            "device:00000000-0000-0000-0000-000000000000:point:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn status_key_uses_worker_prefix() {
        let device_id = uuid::Uuid::nil();
        let key = format!("worker:{device_id}:status");
        assert_eq!(key, "worker:00000000-0000-0000-0000-000000000000:status");
    }
}
