//! History sink: InfluxDB line protocol over HTTP.
//!
//! Only reached when the Pipeline decides a reading is worth historizing
//! (§ fan-out). Buffers writes and flushes on a size or time trigger, the
//! same two-trigger shape the teacher's `Aggregator` uses for its batch
//! writer.

use crate::errors::{EngineError, EngineResult};
use crate::model::{CurrentValue, Quality, Value};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub url: String,
    pub database: String,
    pub token: Option<String>,
    pub measurement: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            database: "collector".to_string(),
            token: None,
            measurement: "data_point".to_string(),
            batch_size: 500,
            flush_interval_ms: 2000,
        }
    }
}

struct HistoryPoint {
    point_id: uuid::Uuid,
    device_id: uuid::Uuid,
    value: Value,
    quality: Quality,
    timestamp_ns: i64,
}

fn quality_tag(q: Quality) -> &'static str {
    match q {
        Quality::Good => "good",
        Quality::Uncertain => "uncertain",
        Quality::Bad => "bad",
        Quality::NotConnected => "not_connected",
        Quality::DeviceFailure => "device_failure",
        Quality::SensorFailure => "sensor_failure",
        Quality::CommFailure => "comm_failure",
        Quality::OutOfService => "out_of_service",
        Quality::Maintenance => "maintenance",
    }
}

fn escape_tag(s: &str) -> String {
    s.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

fn line_protocol_field(value: &Value) -> String {
    match value {
        Value::Bool(b) => format!("value={b}"),
        Value::String(s) => format!("value=\"{}\"", s.replace('"', "\\\"")),
        Value::Bytes(b) => format!("value=\"{}\"", hex::encode_bytes(b)),
        other => format!("value={}", other.as_f64().unwrap_or(0.0)),
    }
}

mod hex {
    pub fn encode_bytes(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn to_line(measurement: &str, point: &HistoryPoint) -> String {
    format!(
        "{measurement},point_id={},device_id={},quality={} {} {}",
        escape_tag(&point.point_id.to_string()),
        escape_tag(&point.device_id.to_string()),
        quality_tag(point.quality),
        line_protocol_field(&point.value),
        point.timestamp_ns
    )
}

pub struct HistorySink {
    client: Client,
    config: HistoryConfig,
    buffer: Arc<Mutex<Vec<HistoryPoint>>>,
}

impl HistorySink {
    pub fn new(config: HistoryConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::SystemError(format!("failed to build http client: {e}")))?;
        Ok(Self { client, config, buffer: Arc::new(Mutex::new(Vec::new())) })
    }

    /// Spawns the interval-driven flush task. Mirrors the teacher's
    /// `Aggregator::start`: a background loop that flushes on a timer in
    /// addition to the size-triggered flush in `add_reading`.
    pub fn start(self: &Arc<Self>) {
        let sink = self.clone();
        let mut ticker = interval(Duration::from_millis(self.config.flush_interval_ms));
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                if let Err(e) = sink.flush("interval").await {
                    error!(error = %e, "history sink interval flush failed");
                }
            }
        });
    }

    pub async fn add_reading(&self, device_id: uuid::Uuid, value: &CurrentValue) -> EngineResult<()> {
        let point = HistoryPoint {
            point_id: value.point_id,
            device_id,
            value: value.value.clone(),
            quality: value.quality,
            timestamp_ns: value.value_timestamp.timestamp_nanos_opt().unwrap_or(0),
        };

        let should_flush = {
            let mut buf = self.buffer.lock().await;
            buf.push(point);
            buf.len() >= self.config.batch_size
        };

        if should_flush {
            self.flush("size").await?;
        }
        Ok(())
    }

    async fn flush(&self, reason: &str) -> EngineResult<()> {
        let batch = {
            let mut buf = self.buffer.lock().await;
            if buf.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buf)
        };

        let mut per_device_counts: std::collections::HashMap<uuid::Uuid, usize> = std::collections::HashMap::new();
        for p in &batch {
            *per_device_counts.entry(p.device_id).or_insert(0) += 1;
        }

        let body = batch.iter().map(|p| to_line(&self.config.measurement, p)).collect::<Vec<_>>().join("\n");
        debug!(count = batch.len(), reason, "flushing history sink batch");

        let timer = std::time::Instant::now();
        let result = self.write_line_protocol(&body).await;
        let elapsed = timer.elapsed().as_secs_f64();
        for (device_id, count) in &per_device_counts {
            let label = device_id.to_string();
            crate::metrics::HISTORY_WRITE_LATENCY.with_label_values(&[&label]).observe(elapsed);
            crate::metrics::HISTORY_BATCH_SIZE.with_label_values(&[&label]).observe(*count as f64);
        }
        result
    }

    async fn write_line_protocol(&self, data: &str) -> EngineResult<()> {
        let url = format!("{}/write?db={}", self.config.url, self.config.database);
        let mut request = self.client.post(&url).body(data.to_string());
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            status => {
                let text = response.text().await.unwrap_or_else(|_| status.to_string());
                warn!(status = %status, body = %text, "history sink write rejected");
                Err(EngineError::SystemError(format!("influx write failed: {status} - {text}")))
            }
        }
    }

    pub async fn ping(&self) -> EngineResult<()> {
        let url = format!("{}/ping", self.config.url);
        self.client.get(&url).send().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_point() -> HistoryPoint {
        HistoryPoint {
            point_id: uuid::Uuid::nil(),
            device_id: uuid::Uuid::nil(),
            value: Value::Float64(21.5),
            quality: Quality::Good,
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or(0),
        }
    }

    #[test]
    fn line_protocol_includes_measurement_tags_and_field() {
        let line = to_line("data_point", &sample_point());
        assert!(line.starts_with("data_point,point_id="));
        assert!(line.contains("quality=good"));
        assert!(line.contains("value=21.5"));
    }

    #[test]
    fn string_values_are_quoted_and_escaped() {
        let field = line_protocol_field(&Value::String("a\"b".to_string()));
        assert_eq!(field, "value=\"a\\\"b\"");
    }

    #[test]
    fn escape_tag_escapes_reserved_characters() {
        assert_eq!(escape_tag("a b,c=d"), "a\\ b\\,c\\=d");
    }
}
