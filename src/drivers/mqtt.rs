//! MQTT driver.
//!
//! MQTT is subscription-based rather than polling-based: the event loop
//! runs in a background task and pushes retained-latest values into a
//! per-point cache; `read_values` is a non-blocking snapshot of that cache
//! rather than a round trip to the broker.

use super::{DriverStatistics, DriverStatus, ProtocolDriver, RawReading};
use crate::errors::EngineError;
use crate::model::{DataPoint, DataType, DriverConfig, ProtocolTag, Value};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

fn parse_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

struct Latest {
    value: Value,
    corrupt: bool,
}

#[derive(Clone)]
struct TopicMeta {
    point_id: Uuid,
    data_type: DataType,
    json_path: Option<String>,
}

pub struct MqttDriver {
    config: DriverConfig,
    client: Option<AsyncClient>,
    connected: Arc<AtomicBool>,
    latest: Arc<Mutex<HashMap<Uuid, Latest>>>,
    topic_meta: Arc<Mutex<HashMap<String, TopicMeta>>>,
    topic_for_point: HashMap<Uuid, String>,
    /// Every (topic, qos) pair derived from the current point list. Read by
    /// the background event-loop task on every `ConnAck`, so a reconnect
    /// re-subscribes the same way the initial connect did.
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    status: DriverStatus,
    last_error: Option<String>,
    stats: Arc<DriverStatistics>,
}

impl MqttDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            latest: Arc::new(Mutex::new(HashMap::new())),
            topic_meta: Arc::new(Mutex::new(HashMap::new())),
            topic_for_point: HashMap::new(),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            status: DriverStatus::Disconnected,
            last_error: None,
            stats: DriverStatistics::new(),
        }
    }

    /// Populates topic metadata/subscription list from `points`, without
    /// touching the network. Called synchronously from `connect()` so the
    /// background task always has the full subscription list before the
    /// first `ConnAck` arrives.
    fn prepare_subscriptions(&mut self, points: &[DataPoint]) -> Result<(), EngineError> {
        self.topic_for_point.clear();
        let mut topic_meta = self.topic_meta.lock().expect("mqtt topic meta poisoned");
        topic_meta.clear();
        let mut subscriptions = self.subscriptions.lock().expect("mqtt subscriptions poisoned");
        subscriptions.clear();

        for point in points {
            let topic = point
                .address_string
                .clone()
                .ok_or_else(|| EngineError::InvalidAddress(format!("point {} has no mqtt topic", point.id)))?;
            let qos = parse_qos(point.protocol_param_u64("qos").unwrap_or(1) as u8);
            topic_meta.insert(
                topic.clone(),
                TopicMeta {
                    point_id: point.id,
                    data_type: point.data_type,
                    json_path: point.protocol_param_str("json_path").map(str::to_string),
                },
            );
            self.topic_for_point.insert(point.id, topic.clone());
            subscriptions.push((topic, qos));
        }
        Ok(())
    }

    /// Extract a dotted path from a JSON payload, falling back to a bare
    /// numeric/string/bool scalar when the payload isn't an object.
    fn decode_payload(payload: &[u8], json_path: Option<&str>, data_type: DataType) -> Result<Value, EngineError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| EngineError::DataCorruption("mqtt payload is not valid utf-8".into()))?;

        let raw_json: Result<serde_json::Value, _> = serde_json::from_str(text);
        let scalar: serde_json::Value = match (raw_json, json_path) {
            (Ok(json), Some(path)) => {
                let mut cur = &json;
                for segment in path.split('.') {
                    cur = cur
                        .get(segment)
                        .ok_or_else(|| EngineError::DataCorruption(format!("json path '{path}' not found in payload")))?;
                }
                cur.clone()
            }
            (Ok(json), None) => json,
            (Err(_), _) => serde_json::Value::String(text.to_string()),
        };

        match data_type {
            DataType::String => Ok(Value::String(
                scalar.as_str().map(str::to_string).unwrap_or_else(|| scalar.to_string()),
            )),
            DataType::Bool => scalar
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| EngineError::DataCorruption("expected a boolean mqtt payload".into())),
            dt => {
                let n = scalar
                    .as_f64()
                    .ok_or_else(|| EngineError::DataCorruption("expected a numeric mqtt payload".into()))?;
                Ok(Value::from_f64(dt, n))
            }
        }
    }
}

#[async_trait]
impl ProtocolDriver for MqttDriver {
    async fn initialize(&mut self) -> Result<(), EngineError> {
        Url::parse(&self.config.endpoint)
            .map_err(|e| EngineError::configuration("endpoint", format!("invalid mqtt url: {e}")))?;
        Ok(())
    }

    async fn connect(&mut self, points: &[DataPoint]) -> Result<(), EngineError> {
        self.status = DriverStatus::Connecting;
        self.prepare_subscriptions(points)?;

        let url = Url::parse(&self.config.endpoint)
            .map_err(|e| EngineError::configuration("endpoint", format!("invalid mqtt url: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::configuration("endpoint", "missing mqtt host"))?
            .to_string();
        let port = url.port().unwrap_or(1883);

        let client_id = self
            .config
            .property_str("client_id")
            .map(str::to_string)
            .unwrap_or_else(|| format!("collector-{}", self.config.device_id));

        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(30));

        if let (Some(u), Some(p)) = (self.config.property_str("username"), self.config.property_str("password")) {
            opts.set_credentials(u, p);
        }

        if let Some(will_topic) = self.config.property_str("will_topic") {
            let will_payload = self.config.property_str("will_payload").unwrap_or("offline").as_bytes().to_vec();
            opts.set_last_will(rumqttc::LastWill::new(will_topic, will_payload, QoS::AtLeastOnce, true));
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        let connected = self.connected.clone();
        let latest = self.latest.clone();
        let topic_meta = self.topic_meta.clone();
        let subscriptions = self.subscriptions.clone();
        let subscribe_client = client.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        info!("mqtt broker connection acknowledged");
                        let topics = subscriptions.lock().expect("mqtt subscriptions poisoned").clone();
                        for (topic, qos) in topics {
                            if let Err(e) = subscribe_client.subscribe(&topic, qos).await {
                                warn!(topic = %topic, error = %e, "mqtt subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected.store(false, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let meta = topic_meta.lock().expect("mqtt topic meta poisoned").get(publish.topic.as_str()).cloned();
                        if let Some(meta) = meta {
                            let mut cache = latest.lock().expect("mqtt latest cache poisoned");
                            match MqttDriver::decode_payload(&publish.payload, meta.json_path.as_deref(), meta.data_type) {
                                Ok(value) => {
                                    cache.insert(meta.point_id, Latest { value, corrupt: false });
                                }
                                Err(e) => {
                                    warn!(topic = %publish.topic, error = %e, "failed to decode mqtt payload");
                                    cache.insert(meta.point_id, Latest { value: Value::Bool(false), corrupt: true });
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        error!(error = %e, "mqtt event loop error");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        });

        self.client = Some(client);
        self.status = DriverStatus::Connected;
        self.connected.store(true, Ordering::SeqCst);
        self.last_error = None;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.status = DriverStatus::Disconnected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read_values(&mut self, points: &[DataPoint]) -> Result<Vec<RawReading>, EngineError> {
        if self.client.is_none() {
            return Err(EngineError::ConnectionLost("not connected".into()));
        }

        let latest = self.latest.lock().expect("mqtt latest cache poisoned");
        let mut out = Vec::with_capacity(points.len());
        for point in points {
            match latest.get(&point.id) {
                Some(entry) if entry.corrupt => {
                    self.stats.record_read(false);
                    out.push(RawReading {
                        point_id: point.id,
                        value: None,
                        error: Some(EngineError::DataCorruption("last payload failed to decode".into())),
                    });
                }
                Some(entry) => {
                    self.stats.record_read(true);
                    out.push(RawReading { point_id: point.id, value: Some(entry.value.clone()), error: None });
                }
                None => {
                    out.push(RawReading { point_id: point.id, value: None, error: None });
                }
            }
        }
        Ok(out)
    }

    async fn write_value(&mut self, point: &DataPoint, value: Value) -> Result<(), EngineError> {
        let client = self.client.as_ref().ok_or(EngineError::ConnectionLost("not connected".into()))?;
        let topic = point
            .address_string
            .clone()
            .ok_or_else(|| EngineError::InvalidAddress(format!("point {} has no mqtt topic", point.id)))?;
        let payload = serde_json::to_vec(&value).map_err(|e| EngineError::SystemError(e.to_string()))?;
        let qos = parse_qos(point.protocol_param_u64("qos").unwrap_or(1) as u8);

        match client.publish(&topic, qos, false, payload).await {
            Ok(()) => {
                self.stats.record_write(true);
                Ok(())
            }
            Err(e) => {
                self.stats.record_write(false);
                Err(EngineError::ProtocolError(format!("publish failed: {e}")))
            }
        }
    }

    fn protocol_type(&self) -> ProtocolTag {
        ProtocolTag::Mqtt
    }

    fn status(&self) -> DriverStatus {
        self.status
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    fn statistics(&self) -> Arc<DriverStatistics> {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_qos_defaults_unknown_to_at_least_once() {
        assert!(matches!(parse_qos(0), QoS::AtMostOnce));
        assert!(matches!(parse_qos(1), QoS::AtLeastOnce));
        assert!(matches!(parse_qos(2), QoS::ExactlyOnce));
        assert!(matches!(parse_qos(9), QoS::AtLeastOnce));
    }

    #[test]
    fn decode_payload_extracts_dotted_json_path() {
        let payload = br#"{"sensor":{"temp":21.5}}"#;
        let v = MqttDriver::decode_payload(payload, Some("sensor.temp"), DataType::Float64).unwrap();
        assert_eq!(v, Value::Float64(21.5));
    }

    #[test]
    fn decode_payload_rejects_non_numeric_for_numeric_type() {
        let payload = br#""not a number""#;
        let err = MqttDriver::decode_payload(payload, None, DataType::Float64).unwrap_err();
        assert!(matches!(err, EngineError::DataCorruption(_)));
    }

    #[test]
    fn decode_payload_falls_back_to_bare_scalar_without_path() {
        let payload = b"42.0";
        let v = MqttDriver::decode_payload(payload, None, DataType::Float64).unwrap();
        assert_eq!(v, Value::Float64(42.0));
    }

    fn point_on_topic(topic: &str) -> DataPoint {
        DataPoint {
            id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            name: "p".to_string(),
            address: None,
            address_string: Some(topic.to_string()),
            data_type: DataType::Float64,
            unit: None,
            scaling_factor: 1.0,
            scaling_offset: 0.0,
            min_value: None,
            max_value: None,
            writable: false,
            enabled: true,
            log_enabled: true,
            log_interval_ms: 1000,
            log_deadband: 0.0,
            poll_group: None,
            protocol_params: HashMap::new(),
        }
    }

    fn driver() -> MqttDriver {
        MqttDriver::new(DriverConfig {
            device_id: Uuid::new_v4(),
            endpoint: "mqtt://localhost:1883".to_string(),
            timeout_ms: 3000,
            retry_count: 3,
            properties: HashMap::new(),
        })
    }

    #[test]
    fn prepare_subscriptions_builds_topic_meta_and_subscription_list() {
        let mut driver = driver();
        let points = [point_on_topic("site/a/temp"), point_on_topic("site/a/pressure")];
        driver.prepare_subscriptions(&points).unwrap();

        assert_eq!(driver.topic_for_point.len(), 2);
        assert_eq!(driver.subscriptions.lock().unwrap().len(), 2);
        assert_eq!(driver.topic_meta.lock().unwrap().len(), 2);
    }

    #[test]
    fn prepare_subscriptions_rejects_point_without_topic() {
        let mut driver = driver();
        let mut point = point_on_topic("ignored");
        point.address_string = None;
        let err = driver.prepare_subscriptions(&[point]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidAddress(_)));
    }

    #[test]
    fn prepare_subscriptions_replaces_prior_point_list() {
        let mut driver = driver();
        driver.prepare_subscriptions(&[point_on_topic("site/a/temp")]).unwrap();
        driver.prepare_subscriptions(&[point_on_topic("site/b/temp")]).unwrap();

        assert_eq!(driver.subscriptions.lock().unwrap().len(), 1);
        assert_eq!(driver.subscriptions.lock().unwrap()[0].0, "site/b/temp");
    }
}
