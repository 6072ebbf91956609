//! Per-protocol driver-config defaults and required-key validation.
//!
//! Each driver only reads its own properties out of
//! [`crate::model::DriverConfig::properties`] (`property_u64`, `property_str`,
//! ...); this is where those defaults live in one place, and where a device
//! missing a genuinely required property (BACnet's discovery range, MQTT's
//! client id) fails at worker-build time with a named `CONFIGURATION_ERROR`
//! instead of surfacing as a cryptic failure on first connect.

use crate::errors::{EngineError, EngineResult};
use crate::model::{DataPoint, ProtocolTag};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

pub struct ProtocolConfigRegistry;

impl ProtocolConfigRegistry {
    pub fn defaults(protocol: ProtocolTag) -> HashMap<String, JsonValue> {
        let mut map = HashMap::new();
        match protocol {
            ProtocolTag::ModbusTcp => {
                map.insert("unit_id".to_string(), JsonValue::from(1));
                map.insert("byte_order".to_string(), JsonValue::from("big_endian"));
                map.insert("max_registers_per_group".to_string(), JsonValue::from(125));
            }
            ProtocolTag::ModbusRtu => {
                map.insert("baud_rate".to_string(), JsonValue::from(9600));
                map.insert("unit_id".to_string(), JsonValue::from(1));
                map.insert("byte_order".to_string(), JsonValue::from("big_endian"));
                map.insert("max_registers_per_group".to_string(), JsonValue::from(125));
                map.insert("parity".to_string(), JsonValue::from("none"));
                map.insert("data_bits".to_string(), JsonValue::from(8));
                map.insert("stop_bits".to_string(), JsonValue::from(1));
            }
            ProtocolTag::Mqtt => {
                map.insert("qos".to_string(), JsonValue::from(1));
                map.insert("clean_session".to_string(), JsonValue::from(true));
            }
            ProtocolTag::BacnetIp => {}
        }
        map
    }

    pub fn required_keys(protocol: ProtocolTag) -> &'static [&'static str] {
        match protocol {
            ProtocolTag::ModbusTcp | ProtocolTag::ModbusRtu => &[],
            ProtocolTag::Mqtt => &["client_id"],
            ProtocolTag::BacnetIp => &["device_instance_low", "device_instance_high"],
        }
    }

    pub fn validate(protocol: ProtocolTag, properties: &HashMap<String, JsonValue>) -> EngineResult<()> {
        for key in Self::required_keys(protocol) {
            if !properties.contains_key(*key) {
                return Err(EngineError::configuration(key, format!("required for {} devices", protocol.as_str())));
            }
        }
        Ok(())
    }

    /// Registry defaults overlaid with whatever a device's points specify in
    /// their own `protocol_params`, then validated against the protocol's
    /// required keys. A key named by more than one point keeps the value
    /// from whichever point was encountered first, so the merged config
    /// doesn't depend on the caller's iteration order beyond that.
    pub fn build(protocol: ProtocolTag, points: &[DataPoint]) -> EngineResult<HashMap<String, JsonValue>> {
        let mut properties = Self::defaults(protocol);
        for point in points {
            for (key, value) in &point.protocol_params {
                properties.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Self::validate(protocol, &properties)?;
        Ok(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn point_with_params(params: &[(&str, JsonValue)]) -> DataPoint {
        let mut protocol_params = HashMap::new();
        for (k, v) in params {
            protocol_params.insert(k.to_string(), v.clone());
        }
        DataPoint {
            id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            name: "p".to_string(),
            address: Some(0),
            address_string: None,
            data_type: crate::model::DataType::Float32,
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
            protocol_params,
        }
    }

    #[test]
    fn modbus_tcp_defaults_are_populated() {
        let defaults = ProtocolConfigRegistry::defaults(ProtocolTag::ModbusTcp);
        assert_eq!(defaults.get("unit_id"), Some(&JsonValue::from(1)));
        assert_eq!(defaults.get("byte_order"), Some(&JsonValue::from("big_endian")));
    }

    #[test]
    fn bacnet_missing_required_keys_is_rejected() {
        let properties = ProtocolConfigRegistry::defaults(ProtocolTag::BacnetIp);
        let err = ProtocolConfigRegistry::validate(ProtocolTag::BacnetIp, &properties).unwrap_err();
        assert!(matches!(err, EngineError::ConfigurationError { .. }));
    }

    #[test]
    fn mqtt_requires_client_id() {
        let points = [point_with_params(&[])];
        let err = ProtocolConfigRegistry::build(ProtocolTag::Mqtt, &points).unwrap_err();
        assert!(matches!(err, EngineError::ConfigurationError { .. }));
    }

    #[test]
    fn mqtt_client_id_from_point_satisfies_validation() {
        let points = [point_with_params(&[("client_id", JsonValue::from("edge-01"))])];
        let properties = ProtocolConfigRegistry::build(ProtocolTag::Mqtt, &points).unwrap();
        assert_eq!(properties.get("client_id"), Some(&JsonValue::from("edge-01")));
        assert_eq!(properties.get("qos"), Some(&JsonValue::from(1)));
    }

    #[test]
    fn first_point_wins_on_duplicate_keys() {
        let points = [
            point_with_params(&[("byte_order", JsonValue::from("little_endian"))]),
            point_with_params(&[("byte_order", JsonValue::from("big_endian"))]),
        ];
        let properties = ProtocolConfigRegistry::build(ProtocolTag::ModbusTcp, &points).unwrap();
        assert_eq!(properties.get("byte_order"), Some(&JsonValue::from("little_endian")));
    }
}
