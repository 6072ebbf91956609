//! Core data model shared by the repository, drivers, pipeline and sinks.
//!
//! These types mirror the logical configuration-store schema (§6): a
//! [`Device`] owns zero or more [`DataPoint`]s and one [`DeviceSettings`]
//! row. A [`DriverConfig`] is the merged, validated view handed to a
//! [`crate::drivers::ProtocolDriver`] at construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Transport-specific protocol tag carried on a [`Device`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolTag {
    ModbusTcp,
    ModbusRtu,
    Mqtt,
    BacnetIp,
}

impl ProtocolTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolTag::ModbusTcp => "MODBUS_TCP",
            ProtocolTag::ModbusRtu => "MODBUS_RTU",
            ProtocolTag::Mqtt => "MQTT",
            ProtocolTag::BacnetIp => "BACNET_IP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MODBUS_TCP" | "MODBUS-TCP" | "MODBUSTCP" => Some(ProtocolTag::ModbusTcp),
            "MODBUS_RTU" | "MODBUS-RTU" | "MODBUSRTU" => Some(ProtocolTag::ModbusRtu),
            "MQTT" => Some(ProtocolTag::Mqtt),
            "BACNET_IP" | "BACNET-IP" | "BACNETIP" | "BACNET" => Some(ProtocolTag::BacnetIp),
            _ => None,
        }
    }
}

/// Identity of a physical endpoint. Owned by the configuration store; the
/// engine only ever reads it through the [`crate::repository::Repository`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub protocol: ProtocolTag,
    pub endpoint: String,
    pub enabled: bool,
}

/// Per-device tunables. Invariants are enforced by [`DeviceSettings::validate`],
/// not by the constructor, so rows loaded from a permissive store can be
/// rejected with a specific [`crate::errors::EngineError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub connection_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub retry_count: u32,
    pub retry_interval_ms: u64,
    pub backoff_time_ms: u64,
    pub keep_alive: bool,
    pub polling_interval_ms: u64,
}

impl DeviceSettings {
    pub fn validate(&self) -> Result<(), crate::errors::EngineError> {
        if self.polling_interval_ms < 100 {
            return Err(crate::errors::EngineError::configuration(
                "polling_interval_ms",
                "must be >= 100ms",
            ));
        }
        if self.connection_timeout_ms == 0 {
            return Err(crate::errors::EngineError::configuration(
                "connection_timeout_ms",
                "must be > 0",
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(crate::errors::EngineError::configuration(
                "read_timeout_ms",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 5_000,
            read_timeout_ms: 3_000,
            retry_count: 3,
            retry_interval_ms: 1_000,
            backoff_time_ms: 30_000,
            keep_alive: true,
            polling_interval_ms: 1_000,
        }
    }
}

/// Declared data type of a [`DataPoint`]; also the shape of [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    Bytes,
}

impl DataType {
    /// Number of 16-bit Modbus registers this type occupies.
    pub fn modbus_word_width(&self) -> u16 {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 | DataType::Int16 | DataType::UInt16 => 1,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 2,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 4,
            DataType::String | DataType::Bytes => 1,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::String | DataType::Bytes)
    }
}

/// A typed reading or write payload: the sum type over [`DataType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Numeric projection used by range checks, scaling and deadband
    /// comparison. Strings and bytes have no numeric projection.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int8(v) => Some(*v as f64),
            Value::Int16(v) => Some(*v as f64),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::UInt8(v) => Some(*v as f64),
            Value::UInt16(v) => Some(*v as f64),
            Value::UInt32(v) => Some(*v as f64),
            Value::UInt64(v) => Some(*v as f64),
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            Value::String(_) | Value::Bytes(_) => None,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Int8(_) => DataType::Int8,
            Value::Int16(_) => DataType::Int16,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::UInt8(_) => DataType::UInt8,
            Value::UInt16(_) => DataType::UInt16,
            Value::UInt32(_) => DataType::UInt32,
            Value::UInt64(_) => DataType::UInt64,
            Value::Float32(_) => DataType::Float32,
            Value::Float64(_) => DataType::Float64,
            Value::String(_) => DataType::String,
            Value::Bytes(_) => DataType::Bytes,
        }
    }

    /// Build a numeric engineering value from a raw f64, re-typed to `dt`.
    /// Used by the Pipeline after scaling, and by drivers synthesizing a
    /// [`Value`] from decoded register words.
    pub fn from_f64(dt: DataType, raw: f64) -> Value {
        match dt {
            DataType::Bool => Value::Bool(raw != 0.0),
            DataType::Int8 => Value::Int8(raw as i8),
            DataType::Int16 => Value::Int16(raw as i16),
            DataType::Int32 => Value::Int32(raw as i32),
            DataType::Int64 => Value::Int64(raw as i64),
            DataType::UInt8 => Value::UInt8(raw as u8),
            DataType::UInt16 => Value::UInt16(raw as u16),
            DataType::UInt32 => Value::UInt32(raw as u32),
            DataType::UInt64 => Value::UInt64(raw as u64),
            DataType::Float32 => Value::Float32(raw as f32),
            DataType::Float64 => Value::Float64(raw),
            DataType::String | DataType::Bytes => Value::Float64(raw),
        }
    }
}

/// One addressable variable on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    pub id: Uuid,
    pub device_id: Uuid,
    pub name: String,
    /// Raw protocol address (e.g. the Modbus register number, unoffset).
    pub address: Option<u32>,
    /// Display-only address form (e.g. "40001", a BACnet object id string).
    pub address_string: Option<String>,
    pub data_type: DataType,
    pub unit: Option<String>,
    pub scaling_factor: f64,
    pub scaling_offset: f64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub writable: bool,
    pub enabled: bool,
    pub log_enabled: bool,
    pub log_interval_ms: u64,
    pub log_deadband: f64,
    pub poll_group: Option<String>,
    pub protocol_params: HashMap<String, serde_json::Value>,
}

impl DataPoint {
    pub fn protocol_param_str(&self, key: &str) -> Option<&str> {
        self.protocol_params.get(key).and_then(|v| v.as_str())
    }

    pub fn protocol_param_u64(&self, key: &str) -> Option<u64> {
        self.protocol_params.get(key).and_then(|v| v.as_u64())
    }

    /// Range check against `[min_value, max_value]`. Only meaningful for
    /// numeric data types; non-numeric points are always in range.
    pub fn in_range(&self, raw: f64) -> bool {
        if let Some(min) = self.min_value {
            if raw < min {
                return false;
            }
        }
        if let Some(max) = self.max_value {
            if raw > max {
                return false;
            }
        }
        true
    }
}

/// Quality tag on a reading, expressing how much it should be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
    NotConnected,
    DeviceFailure,
    SensorFailure,
    CommFailure,
    OutOfService,
    Maintenance,
}

impl Quality {
    pub fn is_good(&self) -> bool {
        matches!(self, Quality::Good)
    }
}

/// The pipeline quantum: one raw-or-processed reading for one DataPoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedValue {
    pub point_id: Uuid,
    pub value: Value,
    pub quality: Quality,
    /// Device time if the protocol supplies one, else the ingress time.
    pub source_timestamp: DateTime<Utc>,
    pub ingress_timestamp: DateTime<Utc>,
    /// Stamped only when `quality` transitions from its previous value for
    /// this point; otherwise carried forward from the prior reading.
    pub quality_timestamp: DateTime<Utc>,
    /// Set by the Pipeline's change-detection stage; `false` on raw driver
    /// output.
    pub changed: bool,
}

impl TimestampedValue {
    pub fn new(point_id: Uuid, value: Value, quality: Quality) -> Self {
        let now = Utc::now();
        Self {
            point_id,
            value,
            quality,
            source_timestamp: now,
            ingress_timestamp: now,
            quality_timestamp: now,
            changed: false,
        }
    }
}

/// The latest TimestampedValue per DataPoint, as persisted to the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentValue {
    pub device_id: Uuid,
    pub point_id: Uuid,
    pub value: Value,
    pub quality: Quality,
    pub value_timestamp: DateTime<Utc>,
    pub quality_timestamp: DateTime<Utc>,
    pub source: String,
    pub read_count: u64,
}

/// The immutable, merged view handed to a Driver at construction (§3).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub device_id: Uuid,
    pub endpoint: String,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub properties: HashMap<String, serde_json::Value>,
}

impl DriverConfig {
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    pub fn property_u64(&self, key: &str) -> Option<u64> {
        self.properties.get(key).and_then(|v| v.as_u64())
    }

    pub fn property_bool(&self, key: &str) -> Option<bool> {
        self.properties.get(key).and_then(|v| v.as_bool())
    }
}
