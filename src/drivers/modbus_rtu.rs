//! Modbus RTU driver over a serial line.
//!
//! Shares batching/codec logic with [`super::modbus_tcp`]. Serial ports are
//! exclusive OS resources: two Workers configured against the same device
//! path would otherwise both try to open it, so a process-wide registry
//! hands out `ResourceBusy` on a double-open instead of racing the kernel.

use super::modbus_common::{classify_address, decode_registers, encode_registers, exception_to_error, group_points, ByteOrder, RegisterType};
use super::{DriverStatistics, DriverStatus, ProtocolDriver, RawReading};
use crate::errors::EngineError;
use crate::model::{DataPoint, DriverConfig, ProtocolTag, Value};
use async_trait::async_trait;
use lazy_static::lazy_static;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;
use tracing::info;

lazy_static! {
    /// Serial port paths currently owned by a live driver instance.
    static ref OPEN_PORTS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

fn acquire_port(path: &str) -> Result<(), EngineError> {
    let mut guard = OPEN_PORTS.lock().expect("serial port registry poisoned");
    if !guard.insert(path.to_string()) {
        return Err(EngineError::ResourceBusy(format!("serial port {path} already in use")));
    }
    Ok(())
}

fn release_port(path: &str) {
    OPEN_PORTS.lock().expect("serial port registry poisoned").remove(path);
}

pub struct ModbusRtuDriver {
    config: DriverConfig,
    port_path: String,
    baud_rate: u32,
    unit_id: u8,
    byte_order: ByteOrder,
    max_group_registers: u16,
    ctx: Option<client::Context>,
    status: DriverStatus,
    last_error: Option<String>,
    stats: Arc<DriverStatistics>,
    port_held: bool,
}

impl ModbusRtuDriver {
    pub fn new(config: DriverConfig) -> Self {
        let port_path = config.endpoint.clone();
        Self {
            config,
            port_path,
            baud_rate: 9600,
            unit_id: 1,
            byte_order: ByteOrder::BigEndian,
            max_group_registers: 125,
            ctx: None,
            status: DriverStatus::Disconnected,
            last_error: None,
            stats: DriverStatistics::new(),
            port_held: false,
        }
    }

    fn set_error(&mut self, e: &EngineError) {
        self.last_error = Some(e.to_string());
        self.status = DriverStatus::Error;
    }
}

impl Drop for ModbusRtuDriver {
    fn drop(&mut self) {
        if self.port_held {
            release_port(&self.port_path);
        }
    }
}

#[async_trait]
impl ProtocolDriver for ModbusRtuDriver {
    async fn initialize(&mut self) -> Result<(), EngineError> {
        self.baud_rate = self.config.property_u64("baud_rate").unwrap_or(9600) as u32;
        self.unit_id = self.config.property_u64("unit_id").unwrap_or(1) as u8;
        self.byte_order = self
            .config
            .property_str("byte_order")
            .and_then(ByteOrder::parse)
            .unwrap_or_default();
        self.max_group_registers = self.config.property_u64("max_registers_per_group").unwrap_or(125) as u16;
        Ok(())
    }

    async fn connect(&mut self, _points: &[DataPoint]) -> Result<(), EngineError> {
        self.status = DriverStatus::Connecting;
        acquire_port(&self.port_path)?;
        self.port_held = true;

        info!(port = %self.port_path, baud = self.baud_rate, "opening Modbus RTU serial port");

        let builder = tokio_serial::new(&self.port_path, self.baud_rate);
        let port = SerialStream::open(&builder).map_err(|e| {
            release_port(&self.port_path);
            self.port_held = false;
            EngineError::ConnectionFailed(format!("serial open failed: {e}"))
        })?;

        let slave = Slave(self.unit_id);
        let ctx = rtu::attach_slave(port, slave);
        self.ctx = Some(ctx);
        self.status = DriverStatus::Connected;
        self.last_error = None;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        self.ctx = None;
        if self.port_held {
            release_port(&self.port_path);
            self.port_held = false;
        }
        self.status = DriverStatus::Disconnected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(self.status, DriverStatus::Connected)
    }

    async fn read_values(&mut self, points: &[DataPoint]) -> Result<Vec<RawReading>, EngineError> {
        let ctx = self.ctx.as_mut().ok_or(EngineError::ConnectionLost("not connected".into()))?;
        let groups = group_points(points, self.max_group_registers)?;
        let mut out = Vec::with_capacity(points.len());

        for group in &groups {
            let words_result = match group.register_type {
                RegisterType::HoldingRegister => ctx.read_holding_registers(group.start, group.count).await,
                RegisterType::InputRegister => ctx.read_input_registers(group.start, group.count).await,
                RegisterType::Coil => match ctx.read_coils(group.start, group.count).await {
                    Ok(Ok(bits)) => Ok(Ok(bits.into_iter().map(|b| b as u16).collect())),
                    Ok(Err(e)) => Ok(Err(e)),
                    Err(e) => Err(e),
                },
                RegisterType::DiscreteInput => match ctx.read_discrete_inputs(group.start, group.count).await {
                    Ok(Ok(bits)) => Ok(Ok(bits.into_iter().map(|b| b as u16).collect())),
                    Ok(Err(e)) => Ok(Err(e)),
                    Err(e) => Err(e),
                },
            };

            let words: Vec<u16> = match words_result {
                Ok(Ok(words)) => words,
                Ok(Err(exc)) => {
                    let err = exception_to_error(exc as u8);
                    self.stats.record_read(false);
                    for m in &group.members {
                        out.push(RawReading { point_id: m.point_id, value: None, error: Some(err.clone()) });
                    }
                    continue;
                }
                Err(e) => {
                    let err = EngineError::ConnectionLost(format!("modbus rtu io error: {e}"));
                    self.set_error(&err);
                    return Err(err);
                }
            };

            for member in &group.members {
                let slice = &words[member.offset_in_group as usize..];
                match decode_registers(slice, member.data_type, self.byte_order) {
                    Ok(value) => {
                        self.stats.record_read(true);
                        out.push(RawReading { point_id: member.point_id, value: Some(value), error: None });
                    }
                    Err(e) => {
                        self.stats.record_read(false);
                        out.push(RawReading { point_id: member.point_id, value: None, error: Some(e) });
                    }
                }
            }
        }

        Ok(out)
    }

    async fn write_value(&mut self, point: &DataPoint, value: Value) -> Result<(), EngineError> {
        let (register_type, offset) = classify_address(point)?;
        let ctx = self.ctx.as_mut().ok_or(EngineError::ConnectionLost("not connected".into()))?;

        let result = match register_type {
            RegisterType::Coil => {
                let bit = value.as_f64().unwrap_or(0.0) != 0.0;
                ctx.write_single_coil(offset, bit).await
            }
            RegisterType::HoldingRegister => {
                let words = encode_registers(&value, point.data_type, self.byte_order)?;
                if words.len() == 1 {
                    ctx.write_single_register(offset, words[0]).await
                } else {
                    ctx.write_multiple_registers(offset, &words).await
                }
            }
            RegisterType::DiscreteInput | RegisterType::InputRegister => {
                return Err(EngineError::AccessDenied(format!(
                    "point {} maps to a read-only register type",
                    point.id
                )))
            }
        };

        match result {
            Ok(Ok(())) => {
                self.stats.record_write(true);
                Ok(())
            }
            Ok(Err(exc)) => {
                self.stats.record_write(false);
                Err(exception_to_error(exc as u8))
            }
            Err(e) => {
                let err = EngineError::ConnectionLost(format!("modbus rtu io error: {e}"));
                self.set_error(&err);
                Err(err)
            }
        }
    }

    fn protocol_type(&self) -> ProtocolTag {
        ProtocolTag::ModbusRtu
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
    use std::collections::HashMap;

    fn cfg(path: &str) -> DriverConfig {
        DriverConfig {
            device_id: uuid::Uuid::new_v4(),
            endpoint: path.to_string(),
            timeout_ms: 3000,
            retry_count: 3,
            properties: HashMap::new(),
        }
    }

    #[test]
    fn double_open_of_same_port_is_rejected() {
        let path = "/dev/ttyTESTXYZ";
        release_port(path);
        acquire_port(path).unwrap();
        let err = acquire_port(path).unwrap_err();
        assert!(matches!(err, EngineError::ResourceBusy(_)));
        release_port(path);
    }

    #[tokio::test]
    async fn initialize_reads_baud_and_unit_id_from_properties() {
        let mut props = HashMap::new();
        props.insert("baud_rate".to_string(), serde_json::json!(19200));
        props.insert("unit_id".to_string(), serde_json::json!(5));
        let mut driver = ModbusRtuDriver::new(DriverConfig {
            device_id: uuid::Uuid::new_v4(),
            endpoint: "/dev/ttyTESTABC".to_string(),
            timeout_ms: 3000,
            retry_count: 3,
            properties: props,
        });
        driver.initialize().await.unwrap();
        assert_eq!(driver.baud_rate, 19200);
        assert_eq!(driver.unit_id, 5);
    }

    #[test]
    fn fresh_driver_is_disconnected() {
        let driver = ModbusRtuDriver::new(cfg("/dev/ttyTESTDEF"));
        assert!(!driver.is_connected());
        assert_eq!(driver.protocol_type(), ProtocolTag::ModbusRtu);
    }

    #[tokio::test]
    async fn initialize_reads_byte_order_from_properties() {
        let mut props = HashMap::new();
        props.insert("byte_order".to_string(), serde_json::json!("little_endian"));
        let mut driver = ModbusRtuDriver::new(DriverConfig {
            device_id: uuid::Uuid::new_v4(),
            endpoint: "/dev/ttyTESTGHI".to_string(),
            timeout_ms: 3000,
            retry_count: 3,
            properties: props,
        });
        driver.initialize().await.unwrap();
        assert_eq!(driver.byte_order, ByteOrder::LittleEndian);
    }
}
