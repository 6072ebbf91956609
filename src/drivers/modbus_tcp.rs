//! Modbus TCP driver.
//!
//! Implements [`ProtocolDriver`] over `tokio-modbus`'s TCP client. Reads are
//! batched through [`super::modbus_common::group_points`] so a poll cycle
//! issues one PDU per contiguous register run instead of one per point.

use super::modbus_common::{classify_address, decode_registers, encode_registers, exception_to_error, group_points, ByteOrder, RegisterType};
use super::{DriverStatistics, DriverStatus, ProtocolDriver, RawReading};
use crate::errors::EngineError;
use crate::model::{DataPoint, DriverConfig, ProtocolTag, Value};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_modbus::prelude::*;
use tracing::info;

pub struct ModbusTcpDriver {
    config: DriverConfig,
    socket_addr: Option<SocketAddr>,
    unit_id: u8,
    byte_order: ByteOrder,
    max_group_registers: u16,
    ctx: Option<client::Context>,
    status: DriverStatus,
    last_error: Option<String>,
    stats: Arc<DriverStatistics>,
}

impl ModbusTcpDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            socket_addr: None,
            unit_id: 1,
            byte_order: ByteOrder::BigEndian,
            max_group_registers: 125,
            ctx: None,
            status: DriverStatus::Disconnected,
            last_error: None,
            stats: DriverStatistics::new(),
        }
    }

    fn set_error(&mut self, e: &EngineError) {
        self.last_error = Some(e.to_string());
        self.status = DriverStatus::Error;
    }
}

#[async_trait]
impl ProtocolDriver for ModbusTcpDriver {
    async fn initialize(&mut self) -> Result<(), EngineError> {
        let addr = self
            .config
            .endpoint
            .parse::<SocketAddr>()
            .map_err(|e| EngineError::configuration("endpoint", format!("invalid socket address: {e}")))?;
        self.socket_addr = Some(addr);
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
        let addr = self.socket_addr.ok_or_else(|| EngineError::configuration("endpoint", "not initialized"))?;
        self.status = DriverStatus::Connecting;
        info!(%addr, "connecting to Modbus TCP device");

        let slave = Slave(self.unit_id);
        let ctx = tcp::connect_slave(addr, slave)
            .await
            .map_err(|e| EngineError::ConnectionFailed(format!("modbus tcp connect: {e}")))?;

        self.ctx = Some(ctx);
        self.status = DriverStatus::Connected;
        self.last_error = None;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        self.ctx = None;
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
                RegisterType::Coil => {
                    let bools = ctx.read_coils(group.start, group.count).await;
                    match bools {
                        Ok(Ok(bits)) => Ok(Ok(bits.into_iter().map(|b| b as u16).collect())),
                        Ok(Err(e)) => Ok(Err(e)),
                        Err(e) => Err(e),
                    }
                }
                RegisterType::DiscreteInput => {
                    let bools = ctx.read_discrete_inputs(group.start, group.count).await;
                    match bools {
                        Ok(Ok(bits)) => Ok(Ok(bits.into_iter().map(|b| b as u16).collect())),
                        Ok(Err(e)) => Ok(Err(e)),
                        Err(e) => Err(e),
                    }
                }
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
                    let err = EngineError::ConnectionLost(format!("modbus tcp io error: {e}"));
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
                let err = EngineError::ConnectionLost(format!("modbus tcp io error: {e}"));
                self.set_error(&err);
                Err(err)
            }
        }
    }

    fn protocol_type(&self) -> ProtocolTag {
        ProtocolTag::ModbusTcp
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

    fn cfg(endpoint: &str) -> DriverConfig {
        DriverConfig {
            device_id: uuid::Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            timeout_ms: 3000,
            retry_count: 3,
            properties: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn initialize_parses_socket_address() {
        let mut driver = ModbusTcpDriver::new(cfg("127.0.0.1:502"));
        assert!(driver.initialize().await.is_ok());
        assert_eq!(driver.socket_addr.unwrap().port(), 502);
    }

    #[tokio::test]
    async fn initialize_rejects_bad_endpoint() {
        let mut driver = ModbusTcpDriver::new(cfg("not-an-address"));
        assert!(driver.initialize().await.is_err());
    }

    #[test]
    fn fresh_driver_is_disconnected() {
        let driver = ModbusTcpDriver::new(cfg("127.0.0.1:502"));
        assert!(!driver.is_connected());
        assert_eq!(driver.protocol_type(), ProtocolTag::ModbusTcp);
    }

    #[tokio::test]
    async fn initialize_reads_byte_order_and_group_cap_from_properties() {
        let mut config = cfg("127.0.0.1:502");
        config.properties.insert("byte_order".to_string(), serde_json::json!("little_endian"));
        config.properties.insert("max_registers_per_group".to_string(), serde_json::json!(32));
        let mut driver = ModbusTcpDriver::new(config);
        driver.initialize().await.unwrap();
        assert_eq!(driver.byte_order, ByteOrder::LittleEndian);
        assert_eq!(driver.max_group_registers, 32);
    }

    #[tokio::test]
    async fn initialize_defaults_byte_order_to_big_endian() {
        let mut driver = ModbusTcpDriver::new(cfg("127.0.0.1:502"));
        driver.initialize().await.unwrap();
        assert_eq!(driver.byte_order, ByteOrder::BigEndian);
    }
}
