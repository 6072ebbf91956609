//! Builds a boxed [`ProtocolDriver`] for a [`ProtocolTag`]. The Worker
//! Factory calls this once per device at construction time; it never
//! branches on protocol type again afterward.

use super::bacnet::BacnetDriver;
use super::modbus_rtu::ModbusRtuDriver;
use super::modbus_tcp::ModbusTcpDriver;
use super::mqtt::MqttDriver;
use super::ProtocolDriver;
use crate::errors::EngineError;
use crate::model::{DriverConfig, ProtocolTag};

pub fn create_driver(protocol: ProtocolTag, config: DriverConfig) -> Result<Box<dyn ProtocolDriver>, EngineError> {
    match protocol {
        ProtocolTag::ModbusTcp => Ok(Box::new(ModbusTcpDriver::new(config))),
        ProtocolTag::ModbusRtu => Ok(Box::new(ModbusRtuDriver::new(config))),
        ProtocolTag::Mqtt => Ok(Box::new(MqttDriver::new(config))),
        ProtocolTag::BacnetIp => Ok(Box::new(BacnetDriver::new(config))),
    }
}

pub fn supported_protocols() -> &'static [&'static str] {
    &["MODBUS_TCP", "MODBUS_RTU", "MQTT", "BACNET_IP"]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn cfg() -> DriverConfig {
        DriverConfig {
            device_id: Uuid::new_v4(),
            endpoint: "127.0.0.1:502".to_string(),
            timeout_ms: 3000,
            retry_count: 3,
            properties: HashMap::new(),
        }
    }

    #[test]
    fn creates_a_driver_for_every_supported_protocol() {
        for tag in [ProtocolTag::ModbusTcp, ProtocolTag::ModbusRtu, ProtocolTag::Mqtt, ProtocolTag::BacnetIp] {
            assert!(create_driver(tag, cfg()).is_ok());
        }
    }

    #[test]
    fn supported_protocols_lists_all_four() {
        assert_eq!(supported_protocols().len(), 4);
    }
}
