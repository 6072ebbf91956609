//! Shared Modbus logic: address classification, contiguous-address
//! batching, and byte-order-aware multi-word value codec. Used by both
//! [`super::modbus_tcp`] and [`super::modbus_rtu`] so the two transports
//! stay behaviorally identical apart from how they open a connection.

use crate::errors::EngineError;
use crate::model::{DataPoint, DataType, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterType {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

fn parse_register_type(s: &str) -> Option<RegisterType> {
    match s {
        "coil" => Some(RegisterType::Coil),
        "discrete_input" => Some(RegisterType::DiscreteInput),
        "input_register" => Some(RegisterType::InputRegister),
        "holding_register" => Some(RegisterType::HoldingRegister),
        _ => None,
    }
}

/// Word order for multi-register values, read from a point's
/// `properties.byte_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "big_endian" => Some(ByteOrder::BigEndian),
            "little_endian" => Some(ByteOrder::LittleEndian),
            _ => None,
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::BigEndian
    }
}

/// Classify a point's register type and its raw (already 0-based, not
/// 40001-offset) register address, function-code selection per
/// `protocol_params["register_type"]` rather than the legacy Modicon
/// address-range heuristic.
pub fn classify_address(point: &DataPoint) -> Result<(RegisterType, u16), EngineError> {
    let addr = point
        .address
        .ok_or_else(|| EngineError::InvalidAddress(format!("point {} has no address", point.id)))?;
    let register_type = point
        .protocol_param_str("register_type")
        .and_then(parse_register_type)
        .ok_or_else(|| {
            EngineError::configuration(
                "register_type",
                format!("point {} is missing a valid protocol_params.register_type", point.id),
            )
        })?;
    let offset = u16::try_from(addr).map_err(|_| EngineError::InvalidAddress(format!("address {addr} does not fit in a u16 register offset")))?;
    Ok((register_type, offset))
}

/// Map a Modbus exception code (received in an error PDU) to the engine's
/// error taxonomy.
pub fn exception_to_error(code: u8) -> EngineError {
    match code {
        0x01 => EngineError::ProtocolError("illegal function".into()),
        0x02 => EngineError::InvalidAddress("illegal data address".into()),
        0x03 => EngineError::InvalidParameter("illegal data value".into()),
        0x04 => EngineError::DeviceError("slave device failure".into()),
        0x06 => EngineError::DeviceBusy("slave device busy".into()),
        other => EngineError::ProtocolError(format!("modbus exception 0x{other:02x}")),
    }
}

/// One contiguous run of registers/coils to fetch in a single PDU, together
/// with the points it satisfies.
#[derive(Debug, Clone)]
pub struct RegisterGroup {
    pub register_type: RegisterType,
    pub start: u16,
    pub count: u16,
    pub members: Vec<GroupMember>,
}

#[derive(Debug, Clone)]
pub struct GroupMember {
    pub point_id: Uuid,
    pub offset_in_group: u16,
    pub data_type: DataType,
}

const MAX_GAP: u16 = 4;

/// Coalesce points into the fewest PDUs that respect each transport's
/// per-request register cap, bridging small gaps between addresses rather
/// than issuing one request per point (P1: batching property).
pub fn group_points(points: &[DataPoint], max_group_registers: u16) -> Result<Vec<RegisterGroup>, EngineError> {
    struct Classified<'a> {
        point: &'a DataPoint,
        register_type: RegisterType,
        start: u16,
        width: u16,
    }

    let mut classified = Vec::with_capacity(points.len());
    for point in points {
        let (register_type, start) = classify_address(point)?;
        let width = if matches!(register_type, RegisterType::Coil | RegisterType::DiscreteInput) {
            1
        } else {
            point.data_type.modbus_word_width()
        };
        classified.push(Classified {
            point,
            register_type,
            start,
            width,
        });
    }

    classified.sort_by_key(|c| (register_type_rank(c.register_type), c.start));

    let mut groups: Vec<RegisterGroup> = Vec::new();
    for c in classified {
        let fits_existing = groups.last_mut().filter(|g| {
            g.register_type == c.register_type
                && c.start >= g.start
                && (c.start - g.start).saturating_add(c.width) <= max_group_registers
                && c.start.saturating_sub(g.start + g.count) <= MAX_GAP
        });

        if let Some(group) = fits_existing {
            let offset = c.start - group.start;
            group.count = group.count.max(offset + c.width);
            group.members.push(GroupMember {
                point_id: c.point.id,
                offset_in_group: offset,
                data_type: c.point.data_type,
            });
        } else {
            groups.push(RegisterGroup {
                register_type: c.register_type,
                start: c.start,
                count: c.width,
                members: vec![GroupMember {
                    point_id: c.point.id,
                    offset_in_group: 0,
                    data_type: c.point.data_type,
                }],
            });
        }
    }

    Ok(groups)
}

fn register_type_rank(rt: RegisterType) -> u8 {
    match rt {
        RegisterType::Coil => 0,
        RegisterType::DiscreteInput => 1,
        RegisterType::InputRegister => 2,
        RegisterType::HoldingRegister => 3,
    }
}

/// Decode a multi-word value out of a register slice. Word order follows
/// `byte_order`; byte order within each 16-bit word is whatever the
/// transport already returned as `u16`.
pub fn decode_registers(words: &[u16], data_type: DataType, byte_order: ByteOrder) -> Result<Value, EngineError> {
    let need = data_type.modbus_word_width() as usize;
    if words.len() < need {
        return Err(EngineError::DataCorruption(format!(
            "expected {need} registers, got {}",
            words.len()
        )));
    }
    let ordered: Vec<u16> = match byte_order {
        ByteOrder::BigEndian => words[..need].to_vec(),
        ByteOrder::LittleEndian => words[..need].iter().rev().copied().collect(),
    };
    let words = &ordered[..];
    Ok(match data_type {
        DataType::Bool => Value::Bool(words[0] != 0),
        DataType::Int8 => Value::Int8(words[0] as i8),
        DataType::UInt8 => Value::UInt8(words[0] as u8),
        DataType::Int16 => Value::Int16(words[0] as i16),
        DataType::UInt16 => Value::UInt16(words[0]),
        DataType::Int32 => Value::Int32(combine_u32(words[0], words[1]) as i32),
        DataType::UInt32 => Value::UInt32(combine_u32(words[0], words[1])),
        DataType::Float32 => Value::Float32(f32::from_bits(combine_u32(words[0], words[1]))),
        DataType::Int64 => Value::Int64(combine_u64(words) as i64),
        DataType::UInt64 => Value::UInt64(combine_u64(words)),
        DataType::Float64 => Value::Float64(f64::from_bits(combine_u64(words))),
        DataType::String | DataType::Bytes => {
            return Err(EngineError::DataTypeMismatch {
                expected: "numeric".into(),
                actual: format!("{data_type:?}"),
            })
        }
    })
}

fn combine_u32(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

fn combine_u64(words: &[u16]) -> u64 {
    ((words[0] as u64) << 48) | ((words[1] as u64) << 32) | ((words[2] as u64) << 16) | words[3] as u64
}

/// Encode a value to be written back as 16-bit register words, word order
/// following `byte_order`.
pub fn encode_registers(value: &Value, data_type: DataType, byte_order: ByteOrder) -> Result<Vec<u16>, EngineError> {
    let raw = value.as_f64().ok_or_else(|| EngineError::DataTypeMismatch {
        expected: "numeric".into(),
        actual: format!("{:?}", value.data_type()),
    })?;
    let words = match data_type {
        DataType::Bool => vec![if raw != 0.0 { 1 } else { 0 }],
        DataType::Int8 | DataType::UInt8 | DataType::Int16 | DataType::UInt16 => vec![raw as u16],
        DataType::Int32 | DataType::UInt32 | DataType::Float32 => {
            let bits = match data_type {
                DataType::Float32 => (raw as f32).to_bits(),
                _ => raw as i32 as u32,
            };
            vec![(bits >> 16) as u16, bits as u16]
        }
        DataType::Int64 | DataType::UInt64 | DataType::Float64 => {
            let bits = match data_type {
                DataType::Float64 => raw.to_bits(),
                _ => raw as i64 as u64,
            };
            vec![
                (bits >> 48) as u16,
                (bits >> 32) as u16,
                (bits >> 16) as u16,
                bits as u16,
            ]
        }
        DataType::String | DataType::Bytes => {
            return Err(EngineError::DataTypeMismatch {
                expected: "numeric".into(),
                actual: format!("{data_type:?}"),
            })
        }
    };
    Ok(match byte_order {
        ByteOrder::BigEndian => words,
        ByteOrder::LittleEndian => words.into_iter().rev().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn point(addr: u32, register_type: &str, data_type: DataType) -> DataPoint {
        let mut protocol_params = HashMap::new();
        protocol_params.insert("register_type".to_string(), serde_json::json!(register_type));
        DataPoint {
            id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            name: "p".into(),
            address: Some(addr),
            address_string: None,
            data_type,
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
    fn classifies_each_register_type_from_protocol_params() {
        assert_eq!(classify_address(&point(0, "coil", DataType::Bool)).unwrap().0, RegisterType::Coil);
        assert_eq!(classify_address(&point(0, "discrete_input", DataType::Bool)).unwrap().0, RegisterType::DiscreteInput);
        assert_eq!(classify_address(&point(0, "input_register", DataType::UInt16)).unwrap().0, RegisterType::InputRegister);
        assert_eq!(classify_address(&point(0, "holding_register", DataType::UInt16)).unwrap().0, RegisterType::HoldingRegister);
    }

    #[test]
    fn classify_address_rejects_missing_register_type() {
        let mut p = point(0, "holding_register", DataType::UInt16);
        p.protocol_params.clear();
        assert!(classify_address(&p).is_err());
    }

    #[test]
    fn classify_address_uses_raw_address_not_40001_offset() {
        let (_, offset) = classify_address(&point(0, "holding_register", DataType::UInt16)).unwrap();
        assert_eq!(offset, 0);
    }

    #[test]
    fn batches_contiguous_holding_registers_into_one_group() {
        let points = vec![
            point(0, "holding_register", DataType::UInt16),
            point(1, "holding_register", DataType::UInt16),
            point(2, "holding_register", DataType::UInt16),
        ];
        let groups = group_points(&points, 125).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 3);
        assert_eq!(groups[0].members.len(), 3);
    }

    #[test]
    fn bridges_small_gaps_but_splits_large_ones() {
        let points = vec![
            point(0, "holding_register", DataType::UInt16),
            point(2, "holding_register", DataType::UInt16),
            point(99, "holding_register", DataType::UInt16),
        ];
        let groups = group_points(&points, 125).unwrap();
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn separates_register_types_into_distinct_groups() {
        let points = vec![point(0, "coil", DataType::Bool), point(0, "holding_register", DataType::UInt16)];
        let groups = group_points(&points, 125).unwrap();
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn group_points_honors_max_group_registers_cap() {
        let points = vec![
            point(0, "holding_register", DataType::UInt16),
            point(10, "holding_register", DataType::UInt16),
        ];
        let groups = group_points(&points, 5).unwrap();
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn float32_round_trips_through_two_registers_big_endian() {
        let encoded = encode_registers(&Value::Float32(12.5), DataType::Float32, ByteOrder::BigEndian).unwrap();
        assert_eq!(encoded.len(), 2);
        let decoded = decode_registers(&encoded, DataType::Float32, ByteOrder::BigEndian).unwrap();
        assert_eq!(decoded, Value::Float32(12.5));
    }

    #[test]
    fn float32_round_trips_through_two_registers_little_endian() {
        let encoded = encode_registers(&Value::Float32(12.5), DataType::Float32, ByteOrder::LittleEndian).unwrap();
        assert_eq!(encoded.len(), 2);
        let decoded = decode_registers(&encoded, DataType::Float32, ByteOrder::LittleEndian).unwrap();
        assert_eq!(decoded, Value::Float32(12.5));
    }

    #[test]
    fn big_and_little_endian_word_order_differ_for_the_same_value() {
        let big = encode_registers(&Value::UInt32(0x0001_0002), DataType::UInt32, ByteOrder::BigEndian).unwrap();
        let little = encode_registers(&Value::UInt32(0x0001_0002), DataType::UInt32, ByteOrder::LittleEndian).unwrap();
        assert_eq!(big, vec![little[1], little[0]]);
    }

    #[test]
    fn decode_rejects_short_register_slice() {
        let err = decode_registers(&[0], DataType::Float32, ByteOrder::BigEndian).unwrap_err();
        assert!(matches!(err, EngineError::DataCorruption(_)));
    }
}
