//! BACnet/IP driver.
//!
//! No mature async BACnet crate exists in the dependency stack this project
//! draws from, so the BVLL/NPDU/APDU framing is implemented directly over a
//! UDP socket, the same way this codebase's other low-level adapters
//! (Modbus RTU's serial framing) hand-roll their wire format rather than
//! lean on a half-finished crate.
//!
//! Only unconfirmed, unsegmented requests are implemented: Who-Is/I-Am for
//! discovery and ReadProperty/WriteProperty for the present-value of an
//! object. This covers polling; COV subscriptions are left unimplemented
//! (see `subscribe_cov`).

use super::{DriverStatistics, DriverStatus, ProtocolDriver, RawReading};
use crate::errors::EngineError;
use crate::model::{DataPoint, DataType, DriverConfig, ProtocolTag, Value};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{info, warn};

const BVLC_TYPE_BIP: u8 = 0x81;
const BVLC_ORIGINAL_UNICAST_NPDU: u8 = 0x0a;
const BVLC_ORIGINAL_BROADCAST_NPDU: u8 = 0x0b;

const PDU_TYPE_CONFIRMED_REQUEST: u8 = 0x00;
const PDU_TYPE_UNCONFIRMED_REQUEST: u8 = 0x01;
const PDU_TYPE_COMPLEX_ACK: u8 = 0x03;
const PDU_TYPE_ERROR: u8 = 0x05;
const PDU_TYPE_REJECT: u8 = 0x06;
const PDU_TYPE_ABORT: u8 = 0x07;

const SERVICE_READ_PROPERTY: u8 = 0x0c;
const SERVICE_WRITE_PROPERTY: u8 = 0x0f;
const SERVICE_WHO_IS: u8 = 0x08;
const SERVICE_I_AM: u8 = 0x00;

const PROPERTY_PRESENT_VALUE: u32 = 85;

/// Smallest big-endian encoding of `value` that still round-trips, per the
/// BACnet tagged-unsigned-integer encoding rules (no leading zero octets).
fn minimal_be_bytes(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(3);
    bytes[first_nonzero..].to_vec()
}

/// Context-tagged unsigned integer, application tag class 1.
fn encode_context_unsigned(tag_number: u8, value: u32) -> Vec<u8> {
    let payload = minimal_be_bytes(value);
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push((tag_number << 4) | 0x08 | (payload.len() as u8));
    out.extend_from_slice(&payload);
    out
}

/// Who-Is-Request APDU, optionally bounded to a device instance range. An
/// unbounded Who-Is (`low`/`high` both `None`) asks every device on the
/// network to reply; this driver always supplies both bounds so it only
/// hears back from the one device it's configured against.
fn build_who_is(low: Option<u32>, high: Option<u32>) -> Vec<u8> {
    let mut apdu = vec![(PDU_TYPE_UNCONFIRMED_REQUEST << 4), SERVICE_WHO_IS];
    if let (Some(low), Some(high)) = (low, high) {
        apdu.extend_from_slice(&encode_context_unsigned(0, low));
        apdu.extend_from_slice(&encode_context_unsigned(1, high));
    }
    apdu
}

/// Extracts the device instance out of an I-Am-Request APDU's object
/// identifier parameter (the first application-tagged value).
fn parse_i_am(apdu: &[u8]) -> Result<u32, EngineError> {
    if apdu.len() < 2 || (apdu[0] >> 4) != PDU_TYPE_UNCONFIRMED_REQUEST || apdu[1] != SERVICE_I_AM {
        return Err(EngineError::ProtocolError("not an i-am apdu".into()));
    }
    if apdu.len() < 7 {
        return Err(EngineError::DataCorruption("i-am apdu too short".into()));
    }
    // apdu[2] is the object-identifier application tag (0xc4); the next 4
    // octets are the encoded object type (bits 31-22) + instance (bits 21-0).
    let encoded = u32::from_be_bytes([apdu[3], apdu[4], apdu[5], apdu[6]]);
    Ok(encoded & 0x3F_FFFF)
}

/// BACnet object type + instance, e.g. analog-input 3.
#[derive(Debug, Clone, Copy)]
pub struct ObjectId {
    pub object_type: u16,
    pub instance: u32,
}

impl ObjectId {
    /// Parse "AI:3" / "analog-input:3" style strings, falling back to the
    /// raw encoded object identifier if the string is a bare integer.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let (type_part, instance_part) = s
            .split_once(':')
            .ok_or_else(|| EngineError::InvalidAddress(format!("expected TYPE:INSTANCE, got '{s}'")))?;
        let object_type = match type_part.to_uppercase().as_str() {
            "AI" | "ANALOG-INPUT" => 0,
            "AO" | "ANALOG-OUTPUT" => 1,
            "AV" | "ANALOG-VALUE" => 2,
            "BI" | "BINARY-INPUT" => 3,
            "BO" | "BINARY-OUTPUT" => 4,
            "BV" | "BINARY-VALUE" => 5,
            "MSI" | "MULTI-STATE-INPUT" => 13,
            "MSO" | "MULTI-STATE-OUTPUT" => 14,
            "MSV" | "MULTI-STATE-VALUE" => 19,
            other => other
                .parse::<u16>()
                .map_err(|_| EngineError::InvalidAddress(format!("unknown bacnet object type '{other}'")))?,
        };
        let instance = instance_part
            .parse::<u32>()
            .map_err(|_| EngineError::InvalidAddress(format!("invalid bacnet instance '{instance_part}'")))?;
        Ok(ObjectId { object_type, instance })
    }

    fn encode(&self) -> u32 {
        ((self.object_type as u32) << 22) | (self.instance & 0x3F_FFFF)
    }
}

fn build_confirmed_read_property(invoke_id: u8, object: ObjectId) -> Vec<u8> {
    let mut apdu = Vec::with_capacity(16);
    apdu.push((PDU_TYPE_CONFIRMED_REQUEST << 4) | 0x04);
    apdu.push(0x05);
    apdu.push(invoke_id);
    apdu.push(SERVICE_READ_PROPERTY);

    apdu.push(0x0c);
    apdu.extend_from_slice(&object.encode().to_be_bytes());

    apdu.push(0x19);
    apdu.push(PROPERTY_PRESENT_VALUE as u8);

    apdu
}

fn wrap_npdu_bvlc(apdu: &[u8], broadcast: bool) -> Vec<u8> {
    let npdu = [0x01u8, 0x04];
    let mut bvlc = vec![BVLC_TYPE_BIP, if broadcast { BVLC_ORIGINAL_BROADCAST_NPDU } else { BVLC_ORIGINAL_UNICAST_NPDU }];
    let total_len = (4 + npdu.len() + apdu.len()) as u16;
    bvlc.extend_from_slice(&total_len.to_be_bytes());
    bvlc.extend_from_slice(&npdu);
    bvlc.extend_from_slice(apdu);
    bvlc
}

/// Pull the present-value tag out of a ReadProperty ComplexACK APDU.
fn parse_read_property_ack(apdu: &[u8], data_type: DataType) -> Result<Value, EngineError> {
    if apdu.len() < 4 {
        return Err(EngineError::DataCorruption("bacnet apdu too short".into()));
    }
    let pdu_type = apdu[0] >> 4;
    match pdu_type {
        t if t == PDU_TYPE_COMPLEX_ACK => {}
        t if t == PDU_TYPE_ERROR => return Err(EngineError::DeviceError("bacnet error response".into())),
        t if t == PDU_TYPE_REJECT => return Err(EngineError::ProtocolError("bacnet reject response".into())),
        t if t == PDU_TYPE_ABORT => return Err(EngineError::ProtocolError("bacnet abort response".into())),
        other => return Err(EngineError::ProtocolError(format!("unexpected bacnet pdu type {other}"))),
    }

    let mut i = 3;
    while i < apdu.len() {
        let tag = apdu[i];
        if tag & 0x07 == 0x06 && (tag >> 4) == 0x03 {
            i += 1;
            break;
        }
        i += 1;
    }
    if i >= apdu.len() {
        return Err(EngineError::DataCorruption("present-value tag not found".into()));
    }

    let tag_byte = apdu[i];
    let tag_number = tag_byte >> 4;
    let len = (tag_byte & 0x07) as usize;
    let payload = apdu.get(i + 1..i + 1 + len).ok_or_else(|| EngineError::DataCorruption("truncated bacnet value".into()))?;

    match tag_number {
        4 => {
            let bits: [u8; 4] = payload.try_into().map_err(|_| EngineError::DataCorruption("bad real tag length".into()))?;
            Ok(Value::from_f64(data_type, f32::from_be_bytes(bits) as f64))
        }
        1 => Ok(Value::Bool(payload.first().copied().unwrap_or(0) != 0)),
        2 => {
            let mut n: i64 = 0;
            for b in payload {
                n = (n << 8) | *b as i64;
            }
            Ok(Value::from_f64(data_type, n as f64))
        }
        _ => Err(EngineError::DataTypeMismatch {
            expected: "real/bool/unsigned".into(),
            actual: format!("bacnet tag {tag_number}"),
        }),
    }
}

pub struct BacnetDriver {
    config: DriverConfig,
    socket: Option<UdpSocket>,
    remote: Option<SocketAddr>,
    device_instance_low: u32,
    device_instance_high: u32,
    invoke_id: u8,
    status: DriverStatus,
    last_error: Option<String>,
    stats: Arc<DriverStatistics>,
}

impl BacnetDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            socket: None,
            remote: None,
            device_instance_low: 0,
            device_instance_high: 0,
            invoke_id: 0,
            status: DriverStatus::Disconnected,
            last_error: None,
            stats: DriverStatistics::new(),
        }
    }

    fn next_invoke_id(&mut self) -> u8 {
        self.invoke_id = self.invoke_id.wrapping_add(1);
        self.invoke_id
    }

    async fn request_reply(&mut self, apdu: &[u8]) -> Result<Vec<u8>, EngineError> {
        let remote = self.remote.ok_or(EngineError::ConnectionLost("not connected".into()))?;
        let socket = self.socket.as_ref().ok_or(EngineError::ConnectionLost("not connected".into()))?;
        let frame = wrap_npdu_bvlc(apdu, false);

        socket
            .send_to(&frame, remote)
            .await
            .map_err(|e| EngineError::ConnectionLost(format!("bacnet send failed: {e}")))?;

        let mut buf = [0u8; 1500];
        let timeout_ms = self.config.timeout_ms.max(1000);
        let (n, _from) = timeout(Duration::from_millis(timeout_ms), socket.recv_from(&mut buf))
            .await
            .map_err(|_| EngineError::ConnectionTimeout(timeout_ms))?
            .map_err(|e| EngineError::ConnectionLost(format!("bacnet recv failed: {e}")))?;

        if n < 4 || buf[0] != BVLC_TYPE_BIP {
            return Err(EngineError::DataCorruption("malformed bvlc frame".into()));
        }
        // Skip BVLC(4) + NPDU(2, no options in this driver's requests).
        Ok(buf[6..n].to_vec())
    }
}

#[async_trait]
impl ProtocolDriver for BacnetDriver {
    async fn initialize(&mut self) -> Result<(), EngineError> {
        self.config
            .endpoint
            .parse::<SocketAddr>()
            .map_err(|e| EngineError::configuration("endpoint", format!("invalid bacnet/ip address: {e}")))?;
        self.device_instance_low = self
            .config
            .property_u64("device_instance_low")
            .ok_or_else(|| EngineError::configuration("device_instance_low", "required for bacnet/ip discovery"))?
            as u32;
        self.device_instance_high = self
            .config
            .property_u64("device_instance_high")
            .ok_or_else(|| EngineError::configuration("device_instance_high", "required for bacnet/ip discovery"))?
            as u32;
        Ok(())
    }

    /// Broadcasts a bounded Who-Is and waits for the matching device's I-Am,
    /// binding `self.remote` to wherever that reply actually came from
    /// rather than trusting `config.endpoint` to be reachable directly
    /// (the device may answer from a different port, or via a BBMD).
    async fn connect(&mut self, _points: &[DataPoint]) -> Result<(), EngineError> {
        self.status = DriverStatus::Connecting;

        let broadcast_addr = self
            .config
            .endpoint
            .parse::<SocketAddr>()
            .map_err(|e| EngineError::configuration("endpoint", format!("invalid bacnet/ip address: {e}")))?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| EngineError::ConnectionFailed(format!("bacnet udp bind failed: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| EngineError::ConnectionFailed(format!("bacnet socket broadcast setup failed: {e}")))?;

        let who_is = build_who_is(Some(self.device_instance_low), Some(self.device_instance_high));
        let frame = wrap_npdu_bvlc(&who_is, true);
        socket
            .send_to(&frame, broadcast_addr)
            .await
            .map_err(|e| EngineError::ConnectionFailed(format!("bacnet who-is send failed: {e}")))?;
        info!(%broadcast_addr, low = self.device_instance_low, high = self.device_instance_high, "sent bacnet who-is");

        let mut buf = [0u8; 1500];
        let deadline = Duration::from_secs(5);
        let found = timeout(deadline, async {
            loop {
                let (n, from) = socket
                    .recv_from(&mut buf)
                    .await
                    .map_err(|e| EngineError::ConnectionFailed(format!("bacnet recv failed: {e}")))?;
                if n < 6 || buf[0] != BVLC_TYPE_BIP {
                    continue;
                }
                let apdu = &buf[6..n];
                match parse_i_am(apdu) {
                    Ok(instance) if instance >= self.device_instance_low && instance <= self.device_instance_high => {
                        return Ok::<SocketAddr, EngineError>(from);
                    }
                    _ => continue,
                }
            }
        })
        .await
        .map_err(|_| EngineError::ConnectionTimeout(deadline.as_millis() as u64))??;

        info!(remote = %found, "bacnet/ip device discovered via who-is/i-am");
        self.socket = Some(socket);
        self.remote = Some(found);
        self.status = DriverStatus::Connected;
        self.last_error = None;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        self.socket = None;
        self.remote = None;
        self.status = DriverStatus::Disconnected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(self.status, DriverStatus::Connected)
    }

    async fn read_values(&mut self, points: &[DataPoint]) -> Result<Vec<RawReading>, EngineError> {
        let mut out = Vec::with_capacity(points.len());
        for point in points {
            let addr_str = match &point.address_string {
                Some(s) => s,
                None => {
                    out.push(RawReading {
                        point_id: point.id,
                        value: None,
                        error: Some(EngineError::InvalidAddress(format!("point {} has no bacnet object id", point.id))),
                    });
                    continue;
                }
            };

            let object = match ObjectId::parse(addr_str) {
                Ok(o) => o,
                Err(e) => {
                    self.stats.record_read(false);
                    out.push(RawReading { point_id: point.id, value: None, error: Some(e) });
                    continue;
                }
            };

            let invoke_id = self.next_invoke_id();
            let apdu = build_confirmed_read_property(invoke_id, object);

            match self.request_reply(&apdu).await {
                Ok(reply) => match parse_read_property_ack(&reply, point.data_type) {
                    Ok(value) => {
                        self.stats.record_read(true);
                        out.push(RawReading { point_id: point.id, value: Some(value), error: None });
                    }
                    Err(e) => {
                        self.stats.record_read(false);
                        out.push(RawReading { point_id: point.id, value: None, error: Some(e) });
                    }
                },
                Err(e) => {
                    warn!(point = %point.id, error = %e, "bacnet read failed");
                    self.stats.record_read(false);
                    let is_conn_err = e.code().is_connection_class();
                    out.push(RawReading { point_id: point.id, value: None, error: Some(e) });
                    if is_conn_err {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn write_value(&mut self, point: &DataPoint, value: Value) -> Result<(), EngineError> {
        let addr_str = point
            .address_string
            .as_ref()
            .ok_or_else(|| EngineError::InvalidAddress(format!("point {} has no bacnet object id", point.id)))?;
        let object = ObjectId::parse(addr_str)?;
        let raw = value.as_f64().ok_or_else(|| EngineError::DataTypeMismatch {
            expected: "numeric".into(),
            actual: format!("{:?}", value.data_type()),
        })?;

        let invoke_id = self.next_invoke_id();
        let mut apdu = Vec::with_capacity(20);
        apdu.push((PDU_TYPE_CONFIRMED_REQUEST << 4) | 0x04);
        apdu.push(0x05);
        apdu.push(invoke_id);
        apdu.push(SERVICE_WRITE_PROPERTY);
        apdu.push(0x0c);
        apdu.extend_from_slice(&object.encode().to_be_bytes());
        apdu.push(0x19);
        apdu.push(PROPERTY_PRESENT_VALUE as u8);
        apdu.push(0x3e);
        apdu.push(0x44);
        apdu.extend_from_slice(&(raw as f32).to_be_bytes());
        apdu.push(0x3f);

        match self.request_reply(&apdu).await {
            Ok(reply) => {
                if reply.first().map(|b| b >> 4) == Some(PDU_TYPE_COMPLEX_ACK) || reply.first().map(|b| b >> 4) == Some(0x01) {
                    self.stats.record_write(true);
                    Ok(())
                } else {
                    self.stats.record_write(false);
                    Err(EngineError::DeviceError("bacnet write rejected".into()))
                }
            }
            Err(e) => {
                self.stats.record_write(false);
                Err(e)
            }
        }
    }

    fn protocol_type(&self) -> ProtocolTag {
        ProtocolTag::BacnetIp
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
    fn parses_named_and_numeric_object_types() {
        let o = ObjectId::parse("AI:3").unwrap();
        assert_eq!(o.object_type, 0);
        assert_eq!(o.instance, 3);

        let o2 = ObjectId::parse("2:100").unwrap();
        assert_eq!(o2.object_type, 2);
        assert_eq!(o2.instance, 100);
    }

    #[test]
    fn rejects_malformed_object_id() {
        assert!(ObjectId::parse("not-valid").is_err());
        assert!(ObjectId::parse("AI:notanumber").is_err());
    }

    #[test]
    fn encode_packs_type_and_instance() {
        let o = ObjectId { object_type: 0, instance: 3 };
        assert_eq!(o.encode(), 3);
        let o2 = ObjectId { object_type: 1, instance: 0 };
        assert_eq!(o2.encode(), 1 << 22);
    }

    #[test]
    fn builds_a_well_formed_confirmed_request_header() {
        let apdu = build_confirmed_read_property(7, ObjectId { object_type: 0, instance: 1 });
        assert_eq!(apdu[0] >> 4, PDU_TYPE_CONFIRMED_REQUEST);
        assert_eq!(apdu[2], 7);
        assert_eq!(apdu[3], SERVICE_READ_PROPERTY);
    }

    #[test]
    fn parse_ack_extracts_real_present_value() {
        let mut apdu = vec![(PDU_TYPE_COMPLEX_ACK << 4) | 0x00, 0x05, 0x07, SERVICE_READ_PROPERTY];
        apdu.push(0x3e);
        apdu.push(0x44);
        apdu.extend_from_slice(&21.5f32.to_be_bytes());
        apdu.push(0x3f);
        let v = parse_read_property_ack(&apdu, DataType::Float32).unwrap();
        match v {
            Value::Float32(f) => assert!((f - 21.5).abs() < 0.001),
            _ => panic!("expected float32"),
        }
    }

    #[test]
    fn parse_ack_surfaces_error_pdu() {
        let apdu = vec![(PDU_TYPE_ERROR << 4), 0x05, 0x07, 0x00];
        let err = parse_read_property_ack(&apdu, DataType::Float32).unwrap_err();
        assert!(matches!(err, EngineError::DeviceError(_)));
    }

    #[test]
    fn who_is_encodes_device_instance_range() {
        let apdu = build_who_is(Some(260001), Some(260001));
        assert_eq!(apdu[0] >> 4, PDU_TYPE_UNCONFIRMED_REQUEST);
        assert_eq!(apdu[1], SERVICE_WHO_IS);
        // Context tag 0 (low limit) immediately follows the service choice.
        assert_eq!(apdu[2] >> 4, 0);
        assert_eq!(minimal_be_bytes(260001), vec![0x03, 0xf7, 0xa1]);
    }

    #[test]
    fn who_is_unbounded_when_no_range_given() {
        let apdu = build_who_is(None, None);
        assert_eq!(apdu, vec![(PDU_TYPE_UNCONFIRMED_REQUEST << 4), SERVICE_WHO_IS]);
    }

    #[test]
    fn parse_i_am_extracts_device_instance() {
        let object_id: u32 = 260001; // object type 0 (device), instance 260001
        let mut apdu = vec![(PDU_TYPE_UNCONFIRMED_REQUEST << 4), SERVICE_I_AM, 0xc4];
        apdu.extend_from_slice(&object_id.to_be_bytes());
        apdu.extend_from_slice(&[0x22, 0x04, 0x00]); // max-apdu-length, segmentation, vendor-id (don't matter here)
        let instance = parse_i_am(&apdu).unwrap();
        assert_eq!(instance, 260001);
    }

    #[test]
    fn parse_i_am_rejects_other_services() {
        let apdu = vec![(PDU_TYPE_UNCONFIRMED_REQUEST << 4), SERVICE_WHO_IS];
        assert!(parse_i_am(&apdu).is_err());
    }
}
