//! Protocol packets and the message envelope.
//!
//! Every packet carries a `version` field; decoding looks fields up by name
//! so packets from newer peers decode their known fields and ignore the
//! rest.

use crate::error::{CodecError, CodecResult};
use crate::item::DataItem;
use crate::range::WaterMark;
use crate::wire::{from_bytes, int, to_bytes, uint, MapReader};
use ciborium::value::Value;

/// Lowest protocol version this implementation speaks.
pub const PROTOCOL_VERSION_BASE: u32 = 1;
/// First protocol version with a sliding send window larger than one.
pub const PROTOCOL_VERSION_WINDOWED: u32 = 2;
/// Version stamped on outgoing packets.
pub const PROTOCOL_VERSION_CURRENT: u32 = 2;

/// `send_code` marking the final packet of a session.
pub const SEND_FINISHED: i32 = 0xff;

/// Result code carried in ack packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvCode {
    /// Batch applied, watermark acked.
    Ok,
    /// Sender's watermark does not match what the receiver has; the ack
    /// carries the expected mark.
    WaterMarkInvalid,
    /// Storage is locked; sender may retry after backoff.
    Busy,
    /// Packet malformed or time range out of bounds.
    InvalidArgs,
    /// Receiver's table shape diverged from the sender's fingerprint.
    SchemaChanged,
    /// Receiver has no schema for this query.
    SchemaNotFound,
    /// First-ever sync with this peer; ability handshake required.
    NotFound,
    /// Peer security label incompatible; permanent reject for this pairing.
    SecurityCheckFailed,
    /// Requested operation outside the peer's capabilities.
    NotSupport,
    /// Request exceeds the receiver's limits.
    OverMaxLimits,
}

impl RecvCode {
    /// Converts to the wire code.
    pub fn to_code(self) -> i32 {
        match self {
            RecvCode::Ok => 0,
            RecvCode::Busy => -1,
            RecvCode::InvalidArgs => -2,
            RecvCode::SchemaChanged => -3,
            RecvCode::SchemaNotFound => -4,
            RecvCode::NotFound => -5,
            RecvCode::SecurityCheckFailed => -6,
            RecvCode::NotSupport => -7,
            RecvCode::OverMaxLimits => -8,
            RecvCode::WaterMarkInvalid => -9,
        }
    }

    /// Converts from the wire code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RecvCode::Ok),
            -1 => Some(RecvCode::Busy),
            -2 => Some(RecvCode::InvalidArgs),
            -3 => Some(RecvCode::SchemaChanged),
            -4 => Some(RecvCode::SchemaNotFound),
            -5 => Some(RecvCode::NotFound),
            -6 => Some(RecvCode::SecurityCheckFailed),
            -7 => Some(RecvCode::NotSupport),
            -8 => Some(RecvCode::OverMaxLimits),
            -9 => Some(RecvCode::WaterMarkInvalid),
            _ => None,
        }
    }
}

/// Sync mode requested for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Send local changes to the peer.
    Push,
    /// Ask the peer to send its changes.
    Pull,
    /// Both directions in one session.
    PushPull,
}

impl SyncMode {
    /// Converts to the wire code.
    pub fn to_code(self) -> u8 {
        match self {
            SyncMode::Push => 1,
            SyncMode::Pull => 2,
            SyncMode::PushPull => 3,
        }
    }

    /// Converts from the wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SyncMode::Push),
            2 => Some(SyncMode::Pull),
            3 => Some(SyncMode::PushPull),
            _ => None,
        }
    }
}

/// Remote subscription control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCmd {
    /// Subscribe the peer to a query.
    Subscribe,
    /// Remove an existing subscription.
    Unsubscribe,
}

impl ControlCmd {
    /// Converts to the wire code.
    pub fn to_code(self) -> u8 {
        match self {
            ControlCmd::Subscribe => 1,
            ControlCmd::Unsubscribe => 2,
        }
    }

    /// Converts from the wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ControlCmd::Subscribe),
            2 => Some(ControlCmd::Unsubscribe),
            _ => None,
        }
    }
}

/// A batch of changed rows plus the watermarks framing them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataRequestPacket {
    /// Protocol version of the sender.
    pub version: u32,
    /// Sync mode driving this packet.
    pub mode: u8,
    /// Changed rows in this batch, timestamp-ascending.
    pub data: Vec<DataItem>,
    /// Sender's live-row watermark at batch start.
    pub local_watermark: WaterMark,
    /// What the sender believes the receiver last sent it; used by the
    /// receiver to detect gaps.
    pub peer_watermark: WaterMark,
    /// Sender's delete-stream watermark at batch start.
    pub delete_watermark: WaterMark,
    /// End of the live-row range covered by this batch.
    pub end_watermark: WaterMark,
    /// End of the delete range covered by this batch.
    pub delete_end_watermark: WaterMark,
    /// Status of the sending side; [`SEND_FINISHED`] on the last packet.
    pub send_code: i32,
    /// Monotonically increasing id; a retransmission reuses the original.
    pub packet_id: u64,
    /// True when no further sequence follows in this session.
    pub is_last_sequence: bool,
    /// Query identity; empty for full sync.
    pub query_id: String,
    /// Sender's schema fingerprint for the receive-side strategy check.
    pub schema_fingerprint: Vec<u8>,
    /// Sender's security label for the receive-side permission check.
    pub security_label: i32,
}

impl DataRequestPacket {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Text("version".into()), uint(u64::from(self.version))),
            (Value::Text("mode".into()), uint(u64::from(self.mode))),
            (
                Value::Text("data".into()),
                Value::Array(self.data.iter().map(DataItem::to_value).collect()),
            ),
            (Value::Text("local_watermark".into()), uint(self.local_watermark)),
            (Value::Text("peer_watermark".into()), uint(self.peer_watermark)),
            (Value::Text("delete_watermark".into()), uint(self.delete_watermark)),
            (Value::Text("end_watermark".into()), uint(self.end_watermark)),
            (
                Value::Text("delete_end_watermark".into()),
                uint(self.delete_end_watermark),
            ),
            (Value::Text("send_code".into()), int(i64::from(self.send_code))),
            (Value::Text("packet_id".into()), uint(self.packet_id)),
            (
                Value::Text("is_last_sequence".into()),
                Value::Bool(self.is_last_sequence),
            ),
            (Value::Text("query_id".into()), Value::Text(self.query_id.clone())),
            (
                Value::Text("schema_fingerprint".into()),
                Value::Bytes(self.schema_fingerprint.clone()),
            ),
            (
                Value::Text("security_label".into()),
                int(i64::from(self.security_label)),
            ),
        ])
    }

    fn from_value(value: &Value) -> CodecResult<Self> {
        let map = MapReader::new(value)?;
        let data = map
            .array("data")
            .iter()
            .map(DataItem::from_value)
            .collect::<CodecResult<Vec<_>>>()?;
        Ok(Self {
            version: map.u64("version")? as u32,
            mode: map.u64_or("mode", 0) as u8,
            data,
            local_watermark: map.u64_or("local_watermark", 0),
            peer_watermark: map.u64_or("peer_watermark", 0),
            delete_watermark: map.u64_or("delete_watermark", 0),
            end_watermark: map.u64_or("end_watermark", 0),
            delete_end_watermark: map.u64_or("delete_end_watermark", 0),
            send_code: map.i64_or("send_code", 0) as i32,
            packet_id: map.u64_or("packet_id", 0),
            is_last_sequence: map.bool_or("is_last_sequence", false),
            query_id: map.text_or_default("query_id"),
            schema_fingerprint: map.bytes_or_default("schema_fingerprint"),
            security_label: map.i64_or("security_label", 0) as i32,
        })
    }
}

/// Acknowledgement of one data request packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataAckPacket {
    /// Protocol version of the sender.
    pub version: u32,
    /// Result code, see [`RecvCode`].
    pub recv_code: i32,
    /// Live-row watermark acknowledged (or the expected mark when
    /// `recv_code` is `WaterMarkInvalid`).
    pub watermark: WaterMark,
    /// Delete-stream watermark acknowledged.
    pub delete_watermark: WaterMark,
    /// Echo of the request's packet id; mismatches mean a stale ack.
    pub packet_id: u64,
}

impl DataAckPacket {
    /// Returns the decoded result code, if recognized.
    pub fn recv_code(&self) -> Option<RecvCode> {
        RecvCode::from_code(self.recv_code)
    }

    fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Text("version".into()), uint(u64::from(self.version))),
            (Value::Text("recv_code".into()), int(i64::from(self.recv_code))),
            (Value::Text("watermark".into()), uint(self.watermark)),
            (Value::Text("delete_watermark".into()), uint(self.delete_watermark)),
            (Value::Text("packet_id".into()), uint(self.packet_id)),
        ])
    }

    fn from_value(value: &Value) -> CodecResult<Self> {
        let map = MapReader::new(value)?;
        Ok(Self {
            version: map.u64("version")? as u32,
            recv_code: map.i64_or("recv_code", 0) as i32,
            watermark: map.u64_or("watermark", 0),
            delete_watermark: map.u64_or("delete_watermark", 0),
            packet_id: map.u64_or("packet_id", 0),
        })
    }
}

/// Capability handshake request exchanged before data sync.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AbilityRequest {
    /// Protocol version of the sender.
    pub version: u32,
    /// Software version of the sender's store.
    pub software_version: u32,
    /// Schema fingerprint of the sender's store.
    pub schema_fingerprint: Vec<u8>,
    /// Security label of the sender's store.
    pub security_label: i32,
}

impl AbilityRequest {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Text("version".into()), uint(u64::from(self.version))),
            (
                Value::Text("software_version".into()),
                uint(u64::from(self.software_version)),
            ),
            (
                Value::Text("schema_fingerprint".into()),
                Value::Bytes(self.schema_fingerprint.clone()),
            ),
            (
                Value::Text("security_label".into()),
                int(i64::from(self.security_label)),
            ),
        ])
    }

    fn from_value(value: &Value) -> CodecResult<Self> {
        let map = MapReader::new(value)?;
        Ok(Self {
            version: map.u64("version")? as u32,
            software_version: map.u64_or("software_version", 0) as u32,
            schema_fingerprint: map.bytes_or_default("schema_fingerprint"),
            security_label: map.i64_or("security_label", 0) as i32,
        })
    }
}

/// Capability handshake response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AbilityAck {
    /// Protocol version of the responder.
    pub version: u32,
    /// Software version of the responder's store.
    pub software_version: u32,
    /// Result code, see [`RecvCode`].
    pub ack_code: i32,
    /// Schema fingerprint of the responder's store.
    pub schema_fingerprint: Vec<u8>,
    /// Security label of the responder's store.
    pub security_label: i32,
}

impl AbilityAck {
    /// Returns the decoded result code, if recognized.
    pub fn ack_code(&self) -> Option<RecvCode> {
        RecvCode::from_code(self.ack_code)
    }

    fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Text("version".into()), uint(u64::from(self.version))),
            (
                Value::Text("software_version".into()),
                uint(u64::from(self.software_version)),
            ),
            (Value::Text("ack_code".into()), int(i64::from(self.ack_code))),
            (
                Value::Text("schema_fingerprint".into()),
                Value::Bytes(self.schema_fingerprint.clone()),
            ),
            (
                Value::Text("security_label".into()),
                int(i64::from(self.security_label)),
            ),
        ])
    }

    fn from_value(value: &Value) -> CodecResult<Self> {
        let map = MapReader::new(value)?;
        Ok(Self {
            version: map.u64("version")? as u32,
            software_version: map.u64_or("software_version", 0) as u32,
            ack_code: map.i64_or("ack_code", 0) as i32,
            schema_fingerprint: map.bytes_or_default("schema_fingerprint"),
            security_label: map.i64_or("security_label", 0) as i32,
        })
    }
}

/// Subscription control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequestPacket {
    /// Protocol version of the sender.
    pub version: u32,
    /// Subscribe or unsubscribe.
    pub cmd: ControlCmd,
    /// Query identity the command applies to.
    pub query_id: String,
    /// Monotonically increasing id, shared space with data packets.
    pub packet_id: u64,
}

impl ControlRequestPacket {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Text("version".into()), uint(u64::from(self.version))),
            (Value::Text("cmd".into()), uint(u64::from(self.cmd.to_code()))),
            (Value::Text("query_id".into()), Value::Text(self.query_id.clone())),
            (Value::Text("packet_id".into()), uint(self.packet_id)),
        ])
    }

    fn from_value(value: &Value) -> CodecResult<Self> {
        let map = MapReader::new(value)?;
        let cmd = ControlCmd::from_code(map.u64("cmd")? as u8)
            .ok_or_else(|| CodecError::invalid_structure("invalid control cmd"))?;
        Ok(Self {
            version: map.u64("version")? as u32,
            cmd,
            query_id: map.text_or_default("query_id"),
            packet_id: map.u64_or("packet_id", 0),
        })
    }
}

/// Acknowledgement of a control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlAckPacket {
    /// Protocol version of the sender.
    pub version: u32,
    /// Result code, see [`RecvCode`].
    pub recv_code: i32,
    /// Command being acknowledged.
    pub cmd: ControlCmd,
}

impl ControlAckPacket {
    /// Returns the decoded result code, if recognized.
    pub fn recv_code(&self) -> Option<RecvCode> {
        RecvCode::from_code(self.recv_code)
    }

    fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Text("version".into()), uint(u64::from(self.version))),
            (Value::Text("recv_code".into()), int(i64::from(self.recv_code))),
            (Value::Text("cmd".into()), uint(u64::from(self.cmd.to_code()))),
        ])
    }

    fn from_value(value: &Value) -> CodecResult<Self> {
        let map = MapReader::new(value)?;
        let cmd = ControlCmd::from_code(map.u64("cmd")? as u8)
            .ok_or_else(|| CodecError::invalid_structure("invalid control cmd"))?;
        Ok(Self {
            version: map.u64("version")? as u32,
            recv_code: map.i64_or("recv_code", 0) as i32,
            cmd,
        })
    }
}

/// Any packet the engine exchanges.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPacket {
    /// Data request with a batch of rows.
    DataRequest(DataRequestPacket),
    /// Data acknowledgement.
    DataAck(DataAckPacket),
    /// Ability handshake request.
    AbilityRequest(AbilityRequest),
    /// Ability handshake response.
    AbilityAck(AbilityAck),
    /// Subscription control request.
    ControlRequest(ControlRequestPacket),
    /// Subscription control acknowledgement.
    ControlAck(ControlAckPacket),
}

impl SyncPacket {
    /// Returns the packet type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncPacket::DataRequest(_) => 1,
            SyncPacket::DataAck(_) => 2,
            SyncPacket::AbilityRequest(_) => 3,
            SyncPacket::AbilityAck(_) => 4,
            SyncPacket::ControlRequest(_) => 5,
            SyncPacket::ControlAck(_) => 6,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            SyncPacket::DataRequest(p) => p.to_value(),
            SyncPacket::DataAck(p) => p.to_value(),
            SyncPacket::AbilityRequest(p) => p.to_value(),
            SyncPacket::AbilityAck(p) => p.to_value(),
            SyncPacket::ControlRequest(p) => p.to_value(),
            SyncPacket::ControlAck(p) => p.to_value(),
        }
    }

    fn from_value(type_code: u8, value: &Value) -> CodecResult<Self> {
        match type_code {
            1 => Ok(SyncPacket::DataRequest(DataRequestPacket::from_value(value)?)),
            2 => Ok(SyncPacket::DataAck(DataAckPacket::from_value(value)?)),
            3 => Ok(SyncPacket::AbilityRequest(AbilityRequest::from_value(value)?)),
            4 => Ok(SyncPacket::AbilityAck(AbilityAck::from_value(value)?)),
            5 => Ok(SyncPacket::ControlRequest(ControlRequestPacket::from_value(
                value,
            )?)),
            6 => Ok(SyncPacket::ControlAck(ControlAckPacket::from_value(value)?)),
            other => Err(CodecError::UnknownPacketType(other)),
        }
    }
}

/// Transport-level envelope around one packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Session the packet belongs to; changes on every new task.
    pub session_id: u32,
    /// Position within the session's sliding window.
    pub sequence_id: u32,
    /// The packet itself.
    pub packet: SyncPacket,
}

impl Message {
    /// Creates an envelope.
    pub fn new(session_id: u32, sequence_id: u32, packet: SyncPacket) -> Self {
        Self {
            session_id,
            sequence_id,
            packet,
        }
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let value = Value::Map(vec![
            (
                Value::Text("type".into()),
                uint(u64::from(self.packet.type_code())),
            ),
            (Value::Text("session_id".into()), uint(u64::from(self.session_id))),
            (Value::Text("sequence_id".into()), uint(u64::from(self.sequence_id))),
            (Value::Text("payload".into()), self.packet.to_value()),
        ]);
        to_bytes(&value)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let value = from_bytes(bytes)?;
        let map = MapReader::new(&value)?;
        let type_code = map.u64("type")? as u8;
        let payload = map
            .get("payload")
            .ok_or_else(|| CodecError::invalid_structure("missing payload"))?;
        Ok(Self {
            session_id: map.u64_or("session_id", 0) as u32,
            sequence_id: map.u64_or("sequence_id", 0) as u32,
            packet: SyncPacket::from_value(type_code, payload)?,
        })
    }
}
