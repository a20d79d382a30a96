//! RTMP message types and parsing
//!
//! RTMP messages are classified into:
//! - Protocol Control Messages (types 1-6): Chunk/flow control
//! - Command Messages (type 20): AMF0-encoded commands
//! - Data Messages (type 18): Metadata
//! - Audio/Video Messages (types 8, 9): Media data
//!
//! Reference: RTMP Specification Section 5.4

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{Amf0Decoder, Amf0Encoder, AmfValue};
use crate::error::{AmfError, ProtocolError, Result};
use crate::pool::Pool;
use crate::protocol::chunk::RtmpChunk;
use crate::protocol::constants::*;

/// Parsed RTMP message
#[derive(Debug, Clone, PartialEq)]
pub enum RtmpMessage {
    /// Set Chunk Size (type 1)
    SetChunkSize(u32),

    /// Abort Message (type 2)
    Abort { csid: u32 },

    /// Acknowledgement (type 3)
    Acknowledgement { sequence: u32 },

    /// User Control Message (type 4)
    UserControl(UserControlEvent),

    /// Window Acknowledgement Size (type 5)
    WindowAckSize(u32),

    /// Set Peer Bandwidth (type 6)
    SetPeerBandwidth { size: u32, limit_type: u8 },

    /// Audio tag (type 8)
    Audio { timestamp: u32, data: Bytes },

    /// Video tag (type 9)
    Video { timestamp: u32, data: Bytes },

    /// AMF0 Command (type 20)
    Command(Command),

    /// AMF0 Data message (type 18)
    Data(DataMessage),
}

/// User Control Event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16, data: Bytes },
}

/// RTMP command (connect, publish, play, etc.)
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Command name
    pub name: String,
    /// Transaction ID
    pub transaction_id: f64,
    /// Command object (often null)
    pub command_object: AmfValue,
    /// Additional arguments
    pub arguments: Vec<AmfValue>,
    /// Message stream ID (from chunk)
    pub stream_id: u32,
}

/// Data message (@setDataFrame, onMetaData, etc.)
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    /// Handler name (e.g., "@setDataFrame", "onMetaData")
    pub name: String,
    /// Data values
    pub values: Vec<AmfValue>,
    /// Message stream ID
    pub stream_id: u32,
}

impl RtmpMessage {
    /// Parse a message from a reassembled chunk
    ///
    /// Unknown message types (including AMF3 and aggregate messages) are
    /// rejected so the connection can tear down on a corrupt stream.
    pub fn from_chunk(chunk: &RtmpChunk) -> Result<Self> {
        let mut payload = chunk.payload.clone();

        match chunk.message_type {
            MSG_SET_CHUNK_SIZE => {
                let size = read_u32(&mut payload)? & 0x7FFFFFFF; // MSB is reserved
                Ok(RtmpMessage::SetChunkSize(size))
            }

            MSG_ABORT => Ok(RtmpMessage::Abort {
                csid: read_u32(&mut payload)?,
            }),

            MSG_ACKNOWLEDGEMENT => Ok(RtmpMessage::Acknowledgement {
                sequence: read_u32(&mut payload)?,
            }),

            MSG_USER_CONTROL => Self::parse_user_control(&mut payload),

            MSG_WINDOW_ACK_SIZE => Ok(RtmpMessage::WindowAckSize(read_u32(&mut payload)?)),

            MSG_SET_PEER_BANDWIDTH => {
                let size = read_u32(&mut payload)?;
                // Some servers omit the limit type
                let limit_type = if payload.has_remaining() {
                    payload.get_u8()
                } else {
                    BANDWIDTH_LIMIT_DYNAMIC
                };
                Ok(RtmpMessage::SetPeerBandwidth { size, limit_type })
            }

            MSG_AUDIO => Ok(RtmpMessage::Audio {
                timestamp: chunk.timestamp,
                data: payload,
            }),

            MSG_VIDEO => Ok(RtmpMessage::Video {
                timestamp: chunk.timestamp,
                data: payload,
            }),

            MSG_COMMAND_AMF0 => {
                let cmd = Self::parse_command(&mut payload, chunk.stream_id)?;
                Ok(RtmpMessage::Command(cmd))
            }

            MSG_DATA_AMF0 => {
                let data = Self::parse_data(&mut payload, chunk.stream_id)?;
                Ok(RtmpMessage::Data(data))
            }

            other => Err(ProtocolError::UnknownMessageType(other).into()),
        }
    }

    fn parse_user_control(payload: &mut Bytes) -> Result<Self> {
        if payload.len() < 6 {
            return Err(ProtocolError::InvalidChunkHeader.into());
        }

        let event_type = payload.get_u16();
        let event = match event_type {
            UC_STREAM_BEGIN => UserControlEvent::StreamBegin(payload.get_u32()),
            UC_STREAM_EOF => UserControlEvent::StreamEof(payload.get_u32()),
            UC_STREAM_DRY => UserControlEvent::StreamDry(payload.get_u32()),
            UC_SET_BUFFER_LENGTH => {
                let stream_id = payload.get_u32();
                let buffer_ms = read_u32(payload)?;
                UserControlEvent::SetBufferLength { stream_id, buffer_ms }
            }
            UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(payload.get_u32()),
            UC_PING_REQUEST => UserControlEvent::PingRequest(payload.get_u32()),
            UC_PING_RESPONSE => UserControlEvent::PingResponse(payload.get_u32()),
            _ => UserControlEvent::Unknown {
                event_type,
                data: payload.clone(),
            },
        };

        Ok(RtmpMessage::UserControl(event))
    }

    fn parse_command(payload: &mut Bytes, stream_id: u32) -> Result<Command> {
        let mut decoder = Amf0Decoder::new();

        let name = match decoder.decode(payload)? {
            AmfValue::String(s) => s,
            _ => return Err(ProtocolError::InvalidCommand("Expected command name".into()).into()),
        };

        let transaction_id = match decoder.decode(payload) {
            Ok(AmfValue::Number(n)) => n,
            Ok(_) | Err(AmfError::UnexpectedEof) => 0.0,
            Err(e) => return Err(e.into()),
        };

        let command_object = if payload.has_remaining() {
            decoder.decode(payload)?
        } else {
            AmfValue::Null
        };

        let arguments = decoder.decode_all(payload)?;

        Ok(Command {
            name,
            transaction_id,
            command_object,
            arguments,
            stream_id,
        })
    }

    fn parse_data(payload: &mut Bytes, stream_id: u32) -> Result<DataMessage> {
        let mut decoder = Amf0Decoder::new();

        let name = match decoder.decode(payload)? {
            AmfValue::String(s) => s,
            _ => String::new(),
        };
        let values = decoder.decode_all(payload)?;

        Ok(DataMessage { name, values, stream_id })
    }

    /// Message type id on the wire
    pub fn message_type(&self) -> u8 {
        match self {
            RtmpMessage::SetChunkSize(_) => MSG_SET_CHUNK_SIZE,
            RtmpMessage::Abort { .. } => MSG_ABORT,
            RtmpMessage::Acknowledgement { .. } => MSG_ACKNOWLEDGEMENT,
            RtmpMessage::UserControl(_) => MSG_USER_CONTROL,
            RtmpMessage::WindowAckSize(_) => MSG_WINDOW_ACK_SIZE,
            RtmpMessage::SetPeerBandwidth { .. } => MSG_SET_PEER_BANDWIDTH,
            RtmpMessage::Audio { .. } => MSG_AUDIO,
            RtmpMessage::Video { .. } => MSG_VIDEO,
            RtmpMessage::Command(_) => MSG_COMMAND_AMF0,
            RtmpMessage::Data(_) => MSG_DATA_AMF0,
        }
    }

    /// Chunk stream a message of this kind is sent on
    pub fn csid(&self) -> u32 {
        match self {
            RtmpMessage::SetChunkSize(_)
            | RtmpMessage::Abort { .. }
            | RtmpMessage::Acknowledgement { .. }
            | RtmpMessage::UserControl(_)
            | RtmpMessage::WindowAckSize(_)
            | RtmpMessage::SetPeerBandwidth { .. } => CSID_PROTOCOL_CONTROL,
            RtmpMessage::Audio { .. } => CSID_AUDIO,
            RtmpMessage::Video { .. } => CSID_VIDEO,
            RtmpMessage::Command(cmd) if cmd.stream_id != 0 => CSID_DATA,
            RtmpMessage::Command(_) => CSID_COMMAND,
            RtmpMessage::Data(_) => CSID_DATA,
        }
    }

    /// Message stream id the message belongs to (0 for the connection)
    pub fn stream_id(&self) -> u32 {
        match self {
            RtmpMessage::Command(cmd) => cmd.stream_id,
            RtmpMessage::Data(data) => data.stream_id,
            _ => 0,
        }
    }

    pub fn timestamp(&self) -> u32 {
        match self {
            RtmpMessage::Audio { timestamp, .. } | RtmpMessage::Video { timestamp, .. } => {
                *timestamp
            }
            _ => 0,
        }
    }

    /// Encode message to chunk payload
    pub fn encode(&self) -> (u8, Bytes) {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        (self.message_type(), buf.freeze())
    }

    /// Encode the payload into a caller-provided (typically pooled) buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            RtmpMessage::SetChunkSize(size) => buf.put_u32(*size),
            RtmpMessage::Abort { csid } => buf.put_u32(*csid),
            RtmpMessage::Acknowledgement { sequence } => buf.put_u32(*sequence),
            RtmpMessage::WindowAckSize(size) => buf.put_u32(*size),
            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
            }
            RtmpMessage::UserControl(event) => encode_user_control(event, buf),
            RtmpMessage::Audio { data, .. } | RtmpMessage::Video { data, .. } => {
                buf.put_slice(data)
            }
            RtmpMessage::Command(cmd) => encode_command(cmd, buf),
            RtmpMessage::Data(data) => encode_data(data, buf),
        }
    }

    /// Wrap the message into a chunk ready for the chunk encoder
    pub fn to_chunk(&self, stream_id: u32) -> RtmpChunk {
        let (message_type, payload) = self.encode();
        RtmpChunk {
            csid: self.csid(),
            timestamp: self.timestamp(),
            message_type,
            stream_id,
            payload,
        }
    }
}

fn read_u32(payload: &mut Bytes) -> Result<u32> {
    if payload.remaining() < 4 {
        return Err(ProtocolError::InvalidChunkHeader.into());
    }
    Ok(payload.get_u32())
}

fn encode_user_control(event: &UserControlEvent, buf: &mut BytesMut) {
    match event {
        UserControlEvent::StreamBegin(id) => {
            buf.put_u16(UC_STREAM_BEGIN);
            buf.put_u32(*id);
        }
        UserControlEvent::StreamEof(id) => {
            buf.put_u16(UC_STREAM_EOF);
            buf.put_u32(*id);
        }
        UserControlEvent::StreamDry(id) => {
            buf.put_u16(UC_STREAM_DRY);
            buf.put_u32(*id);
        }
        UserControlEvent::SetBufferLength { stream_id, buffer_ms } => {
            buf.put_u16(UC_SET_BUFFER_LENGTH);
            buf.put_u32(*stream_id);
            buf.put_u32(*buffer_ms);
        }
        UserControlEvent::StreamIsRecorded(id) => {
            buf.put_u16(UC_STREAM_IS_RECORDED);
            buf.put_u32(*id);
        }
        UserControlEvent::PingRequest(ts) => {
            buf.put_u16(UC_PING_REQUEST);
            buf.put_u32(*ts);
        }
        UserControlEvent::PingResponse(ts) => {
            buf.put_u16(UC_PING_RESPONSE);
            buf.put_u32(*ts);
        }
        UserControlEvent::Unknown { event_type, data } => {
            buf.put_u16(*event_type);
            buf.put_slice(data);
        }
    }
}

fn encode_command(cmd: &Command, buf: &mut BytesMut) {
    let mut encoder = Amf0Encoder::with_buffer(std::mem::take(buf));
    encoder.encode(&AmfValue::String(cmd.name.clone()));
    encoder.encode(&AmfValue::Number(cmd.transaction_id));
    encoder.encode(&cmd.command_object);
    encoder.encode_all(&cmd.arguments);
    *buf = encoder.into_inner();
}

fn encode_data(data: &DataMessage, buf: &mut BytesMut) {
    let mut encoder = Amf0Encoder::with_buffer(std::mem::take(buf));
    encoder.encode(&AmfValue::String(data.name.clone()));
    encoder.encode_all(&data.values);
    *buf = encoder.into_inner();
}

impl Command {
    pub fn new(
        name: impl Into<String>,
        transaction_id: f64,
        command_object: AmfValue,
        arguments: Vec<AmfValue>,
    ) -> Self {
        Command {
            name: name.into(),
            transaction_id,
            command_object,
            arguments,
            stream_id: 0,
        }
    }

    /// Address the command to a message stream (NetStream commands)
    pub fn on_stream(mut self, stream_id: u32) -> Self {
        self.stream_id = stream_id;
        self
    }

    /// Create a _result response
    pub fn result(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command::new(CMD_RESULT, transaction_id, properties, vec![info])
    }

    /// Create an _error response
    pub fn error(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command::new(CMD_ERROR, transaction_id, properties, vec![info])
    }

    /// Create an onStatus notification
    pub fn on_status(stream_id: u32, level: &str, code: &str, description: &str) -> Self {
        let info = AmfValue::object([
            ("level", level),
            ("code", code),
            ("description", description),
        ]);
        Command::new(CMD_ON_STATUS, 0.0, AmfValue::Null, vec![info]).on_stream(stream_id)
    }

    /// First object argument, where `_result`, `_error` and `onStatus` carry their info
    pub fn info(&self) -> Option<&AmfValue> {
        self.arguments.iter().find(|v| v.as_object().is_some())
    }
}

impl DataMessage {
    pub fn new(name: impl Into<String>, values: Vec<AmfValue>) -> Self {
        DataMessage {
            name: name.into(),
            values,
            stream_id: 0,
        }
    }

    /// `@setDataFrame("onMetaData", metadata)` as sent by publishers
    pub fn set_data_frame(stream_id: u32, metadata: AmfValue) -> Self {
        DataMessage {
            name: CMD_SET_DATA_FRAME.to_string(),
            values: vec![AmfValue::String(CMD_ON_METADATA.to_string()), metadata],
            stream_id,
        }
    }
}

/// Message kinds with their own payload pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Control,
    Command,
    Data,
    Audio,
    Video,
}

impl MessageKind {
    const COUNT: usize = 5;

    pub fn of(message_type: u8) -> Self {
        match message_type {
            MSG_AUDIO => MessageKind::Audio,
            MSG_VIDEO => MessageKind::Video,
            MSG_COMMAND_AMF0 => MessageKind::Command,
            MSG_DATA_AMF0 => MessageKind::Data,
            _ => MessageKind::Control,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Per-kind pools of payload buffers
///
/// Outgoing tag payloads and chunk output buffers are drawn from here and
/// handed back after encoding so steady-state publishing does not allocate.
#[derive(Debug)]
pub struct MessageFactory {
    pools: [Pool<BytesMut>; MessageKind::COUNT],
}

impl MessageFactory {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pools: std::array::from_fn(|_| Pool::new(pool_size)),
        }
    }

    pub fn acquire(&self, kind: MessageKind) -> BytesMut {
        self.pools[kind.index()].acquire()
    }

    pub fn release(&self, kind: MessageKind, buf: BytesMut) {
        self.pools[kind.index()].release(buf);
    }

    pub fn pool(&self, kind: MessageKind) -> &Pool<BytesMut> {
        &self.pools[kind.index()]
    }
}

impl Default for MessageFactory {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn chunk_of(message: &RtmpMessage) -> RtmpChunk {
        message.to_chunk(message.stream_id())
    }

    #[test]
    fn test_command_roundtrip() {
        let cmd = Command::new(
            CMD_CONNECT,
            1.0,
            AmfValue::object([("app", "live"), ("tcUrl", "rtmp://localhost/live")]),
            vec![AmfValue::String("extra".into())],
        );
        let message = RtmpMessage::Command(cmd.clone());
        let chunk = chunk_of(&message);
        assert_eq!(chunk.csid, CSID_COMMAND);
        assert_eq!(chunk.message_type, MSG_COMMAND_AMF0);

        assert_eq!(RtmpMessage::from_chunk(&chunk).unwrap(), message);
    }

    #[test]
    fn test_stream_command_uses_data_csid() {
        let arguments: Vec<AmfValue> = vec!["key".into(), "live".into()];
        let command = Command::new(CMD_PUBLISH, 0.0, AmfValue::Null, arguments).on_stream(1);
        let message = RtmpMessage::Command(command);
        let chunk = chunk_of(&message);
        assert_eq!(chunk.csid, CSID_DATA);
        assert_eq!(chunk.stream_id, 1);
    }

    #[test]
    fn test_on_status_field_order() {
        let cmd = Command::on_status(1, "status", "NetStream.Publish.Start", "Started");
        let info = cmd.info().unwrap().as_object().unwrap();
        let keys: Vec<_> = info.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["level", "code", "description"]);
        assert_eq!(cmd.stream_id, 1);
    }

    #[test]
    fn test_set_data_frame_roundtrip() {
        let metadata = AmfValue::ecma_array([("width", 1280.0), ("height", 720.0)]);
        let message = RtmpMessage::Data(DataMessage::set_data_frame(1, metadata.clone()));
        let parsed = RtmpMessage::from_chunk(&chunk_of(&message)).unwrap();

        match parsed {
            RtmpMessage::Data(data) => {
                assert_eq!(data.name, CMD_SET_DATA_FRAME);
                assert_eq!(data.values[0].as_str(), Some(CMD_ON_METADATA));
                assert_eq!(data.values[1], metadata);
                assert_eq!(data.stream_id, 1);
            }
            other => panic!("Expected data message, got {:?}", other),
        }
    }

    #[test]
    fn test_control_messages() {
        let cases = vec![
            RtmpMessage::SetChunkSize(8192),
            RtmpMessage::Abort { csid: 6 },
            RtmpMessage::Acknowledgement { sequence: 1_000_000 },
            RtmpMessage::WindowAckSize(2_500_000),
            RtmpMessage::SetPeerBandwidth { size: 2_500_000, limit_type: BANDWIDTH_LIMIT_DYNAMIC },
            RtmpMessage::UserControl(UserControlEvent::StreamBegin(1)),
            RtmpMessage::UserControl(UserControlEvent::PingRequest(42)),
            RtmpMessage::UserControl(UserControlEvent::SetBufferLength {
                stream_id: 1,
                buffer_ms: 1000,
            }),
        ];
        for message in cases {
            let chunk = chunk_of(&message);
            assert_eq!(chunk.csid, CSID_PROTOCOL_CONTROL);
            assert_eq!(RtmpMessage::from_chunk(&chunk).unwrap(), message);
        }
    }

    #[test]
    fn test_set_chunk_size_ignores_msb() {
        let chunk = RtmpChunk {
            csid: CSID_PROTOCOL_CONTROL,
            timestamp: 0,
            message_type: MSG_SET_CHUNK_SIZE,
            stream_id: 0,
            payload: Bytes::from_static(&[0x80, 0x00, 0x10, 0x00]),
        };
        assert_eq!(RtmpMessage::from_chunk(&chunk).unwrap(), RtmpMessage::SetChunkSize(4096));
    }

    #[test]
    fn test_truncated_control_message() {
        let chunk = RtmpChunk {
            csid: CSID_PROTOCOL_CONTROL,
            timestamp: 0,
            message_type: MSG_WINDOW_ACK_SIZE,
            stream_id: 0,
            payload: Bytes::from_static(&[0x00, 0x01]),
        };
        assert!(RtmpMessage::from_chunk(&chunk).is_err());
    }

    #[test]
    fn test_unknown_message_type() {
        for type_id in [15u8, 17, 22, 99] {
            let chunk = RtmpChunk {
                csid: CSID_COMMAND,
                timestamp: 0,
                message_type: type_id,
                stream_id: 0,
                payload: Bytes::new(),
            };
            let err = RtmpMessage::from_chunk(&chunk).unwrap_err();
            assert!(matches!(
                err,
                Error::Protocol(ProtocolError::UnknownMessageType(t)) if t == type_id
            ));
        }
    }

    #[test]
    fn test_media_keeps_timestamp() {
        let message = RtmpMessage::Video {
            timestamp: 1234,
            data: Bytes::from_static(&[0x17, 0x01, 0, 0, 0]),
        };
        let chunk = message.to_chunk(1);
        assert_eq!(chunk.timestamp, 1234);
        assert_eq!(chunk.csid, CSID_VIDEO);
        assert_eq!(RtmpMessage::from_chunk(&chunk).unwrap(), message);
    }

    #[test]
    fn test_encode_into_pooled_buffer() {
        let factory = MessageFactory::new(4);
        let mut buf = factory.acquire(MessageKind::Command);
        let message =
            RtmpMessage::Command(Command::new(CMD_CREATE_STREAM, 2.0, AmfValue::Null, vec![]));
        message.encode_into(&mut buf);
        assert_eq!(&buf[..], &message.encode().1[..]);

        factory.release(MessageKind::Command, buf);
        assert_eq!(factory.pool(MessageKind::Command).available(), 1);
        assert_eq!(factory.pool(MessageKind::Audio).available(), 0);
        assert!(factory.acquire(MessageKind::Command).is_empty());
    }

    #[test]
    fn test_message_kind_of() {
        assert_eq!(MessageKind::of(MSG_AUDIO), MessageKind::Audio);
        assert_eq!(MessageKind::of(MSG_VIDEO), MessageKind::Video);
        assert_eq!(MessageKind::of(MSG_COMMAND_AMF0), MessageKind::Command);
        assert_eq!(MessageKind::of(MSG_USER_CONTROL), MessageKind::Control);
    }
}
