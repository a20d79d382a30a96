//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk has a header
//! that identifies the chunk stream and message being sent.
//!
//! ```text
//! +-------------+-----------------+--------------------+------------+
//! | Basic Header| Message Header  | Extended Timestamp | Chunk Data |
//! | (1-3 bytes) | (0/3/7/11 bytes)| (0 or 4 bytes)     | (variable) |
//! +-------------+-----------------+--------------------+------------+
//!
//! Basic Header formats:
//! - 1 byte:  fmt(2) + csid(6)        for csid 2-63
//! - 2 bytes: fmt(2) + 0 + csid(8)    for csid 64-319
//! - 3 bytes: fmt(2) + 1 + csid(16)   for csid 64-65599
//!
//! Message Header formats (based on fmt):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4, LE)
//! - Type 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  timestamp_delta(3)
//! - Type 3 (0 bytes):  (use previous chunk's values)
//! ```
//!
//! The decoder is re-entrant: a chunk is committed only when all of its
//! bytes are buffered, otherwise nothing is consumed and `Ok(None)` is
//! returned so the caller can read more from the socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// A complete RTMP message (reassembled from chunks)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpChunk {
    /// Chunk stream ID (for multiplexing)
    pub csid: u32,
    /// Absolute message timestamp (milliseconds)
    pub timestamp: u32,
    /// Message type ID
    pub message_type: u8,
    /// Message stream ID
    pub stream_id: u32,
    /// Message payload
    pub payload: Bytes,
}

/// Per-chunk-stream reassembly state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ChunkStreamState {
    /// Absolute timestamp of the current (or last) message
    timestamp: u32,
    /// Delta applied when a header-less chunk starts a new message
    timestamp_delta: u32,
    message_length: u32,
    message_type: u8,
    stream_id: u32,
    /// Whether the last header carried an extended timestamp
    extended: bool,
    /// Bytes received so far for the in-flight message
    partial: BytesMut,
}

impl ChunkStreamState {
    fn in_flight(&self) -> bool {
        !self.partial.is_empty() && (self.partial.len() as u32) < self.message_length
    }
}

/// Header values for one chunk, computed before anything is committed
#[derive(Debug, Clone, Copy)]
struct ChunkHeader {
    timestamp: u32,
    timestamp_delta: u32,
    message_length: u32,
    message_type: u8,
    stream_id: u32,
    extended: bool,
    starts_message: bool,
}

/// Result of trying to decode one chunk
enum Step {
    Message(RtmpChunk),
    Consumed,
    NeedMore,
}

/// Chunk stream decoder
///
/// Handles chunk demultiplexing and message reassembly.
pub struct ChunkDecoder {
    chunk_size: u32,
    streams: HashMap<u32, ChunkStreamState>,
    max_message_size: u32,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Set the incoming chunk size (peer sent SetChunkSize)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Decode chunks until a message completes or the buffer runs dry
    ///
    /// Returns `Ok(Some(message))` for a complete message, `Ok(None)` when
    /// more bytes are needed (the buffer then starts at a chunk boundary),
    /// or an error for structurally invalid input.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpChunk>> {
        loop {
            match self.decode_chunk(buf)? {
                Step::Message(message) => return Ok(Some(message)),
                Step::Consumed => continue,
                Step::NeedMore => return Ok(None),
            }
        }
    }

    /// Drop the partial message on a chunk stream (peer sent Abort)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.partial.clear();
        }
    }

    /// Forget every chunk stream, e.g. after the connection closed
    pub fn reset(&mut self) {
        self.streams.clear();
        self.chunk_size = DEFAULT_CHUNK_SIZE;
    }

    fn decode_chunk(&mut self, buf: &mut BytesMut) -> Result<Step> {
        let Some((fmt, csid, basic_len)) = parse_basic_header(buf) else {
            return Ok(Step::NeedMore);
        };

        let Some((header, header_len)) = self.parse_message_header(&buf[basic_len..], fmt, csid)?
        else {
            return Ok(Step::NeedMore);
        };

        if header.message_length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: header.message_length,
                max: self.max_message_size,
            }
            .into());
        }

        let received = match self.streams.get(&csid) {
            Some(state) if !header.starts_message => state.partial.len() as u32,
            _ => 0,
        };
        let take = (header.message_length - received).min(self.chunk_size) as usize;
        let chunk_len = basic_len + header_len + take;
        if buf.len() < chunk_len {
            return Ok(Step::NeedMore);
        }

        // Whole chunk is buffered: commit
        buf.advance(basic_len + header_len);
        let data = buf.split_to(take);

        let state = self.streams.entry(csid).or_default();
        if header.starts_message {
            if state.in_flight() {
                tracing::warn!(
                    csid,
                    dropped = state.partial.len(),
                    "New message header interrupted a partial message"
                );
            }
            state.partial.clear();
            state.partial.reserve(header.message_length as usize);
        }
        state.timestamp = header.timestamp;
        state.timestamp_delta = header.timestamp_delta;
        state.message_length = header.message_length;
        state.message_type = header.message_type;
        state.stream_id = header.stream_id;
        state.extended = header.extended;
        state.partial.put_slice(&data);

        if state.partial.len() as u32 == state.message_length {
            let payload = state.partial.split().freeze();
            return Ok(Step::Message(RtmpChunk {
                csid,
                timestamp: state.timestamp,
                message_type: state.message_type,
                stream_id: state.stream_id,
                payload,
            }));
        }

        Ok(Step::Consumed)
    }

    /// Parse the message header and extended timestamp that follow the basic header
    ///
    /// Returns the resolved header and its encoded length, or `None` if the
    /// bytes are not all available yet. Never mutates decoder state.
    fn parse_message_header(
        &self,
        data: &[u8],
        fmt: u8,
        csid: u32,
    ) -> Result<Option<(ChunkHeader, usize)>> {
        let prev = self.streams.get(&csid);
        if fmt != CHUNK_FMT_0 && prev.is_none() {
            // Nothing to inherit from
            return Err(ProtocolError::InvalidChunkHeader.into());
        }

        let header_len = match fmt {
            CHUNK_FMT_0 => 11,
            CHUNK_FMT_1 => 7,
            CHUNK_FMT_2 => 3,
            _ => 0,
        };
        if data.len() < header_len {
            return Ok(None);
        }

        let ts_field = if fmt == CHUNK_FMT_3 { 0 } else { read_u24(&data[0..3]) };
        let extended = match (fmt, prev) {
            (CHUNK_FMT_3, Some(p)) => p.extended,
            _ => ts_field == EXTENDED_TIMESTAMP_THRESHOLD,
        };
        let total_len = header_len + if extended { 4 } else { 0 };
        if data.len() < total_len {
            return Ok(None);
        }
        let ts_value = if extended {
            u32::from_be_bytes([
                data[header_len],
                data[header_len + 1],
                data[header_len + 2],
                data[header_len + 3],
            ])
        } else {
            ts_field
        };

        let header = match (fmt, prev) {
            (CHUNK_FMT_0, _) => ChunkHeader {
                timestamp: ts_value,
                // A following header-less message reuses the type-0 timestamp as its delta
                timestamp_delta: ts_value,
                message_length: read_u24(&data[3..6]),
                message_type: data[6],
                stream_id: u32::from_le_bytes([data[7], data[8], data[9], data[10]]),
                extended,
                starts_message: true,
            },
            (CHUNK_FMT_1, Some(p)) => ChunkHeader {
                timestamp: p.timestamp.wrapping_add(ts_value),
                timestamp_delta: ts_value,
                message_length: read_u24(&data[3..6]),
                message_type: data[6],
                stream_id: p.stream_id,
                extended,
                starts_message: true,
            },
            (CHUNK_FMT_2, Some(p)) => ChunkHeader {
                timestamp: p.timestamp.wrapping_add(ts_value),
                timestamp_delta: ts_value,
                message_length: p.message_length,
                message_type: p.message_type,
                stream_id: p.stream_id,
                extended,
                starts_message: true,
            },
            (_, Some(p)) => {
                let continuation = p.in_flight();
                let delta = if extended && !continuation {
                    ts_value
                } else {
                    p.timestamp_delta
                };
                ChunkHeader {
                    timestamp: if continuation {
                        p.timestamp
                    } else {
                        p.timestamp.wrapping_add(delta)
                    },
                    timestamp_delta: delta,
                    message_length: p.message_length,
                    message_type: p.message_type,
                    stream_id: p.stream_id,
                    extended,
                    starts_message: !continuation,
                }
            }
            (_, None) => return Err(ProtocolError::InvalidChunkHeader.into()),
        };

        Ok(Some((header, total_len)))
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk stream encoder
///
/// Every message starts with a type-0 header carrying the absolute
/// timestamp; continuation chunks use type 3.
pub struct ChunkEncoder {
    chunk_size: u32,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the outgoing chunk size; takes effect for the next message
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Encode a message into chunks appended to `buf`
    pub fn encode(&self, chunk: &RtmpChunk, buf: &mut BytesMut) {
        let chunk_size = self.chunk_size as usize;
        let payload_len = chunk.payload.len();
        let extended = chunk.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD;
        let timestamp_field = if extended {
            EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            chunk.timestamp
        };

        let chunks = payload_len.div_ceil(chunk_size).max(1);
        buf.reserve(payload_len + 16 + chunks * 8);

        write_basic_header(chunk.csid, CHUNK_FMT_0, buf);
        write_u24(timestamp_field, buf);
        write_u24(payload_len as u32, buf);
        buf.put_u8(chunk.message_type);
        buf.put_u32_le(chunk.stream_id);
        if extended {
            buf.put_u32(chunk.timestamp);
        }

        let mut offset = 0;
        loop {
            let end = (offset + chunk_size).min(payload_len);
            buf.put_slice(&chunk.payload[offset..end]);
            offset = end;
            if offset >= payload_len {
                break;
            }
            write_basic_header(chunk.csid, CHUNK_FMT_3, buf);
            if extended {
                buf.put_u32(chunk.timestamp);
            }
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse basic header and return (fmt, csid, header_length)
fn parse_basic_header(buf: &[u8]) -> Option<(u8, u32, usize)> {
    let first = *buf.first()?;
    let fmt = (first >> 6) & 0x03;

    match first & 0x3F {
        0 => {
            let second = *buf.get(1)?;
            Some((fmt, 64 + second as u32, 2))
        }
        1 => {
            if buf.len() < 3 {
                return None;
            }
            Some((fmt, 64 + buf[1] as u32 + (buf[2] as u32) * 256, 3))
        }
        csid => Some((fmt, csid as u32, 1)),
    }
}

fn write_basic_header(csid: u32, fmt: u8, buf: &mut BytesMut) {
    if csid >= 64 + 256 {
        let offset = csid - 64;
        buf.put_u8((fmt << 6) | 1);
        buf.put_u8((offset & 0xFF) as u8);
        buf.put_u8(((offset >> 8) & 0xFF) as u8);
    } else if csid >= 64 {
        buf.put_u8(fmt << 6);
        buf.put_u8((csid - 64) as u8);
    } else {
        buf.put_u8((fmt << 6) | (csid as u8));
    }
}

fn read_u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | (b[2] as u32)
}

fn write_u24(value: u32, buf: &mut BytesMut) {
    buf.put_u8(((value >> 16) & 0xFF) as u8);
    buf.put_u8(((value >> 8) & 0xFF) as u8);
    buf.put_u8((value & 0xFF) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn message(csid: u32, timestamp: u32, message_type: u8, len: usize) -> RtmpChunk {
        RtmpChunk {
            csid,
            timestamp,
            message_type,
            stream_id: 1,
            payload: Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>()),
        }
    }

    fn decode_all(decoder: &mut ChunkDecoder, buf: &mut BytesMut) -> Vec<RtmpChunk> {
        let mut out = Vec::new();
        while let Some(m) = decoder.decode(buf).unwrap() {
            out.push(m);
        }
        out
    }

    #[test]
    fn test_basic_header_parsing() {
        assert_eq!(parse_basic_header(&[0x03]), Some((0, 3, 1)));
        assert_eq!(parse_basic_header(&[0xC4]), Some((3, 4, 1)));
        assert_eq!(parse_basic_header(&[0x00, 0x00]), Some((0, 64, 2)));
        assert_eq!(parse_basic_header(&[0x01, 0x00, 0x01]), Some((0, 320, 3)));
        assert_eq!(parse_basic_header(&[0x01, 0x00]), None);
        assert_eq!(parse_basic_header(&[]), None);
    }

    #[test]
    fn test_basic_header_writing() {
        for csid in [2u32, 63, 64, 319, 320, 65599] {
            let mut buf = BytesMut::new();
            write_basic_header(csid, 2, &mut buf);
            assert_eq!(parse_basic_header(&buf), Some((2, csid, buf.len())));
        }
    }

    #[rstest]
    fn test_split_and_reassemble(
        #[values(128, 1024, 8192)] chunk_size: u32,
        #[values(0, 1, 127, 128, 129, 1024, 8192, 8193, 40_000)] len: usize,
    ) {
        let original = message(CSID_VIDEO, 1000, MSG_VIDEO, len);

        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(chunk_size);
        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(chunk_size);

        let mut encoded = BytesMut::new();
        encoder.encode(&original, &mut encoded);

        let expected_chunks = len.div_ceil(chunk_size as usize).max(1);
        assert_eq!(encoded.len(), 12 + len + (expected_chunks - 1));

        let decoded = decoder.decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_byte_at_a_time_matches_bulk() {
        let messages = vec![
            message(CSID_COMMAND, 0, MSG_COMMAND_AMF0, 300),
            message(CSID_AUDIO, 20, MSG_AUDIO, 50),
            message(CSID_VIDEO, 33, MSG_VIDEO, 1000),
            message(CSID_VIDEO, 66, MSG_VIDEO, 129),
        ];
        let encoder = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        for m in &messages {
            encoder.encode(m, &mut wire);
        }

        let mut bulk = ChunkDecoder::new();
        let mut bulk_buf = wire.clone();
        let bulk_out = decode_all(&mut bulk, &mut bulk_buf);

        let mut trickle = ChunkDecoder::new();
        let mut trickle_buf = BytesMut::new();
        let mut trickle_out = Vec::new();
        for byte in wire.iter() {
            trickle_buf.put_u8(*byte);
            trickle_out.extend(decode_all(&mut trickle, &mut trickle_buf));
        }

        assert_eq!(bulk_out, messages);
        assert_eq!(trickle_out, messages);
        assert_eq!(bulk.streams, trickle.streams);
        assert!(trickle_buf.is_empty());
    }

    #[test]
    fn test_partial_chunk_consumes_nothing() {
        let encoder = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        encoder.encode(&message(CSID_VIDEO, 0, MSG_VIDEO, 100), &mut wire);

        let mut decoder = ChunkDecoder::new();
        let mut partial = BytesMut::from(&wire[..50]);
        assert!(decoder.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 50);
        assert!(decoder.streams.is_empty());
    }

    #[test]
    fn test_interleaved_chunk_streams() {
        let audio = message(CSID_AUDIO, 10, MSG_AUDIO, 200);
        let video = message(CSID_VIDEO, 20, MSG_VIDEO, 200);
        let encoder = ChunkEncoder::new();

        let mut a = BytesMut::new();
        encoder.encode(&audio, &mut a);
        let mut v = BytesMut::new();
        encoder.encode(&video, &mut v);

        // first chunk: basic(1) + header(11) + 128 data
        let a1 = a.split_to(140);
        let v1 = v.split_to(140);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&a1);
        wire.extend_from_slice(&v1);
        wire.extend_from_slice(&a);
        wire.extend_from_slice(&v);

        let mut decoder = ChunkDecoder::new();
        let out = decode_all(&mut decoder, &mut wire);
        assert_eq!(out, vec![audio, video]);
    }

    #[test]
    fn test_delta_headers() {
        let mut wire = BytesMut::new();
        // fmt 0: ts=1000 len=2 type=8 sid=1
        wire.put_slice(&[0x04, 0x00, 0x03, 0xE8, 0x00, 0x00, 0x02, 0x08, 0x01, 0x00, 0x00, 0x00]);
        wire.put_slice(&[0xAA, 0xBB]);
        // fmt 1: delta=20 len=1 type=8
        wire.put_slice(&[0x44, 0x00, 0x00, 0x14, 0x00, 0x00, 0x01, 0x08, 0xCC]);
        // fmt 2: delta=30
        wire.put_slice(&[0x84, 0x00, 0x00, 0x1E, 0xDD]);
        // fmt 3 new message: reuses delta=30
        wire.put_slice(&[0xC4, 0xEE]);

        let mut decoder = ChunkDecoder::new();
        let out = decode_all(&mut decoder, &mut wire);
        let stamps: Vec<_> = out.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![1000, 1020, 1050, 1080]);
        assert!(out.iter().all(|m| m.stream_id == 1 && m.message_type == MSG_AUDIO));
        assert_eq!(&out[3].payload[..], &[0xEE]);
    }

    #[test]
    fn test_continuation_does_not_advance_timestamp() {
        let mut decoder = ChunkDecoder::new();
        let mut wire = BytesMut::new();
        // fmt 0 with 200-byte message at ts=5, then fmt 3 continuation
        wire.put_slice(&[0x06, 0x00, 0x00, 0x05, 0x00, 0x00, 0xC8, 0x09, 0x01, 0x00, 0x00, 0x00]);
        wire.put_slice(&[0u8; 128]);
        wire.put_u8(0xC6);
        wire.put_slice(&[0u8; 72]);

        let out = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(out.timestamp, 5);
        assert_eq!(out.payload.len(), 200);
    }

    #[test]
    fn test_extended_timestamp_roundtrip() {
        let original = message(CSID_VIDEO, 0x0100_0000, MSG_VIDEO, 300);
        let encoder = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        encoder.encode(&original, &mut wire);

        // three chunks, each carrying the 4-byte extended timestamp
        assert_eq!(wire.len(), 12 + 4 + 300 + 2 * (1 + 4));

        let mut decoder = ChunkDecoder::new();
        let out = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(out, original);
    }

    #[test]
    fn test_header_without_history_is_invalid() {
        let mut decoder = ChunkDecoder::new();
        let mut wire = BytesMut::from(&[0xC5, 0x00][..]);
        assert!(decoder.decode(&mut wire).is_err());

        let mut wire = BytesMut::from(&[0x45, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x08, 0x00][..]);
        assert!(decoder.decode(&mut wire).is_err());
    }

    #[test]
    fn test_message_too_large() {
        let mut decoder = ChunkDecoder::new();
        let mut wire = BytesMut::from(&[0x04, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0x08, 1, 0, 0, 0][..]);
        // 16 MiB - 1 fits
        assert!(decoder.decode(&mut wire).unwrap().is_none());

        decoder.max_message_size = 1024;
        let mut wire = BytesMut::from(&[0x05, 0, 0, 0, 0x00, 0x08, 0x00, 0x08, 1, 0, 0, 0][..]);
        assert!(decoder.decode(&mut wire).is_err());
    }

    #[test]
    fn test_abort_discards_partial() {
        let encoder = ChunkEncoder::new();
        let mut first = BytesMut::new();
        encoder.encode(&message(CSID_VIDEO, 0, MSG_VIDEO, 200), &mut first);
        first.truncate(140);

        let mut decoder = ChunkDecoder::new();
        assert!(decoder.decode(&mut first).unwrap().is_none());
        decoder.abort(CSID_VIDEO);

        let next = message(CSID_VIDEO, 40, MSG_VIDEO, 10);
        let mut wire = BytesMut::new();
        encoder.encode(&next, &mut wire);
        assert_eq!(decoder.decode(&mut wire).unwrap().unwrap(), next);
    }
}
