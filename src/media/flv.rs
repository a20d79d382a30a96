//! FLV tag bodies carried by RTMP audio/video messages
//!
//! RTMP audio and video messages hold FLV tag data without the FLV tag header.
//!
//! Audio (AAC only):
//! ```text
//! +-----------+-----------+----------+----------+---------------+
//! |SoundFormat| SoundRate |SoundSize |SoundType | AACPacketType | Data
//! | (4 bits)  | (2 bits)  | (1 bit)  | (1 bit)  | (1 byte)      |
//! +-----------+-----------+----------+----------+---------------+
//! ```
//!
//! Legacy video (AVC):
//! ```text
//! +----------+----------+---------------+-----------------+
//! |FrameType | CodecID  | AVCPacketType | CompositionTime | Data
//! | (4 bits) | (4 bits) | (1 byte)      | (3 bytes, SI24) |
//! +----------+----------+---------------+-----------------+
//! ```
//!
//! Enhanced video (HEVC):
//! ```text
//! +-----------------+-----------+------------+------------+
//! |IsExHeader (1)   | FrameType | PacketType | FourCC     | [CompositionTime] Data
//! |                 | (3 bits)  | (4 bits)   | (4 bytes)  |
//! +-----------------+-----------+------------+------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

/// AAC with 44.1 kHz / 16-bit / stereo flags, the only audio header we send
pub const AAC_HEADER: u8 = 0xAF;
/// FourCC for HEVC in the enhanced video header
pub const HEVC_FOURCC: [u8; 4] = *b"hvc1";

const EX_HEADER_FLAG: u8 = 0x80;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
}

/// An audio or video tag body with its RTMP timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    pub tag_type: FlvTagType,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// Tag body including codec headers
    pub data: Bytes,
}

/// Video frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    GeneratedKeyframe = 4,
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    /// Read from a 4-bit (legacy) or 3-bit (enhanced) field
    pub fn from_bits(b: u8) -> Option<Self> {
        match b {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn from_keyframe(keyframe: bool) -> Self {
        if keyframe {
            VideoFrameType::Keyframe
        } else {
            VideoFrameType::InterFrame
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe)
    }
}

/// Video codecs understood on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    /// Legacy codec id 7
    Avc,
    /// Enhanced RTMP, FourCC `hvc1`
    Hevc,
}

impl VideoCodec {
    /// Value of `videocodecid` in onMetaData
    pub fn metadata_id(self) -> crate::amf::AmfValue {
        match self {
            VideoCodec::Avc => crate::amf::AmfValue::Number(7.0),
            VideoCodec::Hevc => crate::amf::AmfValue::String("hvc1".into()),
        }
    }
}

/// Audio formats understood on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Aac = 10,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            10 => Some(AudioFormat::Aac),
            _ => None,
        }
    }
}

/// Packet type shared by AVC tags and enhanced HEVC tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoPacketType {
    /// Decoder configuration record
    SequenceStart = 0,
    CodedFrames = 1,
    SequenceEnd = 2,
    /// Coded frames without composition time (enhanced only)
    CodedFramesX = 3,
}

impl VideoPacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(VideoPacketType::SequenceStart),
            1 => Some(VideoPacketType::CodedFrames),
            2 => Some(VideoPacketType::SequenceEnd),
            3 => Some(VideoPacketType::CodedFramesX),
            _ => None,
        }
    }
}

/// Parsed audio tag body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPacket {
    /// AudioSpecificConfig
    AacConfig(Bytes),
    /// Raw AAC frame
    AacFrame(Bytes),
}

/// Parsed video tag body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoPacket {
    /// AVCDecoderConfigurationRecord or HEVCDecoderConfigurationRecord
    Config { codec: VideoCodec, record: Bytes },
    /// Length-prefixed NAL units
    Frame {
        codec: VideoCodec,
        keyframe: bool,
        composition_time: i32,
        data: Bytes,
    },
    EndOfSequence { codec: VideoCodec },
}

impl FlvTag {
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Video,
            timestamp,
            data,
        }
    }

    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Audio,
            timestamp,
            data,
        }
    }

    pub fn is_video(&self) -> bool {
        self.tag_type == FlvTagType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.tag_type == FlvTagType::Audio
    }

    /// Frame type of a legacy or enhanced video tag
    pub fn video_frame_type(&self) -> Option<VideoFrameType> {
        let first = *self.data.first().filter(|_| self.is_video())?;
        if first & EX_HEADER_FLAG != 0 {
            VideoFrameType::from_bits((first >> 4) & 0x07)
        } else {
            VideoFrameType::from_bits((first >> 4) & 0x0F)
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.video_frame_type()
            .map(|ft| ft.is_keyframe())
            .unwrap_or(false)
    }

    /// AAC AudioSpecificConfig or AVC/HEVC configuration record
    pub fn is_sequence_header(&self) -> bool {
        match self.tag_type {
            FlvTagType::Audio => {
                self.data.len() >= 2
                    && AudioFormat::from_byte(self.data[0]) == Some(AudioFormat::Aac)
                    && self.data[1] == 0
            }
            FlvTagType::Video => matches!(self.parse_video(), Ok(VideoPacket::Config { .. })),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn parse_audio(&self) -> Result<AudioPacket> {
        let mut data = self.data.clone();
        if data.len() < 2 {
            return Err(MediaError::InvalidAacPacket.into());
        }
        let header = data.get_u8();
        if AudioFormat::from_byte(header).is_none() {
            let format = format!("audio format {}", header >> 4);
            return Err(MediaError::UnsupportedCodec(format).into());
        }
        match data.get_u8() {
            0 => Ok(AudioPacket::AacConfig(data)),
            1 => Ok(AudioPacket::AacFrame(data)),
            _ => Err(MediaError::InvalidAacPacket.into()),
        }
    }

    pub fn parse_video(&self) -> Result<VideoPacket> {
        let mut data = self.data.clone();
        if data.is_empty() {
            return Err(MediaError::InvalidFlvTag.into());
        }
        let header = data.get_u8();

        if header & EX_HEADER_FLAG != 0 {
            return parse_enhanced_video(header, data);
        }

        let codec_id = header & 0x0F;
        if codec_id != 7 {
            return Err(MediaError::UnsupportedCodec(format!("video codec id {}", codec_id)).into());
        }
        if data.len() < 4 {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let keyframe = VideoFrameType::from_bits(header >> 4)
            .map(|ft| ft.is_keyframe())
            .unwrap_or(false);
        let packet_type = data.get_u8();
        let composition_time = read_si24(&mut data);

        match VideoPacketType::from_byte(packet_type) {
            Some(VideoPacketType::SequenceStart) => Ok(VideoPacket::Config {
                codec: VideoCodec::Avc,
                record: data,
            }),
            Some(VideoPacketType::CodedFrames) => Ok(VideoPacket::Frame {
                codec: VideoCodec::Avc,
                keyframe,
                composition_time,
                data,
            }),
            Some(VideoPacketType::SequenceEnd) => Ok(VideoPacket::EndOfSequence {
                codec: VideoCodec::Avc,
            }),
            _ => Err(MediaError::InvalidAvcPacket.into()),
        }
    }
}

fn parse_enhanced_video(header: u8, mut data: Bytes) -> Result<VideoPacket> {
    if data.len() < 4 {
        return Err(MediaError::InvalidFlvTag.into());
    }
    let mut fourcc = [0u8; 4];
    data.copy_to_slice(&mut fourcc);
    if fourcc != HEVC_FOURCC {
        let fourcc = String::from_utf8_lossy(&fourcc).into_owned();
        return Err(MediaError::UnsupportedCodec(fourcc).into());
    }

    let keyframe = VideoFrameType::from_bits((header >> 4) & 0x07)
        .map(|ft| ft.is_keyframe())
        .unwrap_or(false);
    let codec = VideoCodec::Hevc;

    match VideoPacketType::from_byte(header & 0x0F) {
        Some(VideoPacketType::SequenceStart) => Ok(VideoPacket::Config { codec, record: data }),
        Some(VideoPacketType::CodedFrames) => {
            if data.len() < 3 {
                return Err(MediaError::InvalidFlvTag.into());
            }
            let composition_time = read_si24(&mut data);
            Ok(VideoPacket::Frame {
                codec,
                keyframe,
                composition_time,
                data,
            })
        }
        Some(VideoPacketType::CodedFramesX) => Ok(VideoPacket::Frame {
            codec,
            keyframe,
            composition_time: 0,
            data,
        }),
        Some(VideoPacketType::SequenceEnd) => Ok(VideoPacket::EndOfSequence { codec }),
        None => Err(MediaError::InvalidFlvTag.into()),
    }
}

/// Write an AAC tag body
pub fn write_aac(buf: &mut BytesMut, config: bool, data: &[u8]) {
    buf.reserve(2 + data.len());
    buf.put_u8(AAC_HEADER);
    buf.put_u8(if config { 0 } else { 1 });
    buf.put_slice(data);
}

/// Write a legacy AVC tag body
pub fn write_avc(
    buf: &mut BytesMut,
    packet_type: VideoPacketType,
    keyframe: bool,
    composition_time: i32,
    data: &[u8],
) {
    buf.reserve(5 + data.len());
    buf.put_u8(((VideoFrameType::from_keyframe(keyframe) as u8) << 4) | 7);
    buf.put_u8(packet_type as u8);
    write_si24(buf, composition_time);
    buf.put_slice(data);
}

/// Write an enhanced HEVC tag body
///
/// Frames are written as `CodedFramesX`, which carries no composition time.
pub fn write_hevc(buf: &mut BytesMut, packet_type: VideoPacketType, keyframe: bool, data: &[u8]) {
    buf.reserve(5 + data.len());
    buf.put_u8(
        EX_HEADER_FLAG | ((VideoFrameType::from_keyframe(keyframe) as u8) << 4) | packet_type as u8,
    );
    buf.put_slice(&HEVC_FOURCC);
    buf.put_slice(data);
}

fn read_si24(data: &mut Bytes) -> i32 {
    let value =
        ((data.get_u8() as i32) << 16) | ((data.get_u8() as i32) << 8) | data.get_u8() as i32;
    // Sign extend from 24 bits
    (value << 8) >> 8
}

fn write_si24(buf: &mut BytesMut, value: i32) {
    let value = value as u32 & 0x00FF_FFFF;
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_frame_type() {
        let key = FlvTag::video(0, Bytes::from_static(&[0x17, 0x01, 0, 0, 0]));
        assert_eq!(key.video_frame_type(), Some(VideoFrameType::Keyframe));
        let inter = FlvTag::video(0, Bytes::from_static(&[0x27, 0x01, 0, 0, 0]));
        assert!(!inter.is_keyframe());
    }

    #[test]
    fn test_aac_packaging() {
        let mut buf = BytesMut::new();
        write_aac(&mut buf, true, &[0x12, 0x10]);
        assert_eq!(&buf[..], &[0xAF, 0x00, 0x12, 0x10]);

        let tag = FlvTag::audio(0, buf.freeze());
        assert!(tag.is_sequence_header());
        assert_eq!(
            tag.parse_audio().unwrap(),
            AudioPacket::AacConfig(Bytes::from_static(&[0x12, 0x10]))
        );

        let mut buf = BytesMut::new();
        write_aac(&mut buf, false, &[0x21, 0x00]);
        let tag = FlvTag::audio(23, buf.freeze());
        assert!(!tag.is_sequence_header());
        assert!(matches!(tag.parse_audio().unwrap(), AudioPacket::AacFrame(_)));
    }

    #[test]
    fn test_avc_packaging_with_negative_composition_time() {
        let mut buf = BytesMut::new();
        write_avc(&mut buf, VideoPacketType::CodedFrames, false, -33, &[0, 0, 0, 1, 0x41]);
        assert_eq!(buf[0], 0x27);

        let tag = FlvTag::video(0, buf.freeze());
        match tag.parse_video().unwrap() {
            VideoPacket::Frame {
                codec,
                keyframe,
                composition_time,
                data,
            } => {
                assert_eq!(codec, VideoCodec::Avc);
                assert!(!keyframe);
                assert_eq!(composition_time, -33);
                assert_eq!(&data[..], &[0, 0, 0, 1, 0x41]);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_hevc_enhanced_header() {
        let mut buf = BytesMut::new();
        write_hevc(&mut buf, VideoPacketType::SequenceStart, true, &[0x01, 0x02]);
        assert_eq!(buf[0], 0x80 | 0x10);
        assert_eq!(&buf[1..5], b"hvc1");

        let tag = FlvTag::video(0, buf.freeze());
        assert!(tag.is_keyframe());
        assert!(tag.is_sequence_header());

        let mut buf = BytesMut::new();
        write_hevc(&mut buf, VideoPacketType::CodedFramesX, false, &[0, 0, 0, 2, 0x02, 0x01]);
        assert_eq!(buf[0], 0x80 | 0x20 | 0x03);
        let tag = FlvTag::video(0, buf.freeze());
        assert!(matches!(
            tag.parse_video().unwrap(),
            VideoPacket::Frame { codec: VideoCodec::Hevc, keyframe: false, composition_time: 0, .. }
        ));
    }

    #[test]
    fn test_unsupported_codecs() {
        let vp6 = FlvTag::video(0, Bytes::from_static(&[0x14, 0x00]));
        assert!(vp6.parse_video().is_err());
        let av1 = FlvTag::video(0, Bytes::from_static(&[0x90, b'a', b'v', b'0', b'1']));
        assert!(av1.parse_video().is_err());
        let mp3 = FlvTag::audio(0, Bytes::from_static(&[0x2F, 0x00]));
        assert!(mp3.parse_audio().is_err());
    }
}
