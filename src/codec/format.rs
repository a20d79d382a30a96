//! Stream format descriptions exchanged with coders

use bytes::Bytes;

pub const MIMETYPE_AUDIO_AAC: &str = "audio/mp4a-latm";
pub const MIMETYPE_AUDIO_RAW: &str = "audio/raw";
pub const MIMETYPE_VIDEO_AVC: &str = "video/avc";
pub const MIMETYPE_VIDEO_HEVC: &str = "video/hevc";
pub const MIMETYPE_VIDEO_RAW: &str = "video/raw";

/// Describes the samples a coder consumes or produces
///
/// `csd` holds codec-specific data: the AudioSpecificConfig for AAC and
/// start-coded parameter sets for AVC/HEVC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub sample_rate: u32,
    pub channels: u8,
    /// Bits per second, 0 when unknown
    pub bitrate: u32,
    pub csd: Option<Bytes>,
}

impl MediaFormat {
    pub fn audio(mime: &str, sample_rate: u32, channels: u8) -> Self {
        Self {
            mime: mime.to_string(),
            sample_rate,
            channels,
            ..Default::default()
        }
    }

    pub fn video(mime: &str, width: u32, height: u32) -> Self {
        Self {
            mime: mime.to_string(),
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_csd(mut self, csd: Bytes) -> Self {
        self.csd = Some(csd);
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn is_audio(&self) -> bool {
        self.mime.starts_with("audio/")
    }

    pub fn is_video(&self) -> bool {
        self.mime.starts_with("video/")
    }

    /// Compressed formats that can be packaged into RTMP tags
    pub fn is_encoded(&self) -> bool {
        matches!(
            self.mime.as_str(),
            MIMETYPE_AUDIO_AAC | MIMETYPE_VIDEO_AVC | MIMETYPE_VIDEO_HEVC
        )
    }
}
