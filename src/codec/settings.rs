//! Encoder settings for publishing

use std::time::Duration;

use crate::amf::AmfValue;
use crate::media::aac::AacProfile;
use crate::media::flv::VideoCodec;

use super::format::{MediaFormat, MIMETYPE_AUDIO_AAC, MIMETYPE_VIDEO_AVC, MIMETYPE_VIDEO_HEVC};

/// AAC encoder settings
#[derive(Debug, Clone, PartialEq)]
pub struct AudioCodecSettings {
    /// Bits per second
    pub bitrate: u32,
    pub sample_rate: u32,
    pub channels: u8,
    pub profile: AacProfile,
}

impl Default for AudioCodecSettings {
    fn default() -> Self {
        Self {
            bitrate: 64 * 1000,
            sample_rate: 44100,
            channels: 2,
            profile: AacProfile::Lc,
        }
    }
}

impl AudioCodecSettings {
    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    pub fn to_format(&self) -> MediaFormat {
        MediaFormat::audio(MIMETYPE_AUDIO_AAC, self.sample_rate, self.channels)
            .with_bitrate(self.bitrate)
    }
}

/// AVC/HEVC encoder settings
#[derive(Debug, Clone, PartialEq)]
pub struct VideoCodecSettings {
    pub width: u32,
    pub height: u32,
    /// Bits per second
    pub bitrate: u32,
    pub frame_rate: u32,
    pub key_frame_interval: Duration,
    pub codec: VideoCodec,
}

impl Default for VideoCodecSettings {
    fn default() -> Self {
        Self {
            width: 854,
            height: 480,
            bitrate: 640 * 1000,
            frame_rate: 30,
            key_frame_interval: Duration::from_secs(2),
            codec: VideoCodec::Avc,
        }
    }
}

impl VideoCodecSettings {
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn key_frame_interval(mut self, interval: Duration) -> Self {
        self.key_frame_interval = interval;
        self
    }

    pub fn codec(mut self, codec: VideoCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn mime(&self) -> &'static str {
        match self.codec {
            VideoCodec::Avc => MIMETYPE_VIDEO_AVC,
            VideoCodec::Hevc => MIMETYPE_VIDEO_HEVC,
        }
    }

    pub fn to_format(&self) -> MediaFormat {
        MediaFormat::video(self.mime(), self.width, self.height)
            .with_bitrate(self.bitrate)
            .with_frame_rate(self.frame_rate)
    }
}

/// `onMetaData` properties describing what a publisher sends
pub fn metadata(
    audio: Option<&AudioCodecSettings>,
    video: Option<&VideoCodecSettings>,
) -> AmfValue {
    let mut meta = AmfValue::ecma_array(Vec::<(String, AmfValue)>::new());
    if let Some(video) = video {
        meta.insert("width", video.width);
        meta.insert("height", video.height);
        meta.insert("framerate", video.frame_rate);
        meta.insert("videocodecid", video.codec.metadata_id());
        meta.insert("videodatarate", video.bitrate as f64 / 1000.0);
    }
    if let Some(audio) = audio {
        meta.insert("audiocodecid", 10u32);
        meta.insert("audiodatarate", audio.bitrate as f64 / 1000.0);
        meta.insert("audiosamplerate", audio.sample_rate);
        meta.insert("audiochannels", audio.channels as u32);
        meta.insert("stereo", audio.channels > 1);
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_fields() {
        let video = VideoCodecSettings::default().size(1280, 720).codec(VideoCodec::Hevc);
        let audio = AudioCodecSettings::default();
        let meta = metadata(Some(&audio), Some(&video));

        assert_eq!(meta.get_number("width"), Some(1280.0));
        assert_eq!(meta.get_string("videocodecid"), Some("hvc1"));
        assert_eq!(meta.get_number("videodatarate"), Some(640.0));
        assert_eq!(meta.get_number("audiocodecid"), Some(10.0));
        assert_eq!(meta.get("stereo").and_then(AmfValue::as_bool), Some(true));
    }

    #[test]
    fn test_audio_only_metadata() {
        let meta = metadata(Some(&AudioCodecSettings::default().channels(1)), None);
        assert!(meta.get("width").is_none());
        assert_eq!(meta.get("stereo").and_then(AmfValue::as_bool), Some(false));
    }

    #[test]
    fn test_formats() {
        let format = VideoCodecSettings::default().to_format();
        assert_eq!(format.mime, MIMETYPE_VIDEO_AVC);
        assert!(format.is_video() && format.is_encoded());
        assert_eq!(AudioCodecSettings::default().to_format().sample_rate, 44100);
    }
}
