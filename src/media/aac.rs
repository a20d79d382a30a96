//! AAC AudioSpecificConfig
//!
//! RTMP carries AAC without ADTS headers; the decoder is configured from the
//! AudioSpecificConfig sent in the sequence header tag.
//!
//! ```text
//! audioObjectType (5) | samplingFrequencyIndex (4) | [samplingFrequency (24)]
//! | channelConfiguration (4) | frameLengthFlag (1) | dependsOnCoreCoder (1)
//! | extensionFlag (1)
//! ```

use bytes::Bytes;

use crate::error::{MediaError, Result};

/// AAC profile (audio object type)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AacProfile {
    Main = 1,
    /// Low Complexity, the common case
    Lc = 2,
    Ssr = 3,
    Ltp = 4,
    /// HE-AAC
    Sbr = 5,
    Scalable = 6,
}

impl AacProfile {
    pub fn from_object_type(ot: u8) -> Option<Self> {
        match ot {
            1 => Some(AacProfile::Main),
            2 => Some(AacProfile::Lc),
            3 => Some(AacProfile::Ssr),
            4 => Some(AacProfile::Ltp),
            5 => Some(AacProfile::Sbr),
            6 => Some(AacProfile::Scalable),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AacProfile::Main => "AAC Main",
            AacProfile::Lc => "AAC LC",
            AacProfile::Ssr => "AAC SSR",
            AacProfile::Ltp => "AAC LTP",
            AacProfile::Sbr => "HE-AAC",
            AacProfile::Scalable => "AAC Scalable",
        }
    }
}

/// Parsed AudioSpecificConfig
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub audio_object_type: u8,
    pub sampling_frequency_index: u8,
    /// Sampling frequency in Hz
    pub sampling_frequency: u32,
    /// 1 = mono, 2 = stereo, ...
    pub channel_configuration: u8,
    /// 960-sample frames when set, 1024 otherwise
    pub frame_length_flag: bool,
    pub depends_on_core_coder: bool,
    pub extension_flag: bool,
    /// Config bytes as carried on the wire
    pub raw: Bytes,
}

impl AudioSpecificConfig {
    const SAMPLING_FREQUENCIES: [u32; 16] = [
        96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050,
        16000, 12000, 11025, 8000, 7350, 0, 0, 0,
    ];

    /// Build the two-byte config for an encoder's output format
    pub fn new(profile: AacProfile, sample_rate: u32, channels: u8) -> Result<Self> {
        let sampling_frequency_index = Self::SAMPLING_FREQUENCIES
            .iter()
            .position(|&f| f == sample_rate && f != 0)
            .ok_or_else(|| {
                MediaError::UnsupportedCodec(format!("AAC sample rate {}", sample_rate))
            })? as u8;
        if channels == 0 || channels > 7 {
            return Err(MediaError::InvalidAacPacket.into());
        }

        let object_type = profile as u8;
        let raw = Bytes::copy_from_slice(&[
            (object_type << 3) | (sampling_frequency_index >> 1),
            ((sampling_frequency_index & 0x01) << 7) | (channels << 3),
        ]);

        Ok(Self {
            audio_object_type: object_type,
            sampling_frequency_index,
            sampling_frequency: sample_rate,
            channel_configuration: channels,
            frame_length_flag: false,
            depends_on_core_coder: false,
            extension_flag: false,
            raw,
        })
    }

    /// Parse from AAC sequence header data
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < 2 {
            return Err(MediaError::InvalidAacPacket.into());
        }

        let b0 = data[0];
        let b1 = data[1];

        let audio_object_type = (b0 >> 3) & 0x1F;
        let sampling_frequency_index = ((b0 & 0x07) << 1) | ((b1 >> 7) & 0x01);

        // An explicit 24-bit frequency shifts the remaining fields
        let (sampling_frequency, tail) = if sampling_frequency_index == 0x0F {
            if data.len() < 5 {
                return Err(MediaError::InvalidAacPacket.into());
            }
            let f0 = (data[1] & 0x7F) as u32;
            let f1 = data[2] as u32;
            let f2 = data[3] as u32;
            let f3 = (data[4] >> 7) as u32;
            ((f0 << 17) | (f1 << 9) | (f2 << 1) | f3, data[4] << 1)
        } else {
            match Self::SAMPLING_FREQUENCIES[sampling_frequency_index as usize] {
                0 => return Err(MediaError::InvalidAacPacket.into()),
                f => (f, b1 << 1),
            }
        };

        Ok(AudioSpecificConfig {
            audio_object_type,
            sampling_frequency_index,
            sampling_frequency,
            channel_configuration: (tail >> 4) & 0x0F,
            frame_length_flag: (tail & 0x08) != 0,
            depends_on_core_coder: (tail & 0x04) != 0,
            extension_flag: (tail & 0x02) != 0,
            raw: data,
        })
    }

    pub fn profile(&self) -> Option<AacProfile> {
        AacProfile::from_object_type(self.audio_object_type)
    }

    pub fn channels(&self) -> u8 {
        match self.channel_configuration {
            1..=6 => self.channel_configuration,
            7 => 8,
            _ => 0,
        }
    }

    pub fn samples_per_frame(&self) -> u32 {
        if self.frame_length_flag { 960 } else { 1024 }
    }

    /// Decoder configuration data; for AAC this is the config itself
    pub fn to_csd(&self) -> Bytes {
        self.raw.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_specific_config_parse() {
        // AAC-LC, 44100 Hz, Stereo
        let config = AudioSpecificConfig::parse(Bytes::from_static(&[0x12, 0x10])).unwrap();
        assert_eq!(config.audio_object_type, 2);
        assert_eq!(config.sampling_frequency_index, 4);
        assert_eq!(config.sampling_frequency, 44100);
        assert_eq!(config.channel_configuration, 2);
        assert_eq!(config.channels(), 2);
        assert_eq!(config.profile(), Some(AacProfile::Lc));
        assert_eq!(config.samples_per_frame(), 1024);
    }

    #[test]
    fn test_build_matches_parse() {
        let built = AudioSpecificConfig::new(AacProfile::Lc, 44100, 2).unwrap();
        assert_eq!(&built.raw[..], &[0x12, 0x10]);
        assert_eq!(AudioSpecificConfig::parse(built.to_csd()).unwrap(), built);

        let mono = AudioSpecificConfig::new(AacProfile::Lc, 48000, 1).unwrap();
        assert_eq!(&mono.raw[..], &[0x11, 0x88]);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(AudioSpecificConfig::parse(Bytes::from_static(&[0x12])).is_err());
        assert!(AudioSpecificConfig::new(AacProfile::Lc, 12345, 2).is_err());
        assert!(AudioSpecificConfig::new(AacProfile::Lc, 44100, 0).is_err());
    }
}
