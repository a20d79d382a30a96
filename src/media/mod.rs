//! Media handling
//!
//! This module provides:
//! - `MediaBuffer` samples and their pools
//! - FLV tag packaging for AAC, AVC and Enhanced RTMP HEVC
//! - AVC/HEVC decoder configuration records and AAC AudioSpecificConfig
//! - `MediaLink`, the playback synchronization engine
//! - `MediaMixer`, the capture fan-out

pub mod aac;
pub mod buffer;
pub mod flv;
pub mod h264;
pub mod hevc;
pub mod link;
pub mod mixer;
pub mod source;

pub use aac::{AacProfile, AudioSpecificConfig};
pub use buffer::{BufferPools, MediaBuffer, MediaType};
pub use flv::{AudioPacket, FlvTag, FlvTagType, VideoCodec, VideoPacket};
pub use h264::{AvcConfig, NaluType};
pub use hevc::HevcConfig;
pub use link::{AudioSink, LinkTarget, MediaLink, MediaLinkConfig, SinkState, SyncMode};
pub use mixer::{MediaMixer, MediaOutput, MediaOutputDataSource, MixerConfig, VideoEffect};
pub use source::{AudioSource, Source, VideoSource};
