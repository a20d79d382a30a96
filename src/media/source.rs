//! Capture sources attached to a [`MediaMixer`](super::mixer::MediaMixer)

use async_trait::async_trait;

use crate::error::Result;

use super::buffer::MediaBuffer;
use super::mixer::MediaMixer;

/// A capture device or generator
#[async_trait]
pub trait Source: Send + Sync {
    /// Start capturing; the mixer is where video frames are pushed
    async fn open(&self, mixer: &MediaMixer) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Source polled by the mixer's audio loop
#[async_trait]
pub trait AudioSource: Source {
    /// Read the next captured buffer for `track`
    ///
    /// `Ok(None)` means nothing is available yet.
    async fn read(&self, track: u8) -> Result<Option<MediaBuffer>>;

    fn is_muted(&self) -> bool {
        false
    }
}

/// Source that pushes frames through [`MediaMixer::append_video`]
pub trait VideoSource: Source {
    /// Frame size in pixels
    fn video_size(&self) -> (u32, u32);
}
