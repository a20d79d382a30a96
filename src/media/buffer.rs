//! Timestamped audio/video samples exchanged between sources, codecs and outputs

use bytes::Bytes;

use crate::pool::{Pool, Reuse};

/// Kind of sample carried by a [`MediaBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MediaType {
    #[default]
    Audio,
    Video,
}

impl MediaType {
    pub fn is_audio(self) -> bool {
        self == MediaType::Audio
    }

    pub fn is_video(self) -> bool {
        self == MediaType::Video
    }
}

/// A single encoded or decoded sample
///
/// Ownership moves with the value: whoever receives a buffer consumes it
/// once and hands it back to its pool (or drops it).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaBuffer {
    pub media_type: MediaType,
    /// Track or coder slot the sample belongs to
    pub index: usize,
    pub payload: Option<Bytes>,
    /// Presentation time in microseconds
    pub timestamp_us: i64,
    /// Key frame for video; always true for audio configuration data
    pub sync: bool,
}

impl MediaBuffer {
    pub fn audio(payload: impl Into<Bytes>, timestamp_us: i64) -> Self {
        Self {
            media_type: MediaType::Audio,
            index: 0,
            payload: Some(payload.into()),
            timestamp_us,
            sync: false,
        }
    }

    pub fn video(payload: impl Into<Bytes>, timestamp_us: i64, sync: bool) -> Self {
        Self {
            media_type: MediaType::Video,
            index: 0,
            payload: Some(payload.into()),
            timestamp_us,
            sync,
        }
    }

    /// Fill a pooled buffer in place
    pub fn set(
        &mut self,
        media_type: MediaType,
        index: usize,
        payload: Bytes,
        timestamp_us: i64,
        sync: bool,
    ) {
        self.media_type = media_type;
        self.index = index;
        self.payload = Some(payload);
        self.timestamp_us = timestamp_us;
        self.sync = sync;
    }

    pub fn len(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp in whole milliseconds
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_us / 1000
    }
}

impl Reuse for MediaBuffer {
    fn reuse(&mut self) -> bool {
        *self = MediaBuffer::default();
        true
    }
}

/// Separate free lists for audio and video samples
#[derive(Debug)]
pub struct BufferPools {
    audio: Pool<MediaBuffer>,
    video: Pool<MediaBuffer>,
}

impl BufferPools {
    pub fn new(capacity: usize) -> Self {
        Self {
            audio: Pool::new(capacity),
            video: Pool::new(capacity),
        }
    }

    pub fn acquire(&self, media_type: MediaType) -> MediaBuffer {
        let mut buffer = self.pool(media_type).acquire();
        buffer.media_type = media_type;
        buffer
    }

    pub fn release(&self, buffer: MediaBuffer) {
        self.pool(buffer.media_type).release(buffer);
    }

    pub fn pool(&self, media_type: MediaType) -> &Pool<MediaBuffer> {
        match media_type {
            MediaType::Audio => &self.audio,
            MediaType::Video => &self.video,
        }
    }
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooled_buffer_is_cleared() {
        let pools = BufferPools::new(2);
        let mut buffer = pools.acquire(MediaType::Video);
        buffer.set(MediaType::Video, 1, Bytes::from_static(b"frame"), 33_000, true);
        assert_eq!(buffer.timestamp_ms(), 33);
        pools.release(buffer);

        assert_eq!(pools.pool(MediaType::Video).available(), 1);
        let reused = pools.acquire(MediaType::Video);
        assert!(reused.payload.is_none());
        assert!(!reused.sync);
        assert_eq!(reused.media_type, MediaType::Video);
        assert_eq!(pools.pool(MediaType::Audio).available(), 0);
    }

    #[test]
    fn test_len() {
        assert_eq!(MediaBuffer::audio(vec![1u8, 2, 3], 0).len(), 3);
        assert!(MediaBuffer::default().is_empty());
    }
}
