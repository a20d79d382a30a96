//! Traffic counters for connections and streams
//!
//! Counters are atomics so the socket tasks, codec callbacks and the
//! 1 Hz tick can update them without locking. `snapshot()` returns plain
//! values for reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Connection-level counters
#[derive(Debug)]
pub struct ConnectionStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    started_at: Instant,
}

/// Point-in-time copy of [`ConnectionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    /// Total bytes received
    pub total_bytes_in: u64,
    /// Total bytes sent
    pub total_bytes_out: u64,
    /// Time since the counters were created or reset
    pub duration: Duration,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Add received bytes, returning the new total
    pub fn add_bytes_in(&self, n: usize) -> u64 {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed) + n as u64
    }

    pub fn add_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn total_bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn total_bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            total_bytes_in: self.total_bytes_in(),
            total_bytes_out: self.total_bytes_out(),
            duration: self.started_at.elapsed(),
        }
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level counters
#[derive(Debug, Default)]
pub struct StreamStats {
    audio_messages: AtomicU64,
    video_messages: AtomicU64,
    audio_bytes: AtomicU64,
    video_bytes: AtomicU64,
    keyframes: AtomicU64,
    dropped_frames: AtomicU64,
    /// Video messages seen at the previous tick
    last_tick_frames: AtomicU64,
    /// Frames per second measured over the last tick
    current_fps: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatsSnapshot {
    pub audio_messages: u64,
    pub video_messages: u64,
    pub audio_bytes: u64,
    pub video_bytes: u64,
    pub keyframes: u64,
    pub dropped_frames: u64,
    pub current_fps: u64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_audio(&self, bytes: usize) {
        self.audio_messages.fetch_add(1, Ordering::Relaxed);
        self.audio_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_video(&self, bytes: usize, keyframe: bool) {
        self.video_messages.fetch_add(1, Ordering::Relaxed);
        self.video_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if keyframe {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dropped(&self, frames: u64) {
        self.dropped_frames.fetch_add(frames, Ordering::Relaxed);
    }

    /// Roll the frame-rate window; called once per tick
    pub fn on_tick(&self) {
        let frames = self.video_messages.load(Ordering::Relaxed);
        let previous = self.last_tick_frames.swap(frames, Ordering::Relaxed);
        self.current_fps
            .store(frames.saturating_sub(previous), Ordering::Relaxed);
    }

    pub fn current_fps(&self) -> u64 {
        self.current_fps.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for counter in [
            &self.audio_messages,
            &self.video_messages,
            &self.audio_bytes,
            &self.video_bytes,
            &self.keyframes,
            &self.dropped_frames,
            &self.last_tick_frames,
            &self.current_fps,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            audio_messages: self.audio_messages.load(Ordering::Relaxed),
            video_messages: self.video_messages.load(Ordering::Relaxed),
            audio_bytes: self.audio_bytes.load(Ordering::Relaxed),
            video_bytes: self.video_bytes.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            current_fps: self.current_fps(),
        }
    }
}
