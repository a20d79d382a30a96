//! Timed delivery of decoded audio/video for playback
//!
//! [`MediaLink`] holds an audio and a video queue. Video is delivered once
//! per display refresh ([`MediaLink::do_frame`]) against one of two clocks:
//!
//! - audio sync: the audio sink's playback head, when a sink is attached
//! - clock sync: the refresh timestamps themselves
//!
//! Nothing is delivered until a key frame is due. When several buffers are
//! due in one refresh only the first is rendered; the rest are released
//! without rendering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::Result;
use crate::media::buffer::MediaBuffer;

/// Playback state of an [`AudioSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Stopped,
    Playing,
    Paused,
}

/// PCM output device
pub trait AudioSink: Send {
    fn play(&mut self);

    fn pause(&mut self);

    /// Stop playback and drop anything buffered
    fn stop(&mut self);

    fn state(&self) -> SinkState;

    /// Frames played since the last start
    fn playback_head_position(&self) -> u64;

    fn sample_rate(&self) -> u32;

    /// Non-blocking write; returns the number of bytes accepted
    fn write(&mut self, data: &[u8]) -> Result<usize>;
}

/// Owner of the buffers a [`MediaLink`] delivers
pub trait LinkTarget: Send + Sync {
    /// Whether a video track is present; audio starts eagerly without one
    fn has_video(&self) -> bool;

    /// Take back a buffer, rendering it first when `render` is set
    fn release_output_buffer(&self, buffer: MediaBuffer, render: bool);
}

/// Which clock paces video delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Audio,
    Clock,
}

#[derive(Debug, Clone)]
pub struct MediaLinkConfig {
    pub video_queue_capacity: usize,
    pub audio_queue_capacity: usize,
    /// Drive `do_frame` internally at this interval once video arrives;
    /// `None` leaves it to the caller
    pub frame_interval: Option<Duration>,
}

impl Default for MediaLinkConfig {
    fn default() -> Self {
        Self {
            video_queue_capacity: 256,
            audio_queue_capacity: 256,
            frame_interval: Some(Duration::from_micros(16_667)),
        }
    }
}

#[derive(Default)]
struct VideoState {
    queue: VecDeque<MediaBuffer>,
    has_keyframe: bool,
    /// Timestamp of the first queued video buffer
    zero: Option<i64>,
    clock_base: Option<u64>,
    clock_duration: i64,
}

struct LinkShared {
    config: MediaLinkConfig,
    target: Weak<dyn LinkTarget>,
    running: AtomicBool,
    keep_alive: AtomicBool,
    video: Mutex<VideoState>,
    audio: Mutex<VecDeque<MediaBuffer>>,
    audio_ready: Notify,
    sink: Mutex<Option<Box<dyn AudioSink>>>,
    audio_zero: AtomicI64,
    driver_started: AtomicBool,
}

/// Synchronizes playback of decoded audio and video
pub struct MediaLink {
    shared: Arc<LinkShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaLink {
    pub fn new(target: Weak<dyn LinkTarget>, config: MediaLinkConfig) -> Self {
        Self {
            shared: Arc::new(LinkShared {
                config,
                target,
                running: AtomicBool::new(false),
                keep_alive: AtomicBool::new(false),
                video: Mutex::new(VideoState::default()),
                audio: Mutex::new(VecDeque::new()),
                audio_ready: Notify::new(),
                sink: Mutex::new(None),
                audio_zero: AtomicI64::new(0),
                driver_started: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn sync_mode(&self) -> SyncMode {
        if self.shared.sink.lock().is_some() {
            SyncMode::Audio
        } else {
            SyncMode::Clock
        }
    }

    /// Attach or detach the audio sink; a replaced sink is stopped
    pub fn set_audio_sink(&self, sink: Option<Box<dyn AudioSink>>) {
        let previous = std::mem::replace(&mut *self.shared.sink.lock(), sink);
        if let Some(mut previous) = previous {
            previous.stop();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared
            .sink
            .lock()
            .as_ref()
            .map(|sink| sink.state() == SinkState::Paused)
            .unwrap_or(false)
    }

    /// Pause or resume the audio sink; without one this does nothing
    pub fn set_paused(&self, paused: bool) {
        let mut sink = self.shared.sink.lock();
        let Some(sink) = sink.as_mut() else {
            return;
        };
        match sink.state() {
            SinkState::Stopped => {}
            SinkState::Playing if paused => sink.pause(),
            SinkState::Paused if !paused => sink.play(),
            _ => {}
        }
    }

    pub fn start_running(&self) {
        let mut tasks = self.tasks.lock();
        if self.is_running() {
            return;
        }
        tracing::debug!("MediaLink start");
        let shared = &self.shared;
        shared.keep_alive.store(true, Ordering::Release);

        let stale_audio: Vec<_> = shared.audio.lock().drain(..).collect();
        shared.audio_zero.store(0, Ordering::Release);

        let stale_video: Vec<_> = {
            let mut video = shared.video.lock();
            let stale = video.queue.drain(..).collect();
            *video = VideoState::default();
            stale
        };
        shared.release_all(stale_audio.into_iter().chain(stale_video));

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => tasks.push(handle.spawn(audio_loop(self.shared.clone()))),
            Err(_) => tracing::warn!("MediaLink started outside a runtime, audio disabled"),
        }

        shared.running.store(true, Ordering::Release);
    }

    pub fn stop_running(&self) {
        let mut tasks = self.tasks.lock();
        if !self.is_running() {
            return;
        }
        tracing::debug!("MediaLink stop");
        self.shared.keep_alive.store(false, Ordering::Release);
        self.shared.audio_ready.notify_one();
        for task in tasks.drain(..) {
            task.abort();
        }
        self.shared.driver_started.store(false, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
    }

    /// Queue decoded audio for playback
    pub fn queue_audio(&self, buffer: MediaBuffer) {
        let shared = &self.shared;
        if !self.is_running() {
            shared.release_all([buffer]);
            return;
        }
        let overflow = {
            let mut audio = shared.audio.lock();
            audio.push_back(buffer);
            if audio.len() > shared.config.audio_queue_capacity {
                audio.pop_front()
            } else {
                None
            }
        };
        shared.release_all(overflow);
        shared.audio_ready.notify_one();

        let has_video = shared.target.upgrade().map(|t| t.has_video()).unwrap_or(false);
        if !has_video {
            if let Some(sink) = shared.sink.lock().as_mut() {
                if sink.playback_head_position() == 0 && sink.state() != SinkState::Playing {
                    sink.play();
                }
            }
        }
    }

    /// Queue decoded video for timed delivery
    pub fn queue_video(&self, buffer: MediaBuffer) {
        let shared = &self.shared;
        if !self.is_running() {
            shared.release_all([buffer]);
            return;
        }
        let overflow = {
            let mut video = shared.video.lock();
            if video.zero.is_none() {
                video.zero = Some(buffer.timestamp_us);
            }
            video.queue.push_back(buffer);
            if video.queue.len() > shared.config.video_queue_capacity {
                video.queue.pop_front()
            } else {
                None
            }
        };
        shared.release_all(overflow);

        if let Some(interval) = shared.config.frame_interval {
            if !shared.driver_started.swap(true, Ordering::AcqRel) {
                self.spawn_driver(interval);
            }
        }
    }

    /// Display refresh callback; `frame_nanos` is a monotonic timestamp
    pub fn do_frame(&self, frame_nanos: u64) {
        self.shared.do_frame(frame_nanos);
    }

    fn spawn_driver(&self, interval: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime for the frame driver");
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        let task = handle.spawn(async move {
            let start = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if !shared.keep_alive.load(Ordering::Acquire) {
                    break;
                }
                shared.do_frame(start.elapsed().as_nanos() as u64);
            }
        });
        self.tasks.lock().push(task);
    }
}

impl Drop for MediaLink {
    fn drop(&mut self) {
        self.shared.keep_alive.store(false, Ordering::Release);
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl LinkShared {
    fn release_all(&self, buffers: impl IntoIterator<Item = MediaBuffer>) {
        let target = self.target.upgrade();
        for buffer in buffers {
            if let Some(target) = &target {
                target.release_output_buffer(buffer, false);
            }
        }
    }

    fn do_frame(&self, frame_nanos: u64) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        let duration = {
            let mut sink = self.sink.lock();
            match sink.as_mut() {
                Some(sink) => {
                    let head = sink.playback_head_position();
                    if head == 0 {
                        if sink.state() != SinkState::Playing {
                            sink.play();
                            let zero = self.video.lock().clock_duration;
                            self.audio_zero.store(zero, Ordering::Release);
                        }
                        return;
                    }
                    let rate = sink.sample_rate().max(1) as u64;
                    (head * 1_000_000 / rate) as i64 + self.audio_zero.load(Ordering::Acquire)
                }
                None => {
                    let mut video = self.video.lock();
                    let base = *video.clock_base.get_or_insert(frame_nanos);
                    video.clock_duration = (frame_nanos.saturating_sub(base) / 1000) as i64;
                    video.clock_duration
                }
            }
        };

        let mut released = Vec::new();
        {
            let mut video = self.video.lock();
            let Some(zero) = video.zero else {
                return;
            };

            if !video.has_keyframe {
                let due_key = video
                    .queue
                    .iter()
                    .position(|b| b.sync)
                    .filter(|&k| video.queue[k].timestamp_us - zero <= duration);
                let Some(k) = due_key else {
                    return;
                };
                video.has_keyframe = true;
                released.extend(video.queue.drain(..k).map(|b| (b, false)));
            }

            let mut rendered = false;
            while video
                .queue
                .front()
                .is_some_and(|b| b.timestamp_us - zero <= duration)
            {
                if let Some(buffer) = video.queue.pop_front() {
                    released.push((buffer, !rendered));
                    rendered = true;
                }
            }
        }

        if released.len() > 2 {
            tracing::trace!(dropped = released.len() - 1, "Video catch-up");
        }
        if let Some(target) = self.target.upgrade() {
            for (buffer, render) in released {
                target.release_output_buffer(buffer, render);
            }
        }
    }
}

async fn audio_loop(shared: Arc<LinkShared>) {
    while shared.keep_alive.load(Ordering::Acquire) {
        let next = shared.audio.lock().pop_front();
        let Some(buffer) = next else {
            shared.audio_ready.notified().await;
            continue;
        };

        if let Some(payload) = buffer.payload.clone() {
            let mut offset = 0;
            while offset < payload.len() && shared.keep_alive.load(Ordering::Acquire) {
                let written = {
                    let mut sink = shared.sink.lock();
                    let Some(sink) = sink.as_mut() else {
                        break;
                    };
                    match sink.write(&payload[offset..]) {
                        Ok(n) => n,
                        Err(e) => {
                            tracing::warn!(error = %e, "Audio sink write failed");
                            break;
                        }
                    }
                };
                offset += written;
                if written == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }
        shared.release_all([buffer]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const MS: u64 = 1_000_000;

    #[derive(Default)]
    struct Target {
        has_video: bool,
        released: Mutex<Vec<(i64, bool)>>,
    }

    impl Target {
        fn rendered(&self) -> Vec<i64> {
            self.released
                .lock()
                .iter()
                .filter(|(_, render)| *render)
                .map(|(ts, _)| *ts)
                .collect()
        }
    }

    impl LinkTarget for Target {
        fn has_video(&self) -> bool {
            self.has_video
        }

        fn release_output_buffer(&self, buffer: MediaBuffer, render: bool) {
            self.released.lock().push((buffer.timestamp_us, render));
        }
    }

    #[derive(Clone, Default)]
    struct FakeSink(Arc<Mutex<SinkInner>>);

    #[derive(Default)]
    struct SinkInner {
        state: Option<SinkState>,
        head: u64,
        written: Vec<u8>,
        max_write: usize,
    }

    impl AudioSink for FakeSink {
        fn play(&mut self) {
            self.0.lock().state = Some(SinkState::Playing);
        }

        fn pause(&mut self) {
            self.0.lock().state = Some(SinkState::Paused);
        }

        fn stop(&mut self) {
            self.0.lock().state = Some(SinkState::Stopped);
        }

        fn state(&self) -> SinkState {
            self.0.lock().state.unwrap_or(SinkState::Stopped)
        }

        fn playback_head_position(&self) -> u64 {
            self.0.lock().head
        }

        fn sample_rate(&self) -> u32 {
            44100
        }

        fn write(&mut self, data: &[u8]) -> Result<usize> {
            let mut inner = self.0.lock();
            let n = data.len().min(inner.max_write.max(1));
            inner.written.extend_from_slice(&data[..n]);
            Ok(n)
        }
    }

    fn link(target: &Arc<Target>) -> MediaLink {
        let weak: Weak<dyn LinkTarget> = Arc::downgrade(target) as Weak<dyn LinkTarget>;
        MediaLink::new(
            weak,
            MediaLinkConfig {
                frame_interval: None,
                ..Default::default()
            },
        )
    }

    fn video(ts_ms: i64, sync: bool) -> MediaBuffer {
        MediaBuffer::video(Bytes::from_static(b"v"), ts_ms * 1000, sync)
    }

    #[tokio::test]
    async fn test_keyframe_gate_holds_until_key_is_due() {
        let target = Arc::new(Target::default());
        let link = link(&target);
        link.start_running();

        link.queue_video(video(0, false));
        link.queue_video(video(33, false));
        link.queue_video(video(66, true));
        link.queue_video(video(100, false));

        link.do_frame(1_000 * MS);
        link.do_frame(1_010 * MS);
        link.do_frame(1_050 * MS);
        assert!(target.released.lock().is_empty());

        // clock passes t2 and t3 in one refresh
        link.do_frame(1_120 * MS);
        assert_eq!(target.rendered(), vec![66_000]);
        assert_eq!(
            *target.released.lock(),
            vec![(0, false), (33_000, false), (66_000, true), (100_000, false)]
        );
    }

    #[tokio::test]
    async fn test_one_render_per_refresh_after_gate() {
        let target = Arc::new(Target::default());
        let link = link(&target);
        link.start_running();

        for i in 0..4 {
            link.queue_video(video(i * 33, i == 0));
        }
        link.do_frame(0);
        link.do_frame(34 * MS);
        link.do_frame(67 * MS);
        assert_eq!(target.rendered(), vec![0, 33_000, 66_000]);
        // not yet due
        assert_eq!(target.released.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_audio_clock_waits_for_playback_head() {
        let target = Arc::new(Target {
            has_video: true,
            ..Default::default()
        });
        let link = link(&target);
        let sink = FakeSink::default();
        link.set_audio_sink(Some(Box::new(sink.clone())));
        assert_eq!(link.sync_mode(), SyncMode::Audio);
        link.start_running();

        link.queue_video(video(0, true));
        link.queue_video(video(500, false));

        link.do_frame(0);
        assert_eq!(sink.state(), SinkState::Playing);
        assert!(target.released.lock().is_empty());

        // one second of audio played
        sink.0.lock().head = 44100;
        link.do_frame(16 * MS);
        assert_eq!(target.rendered(), vec![0]);
        assert_eq!(target.released.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_pause_maps_onto_sink() {
        let target = Arc::new(Target::default());
        let link = link(&target);
        link.set_paused(true);
        assert!(!link.is_paused());

        let sink = FakeSink::default();
        link.set_audio_sink(Some(Box::new(sink.clone())));
        link.set_paused(true);
        assert_eq!(sink.state(), SinkState::Stopped);

        sink.0.lock().state = Some(SinkState::Playing);
        link.set_paused(true);
        assert!(link.is_paused());
        link.set_paused(false);
        assert_eq!(sink.state(), SinkState::Playing);
    }

    #[tokio::test]
    async fn test_audio_written_in_partial_chunks() {
        let target = Arc::new(Target::default());
        let link = link(&target);
        let sink = FakeSink::default();
        sink.0.lock().max_write = 3;
        link.set_audio_sink(Some(Box::new(sink.clone())));
        link.start_running();

        link.queue_audio(MediaBuffer::audio(Bytes::from_static(b"0123456789"), 0));
        // no video track, so playback starts with the first buffer
        assert_eq!(sink.state(), SinkState::Playing);

        for _ in 0..100 {
            if !target.released.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sink.0.lock().written, b"0123456789");
        assert_eq!(*target.released.lock(), vec![(0, false)]);
        link.stop_running();
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let target = Arc::new(Target::default());
        let link = link(&target);

        link.queue_video(video(0, true));
        assert_eq!(*target.released.lock(), vec![(0, false)]);

        link.start_running();
        link.start_running();
        assert!(link.is_running());
        link.stop_running();
        link.stop_running();
        assert!(!link.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_internal_frame_driver() {
        let target = Arc::new(Target::default());
        let weak: Weak<dyn LinkTarget> = Arc::downgrade(&target) as Weak<dyn LinkTarget>;
        let link = MediaLink::new(
            weak,
            MediaLinkConfig {
                frame_interval: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        );
        link.start_running();
        link.queue_video(video(0, true));
        link.queue_video(video(15, false));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(target.rendered(), vec![0, 15_000]);
        link.stop_running();
    }
}
