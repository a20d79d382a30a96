//! Fan-out of captured audio/video to registered outputs
//!
//! The mixer owns keyed audio and video sources. Audio sources are polled
//! by a loop that sends every buffer to each registered [`MediaOutput`];
//! video sources push frames through [`MediaMixer::append_video`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::Result;

use super::buffer::MediaBuffer;
use super::source::{AudioSource, VideoSource};

/// Consumer of mixed buffers (an RTMP stream, a recorder, a preview)
pub trait MediaOutput: Send + Sync {
    fn append(&self, buffer: MediaBuffer);

    /// Called with the owning data source on register, `None` on unregister
    fn set_data_source(&self, _source: Option<Weak<dyn MediaOutputDataSource>>) {}
}

/// Something outputs can be attached to
pub trait MediaOutputDataSource: Send + Sync {
    fn has_audio(&self) -> bool;

    fn has_video(&self) -> bool;

    fn register_output(&self, output: Arc<dyn MediaOutput>);

    fn unregister_output(&self, output: &Arc<dyn MediaOutput>);
}

/// Per-track transform applied to video frames before fan-out
pub trait VideoEffect: Send + Sync {
    fn apply(&self, buffer: MediaBuffer) -> MediaBuffer;
}

#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Sleep between polls when no audio source produced data
    pub audio_poll_interval: Duration,
    /// Replace captured audio with silence
    pub muted: bool,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            audio_poll_interval: Duration::from_millis(10),
            muted: false,
        }
    }
}

impl MixerConfig {
    pub fn audio_poll_interval(mut self, interval: Duration) -> Self {
        self.audio_poll_interval = interval;
        self
    }

    pub fn muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }
}

struct VideoTrack {
    source: Arc<dyn VideoSource>,
    effect: Option<Arc<dyn VideoEffect>>,
}

struct MixerInner {
    config: MixerConfig,
    self_ref: Weak<MixerInner>,
    audio_sources: Mutex<BTreeMap<u8, Arc<dyn AudioSource>>>,
    video_sources: Mutex<BTreeMap<u8, VideoTrack>>,
    outputs: Mutex<Vec<Arc<dyn MediaOutput>>>,
    muted: AtomicBool,
    running: AtomicBool,
    audio_task: Mutex<Option<JoinHandle<()>>>,
}

/// Mixes sources for streaming
#[derive(Clone)]
pub struct MediaMixer {
    inner: Arc<MixerInner>,
}

pub(crate) fn same_output(a: &Arc<dyn MediaOutput>, b: &Arc<dyn MediaOutput>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl MediaMixer {
    pub fn new(config: MixerConfig) -> Self {
        let muted = config.muted;
        Self {
            inner: Arc::new_cyclic(|self_ref| MixerInner {
                config,
                self_ref: self_ref.clone(),
                audio_sources: Mutex::new(BTreeMap::new()),
                video_sources: Mutex::new(BTreeMap::new()),
                outputs: Mutex::new(Vec::new()),
                muted: AtomicBool::new(muted),
                running: AtomicBool::new(false),
                audio_task: Mutex::new(None),
            }),
        }
    }

    pub fn has_audio(&self) -> bool {
        self.inner.has_audio()
    }

    pub fn has_video(&self) -> bool {
        self.inner.has_video()
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Relaxed);
    }

    /// Attach an audio source to `track`, or close and remove it with `None`
    pub async fn attach_audio(
        &self,
        track: u8,
        source: Option<Arc<dyn AudioSource>>,
    ) -> Result<()> {
        match source {
            Some(source) => {
                let previous = self.inner.audio_sources.lock().insert(track, source.clone());
                if let Some(previous) = previous {
                    close_quietly(previous.close().await, track);
                }
                source.open(self).await
            }
            None => {
                let removed = self.inner.audio_sources.lock().remove(&track);
                if let Some(removed) = removed {
                    removed.close().await?;
                }
                Ok(())
            }
        }
    }

    /// Attach a video source to `track`, or close and remove it with `None`
    pub async fn attach_video(
        &self,
        track: u8,
        source: Option<Arc<dyn VideoSource>>,
    ) -> Result<()> {
        match source {
            Some(source) => {
                let previous = self.inner.video_sources.lock().insert(
                    track,
                    VideoTrack {
                        source: source.clone(),
                        effect: None,
                    },
                );
                if let Some(previous) = previous {
                    close_quietly(previous.source.close().await, track);
                }
                source.open(self).await
            }
            None => {
                let removed = self.inner.video_sources.lock().remove(&track);
                if let Some(removed) = removed {
                    removed.source.close().await?;
                }
                Ok(())
            }
        }
    }

    /// Set the effect for the video source on `track`
    pub fn set_video_effect(&self, track: u8, effect: Option<Arc<dyn VideoEffect>>) {
        if let Some(video) = self.inner.video_sources.lock().get_mut(&track) {
            video.effect = effect;
        }
    }

    /// Push a captured video frame from the source on `track`
    pub fn append_video(&self, track: u8, mut buffer: MediaBuffer) {
        let effect = self
            .inner
            .video_sources
            .lock()
            .get(&track)
            .and_then(|video| video.effect.clone());
        buffer.index = track as usize;
        if let Some(effect) = effect {
            buffer = effect.apply(buffer);
        }
        self.inner.fan_out(buffer);
    }

    pub fn register_output(&self, output: Arc<dyn MediaOutput>) {
        self.inner.register_output(output);
    }

    pub fn unregister_output(&self, output: &Arc<dyn MediaOutput>) {
        self.inner.unregister_output(output);
    }

    pub fn output_count(&self) -> usize {
        self.inner.outputs.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Start the audio fan-out loop
    pub fn start_running(&self) {
        let mut task = self.inner.audio_task.lock();
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => *task = Some(handle.spawn(audio_loop(Arc::downgrade(&self.inner)))),
            Err(_) => tracing::warn!("MediaMixer started outside a runtime, audio disabled"),
        }
    }

    pub fn stop_running(&self) {
        let mut task = self.inner.audio_task.lock();
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = task.take() {
            task.abort();
        }
    }

    /// Stop, close every source and drop every output
    pub async fn dispose(&self) {
        self.stop_running();
        let audio: Vec<_> = std::mem::take(&mut *self.inner.audio_sources.lock())
            .into_iter()
            .collect();
        let video: Vec<_> = std::mem::take(&mut *self.inner.video_sources.lock())
            .into_iter()
            .collect();
        for (track, source) in audio {
            close_quietly(source.close().await, track);
        }
        for (track, video) in video {
            close_quietly(video.source.close().await, track);
        }
        let outputs = std::mem::take(&mut *self.inner.outputs.lock());
        for output in outputs {
            output.set_data_source(None);
        }
    }
}

impl Default for MediaMixer {
    fn default() -> Self {
        Self::new(MixerConfig::default())
    }
}

impl std::fmt::Debug for MediaMixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaMixer")
            .field("audio_tracks", &self.inner.audio_sources.lock().len())
            .field("video_tracks", &self.inner.video_sources.lock().len())
            .field("outputs", &self.output_count())
            .finish()
    }
}

fn close_quietly(result: Result<()>, track: u8) {
    if let Err(e) = result {
        tracing::warn!(track, error = %e, "Failed to close source");
    }
}

impl MixerInner {
    fn fan_out(&self, buffer: MediaBuffer) {
        let outputs = self.outputs.lock().clone();
        let Some((last, rest)) = outputs.split_last() else {
            return;
        };
        for output in rest {
            output.append(buffer.clone());
        }
        last.append(buffer);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }
}

impl MediaOutputDataSource for MixerInner {
    fn has_audio(&self) -> bool {
        !self.audio_sources.lock().is_empty()
    }

    fn has_video(&self) -> bool {
        !self.video_sources.lock().is_empty()
    }

    fn register_output(&self, output: Arc<dyn MediaOutput>) {
        {
            let mut outputs = self.outputs.lock();
            if outputs.iter().any(|o| same_output(o, &output)) {
                return;
            }
            outputs.push(output.clone());
        }
        let source: Weak<dyn MediaOutputDataSource> = self.self_ref.clone();
        output.set_data_source(Some(source));
    }

    fn unregister_output(&self, output: &Arc<dyn MediaOutput>) {
        let removed = {
            let mut outputs = self.outputs.lock();
            let before = outputs.len();
            outputs.retain(|o| !same_output(o, output));
            outputs.len() != before
        };
        if removed {
            output.set_data_source(None);
        }
    }
}

async fn audio_loop(inner: Weak<MixerInner>) {
    loop {
        let Some(mixer) = inner.upgrade() else {
            break;
        };
        if !mixer.running.load(Ordering::Acquire) {
            break;
        }
        let sources: Vec<_> = mixer
            .audio_sources
            .lock()
            .iter()
            .map(|(track, source)| (*track, source.clone()))
            .collect();

        let mut produced = false;
        for (track, source) in sources {
            match source.read(track).await {
                Ok(Some(mut buffer)) => {
                    produced = true;
                    buffer.index = track as usize;
                    if mixer.is_muted() || source.is_muted() {
                        let len = buffer.len();
                        buffer.payload = Some(Bytes::from(vec![0u8; len]));
                    }
                    mixer.fan_out(buffer);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(track, error = %e, "Audio source read failed"),
            }
        }

        let interval = mixer.config.audio_poll_interval;
        drop(mixer);
        if produced {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    use crate::media::source::Source;

    #[derive(Default)]
    struct Collector {
        buffers: Mutex<Vec<MediaBuffer>>,
        attached: AtomicBool,
    }

    impl MediaOutput for Collector {
        fn append(&self, buffer: MediaBuffer) {
            self.buffers.lock().push(buffer);
        }

        fn set_data_source(&self, source: Option<Weak<dyn MediaOutputDataSource>>) {
            self.attached.store(source.is_some(), Ordering::SeqCst);
        }
    }

    struct ToneSource {
        pending: Mutex<VecDeque<MediaBuffer>>,
        open: AtomicBool,
        muted: bool,
    }

    impl ToneSource {
        fn new(count: usize, muted: bool) -> Arc<Self> {
            let pending = (0..count)
                .map(|i| MediaBuffer::audio(vec![1u8; 4], i as i64 * 23_000))
                .collect();
            Arc::new(Self {
                pending: Mutex::new(pending),
                open: AtomicBool::new(false),
                muted,
            })
        }
    }

    #[async_trait]
    impl Source for ToneSource {
        async fn open(&self, _mixer: &MediaMixer) -> Result<()> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AudioSource for ToneSource {
        async fn read(&self, _track: u8) -> Result<Option<MediaBuffer>> {
            Ok(self.pending.lock().pop_front())
        }

        fn is_muted(&self) -> bool {
            self.muted
        }
    }

    struct Camera;

    #[async_trait]
    impl Source for Camera {
        async fn open(&self, _mixer: &MediaMixer) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn is_running(&self) -> bool {
            true
        }
    }

    impl VideoSource for Camera {
        fn video_size(&self) -> (u32, u32) {
            (1280, 720)
        }
    }

    struct Invert;

    impl VideoEffect for Invert {
        fn apply(&self, mut buffer: MediaBuffer) -> MediaBuffer {
            let inverted: Vec<u8> =
                buffer.payload.iter().flat_map(|p| p.iter().map(|b| !b)).collect();
            buffer.payload = Some(Bytes::from(inverted));
            buffer
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_fan_out() {
        let mixer = MediaMixer::default();
        let first = Arc::new(Collector::default());
        let second = Arc::new(Collector::default());
        mixer.register_output(first.clone());
        mixer.register_output(second.clone());
        mixer.register_output(first.clone());
        assert_eq!(mixer.output_count(), 2);
        assert!(first.attached.load(Ordering::SeqCst));

        let source = ToneSource::new(3, false);
        mixer.attach_audio(1, Some(source.clone())).await.unwrap();
        assert!(mixer.has_audio());
        assert!(source.is_running());

        mixer.start_running();
        mixer.start_running();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(first.buffers.lock().len(), 3);
        assert_eq!(second.buffers.lock().len(), 3);
        assert_eq!(first.buffers.lock()[2].timestamp_us, 46_000);
        assert_eq!(first.buffers.lock()[0].index, 1);

        mixer.attach_audio(1, None).await.unwrap();
        assert!(!source.is_running());
        assert!(!mixer.has_audio());
        mixer.stop_running();
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_audio_is_silent() {
        let mixer = MediaMixer::new(MixerConfig::default());
        let output = Arc::new(Collector::default());
        mixer.register_output(output.clone());
        mixer.attach_audio(0, Some(ToneSource::new(1, true))).await.unwrap();
        mixer.start_running();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let buffers = output.buffers.lock();
        assert_eq!(buffers[0].payload.as_deref(), Some(&[0u8; 4][..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_idles_without_sources() {
        let mixer = MediaMixer::default();
        mixer.start_running();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mixer.is_running());
        mixer.stop_running();
        assert!(!mixer.is_running());
    }

    #[tokio::test]
    async fn test_video_effect_and_unregister() {
        let mixer = MediaMixer::default();
        let output = Arc::new(Collector::default());
        let handle: Arc<dyn MediaOutput> = output.clone();
        mixer.register_output(handle.clone());
        mixer.attach_video(0, Some(Arc::new(Camera))).await.unwrap();
        assert!(mixer.has_video());

        mixer.set_video_effect(0, Some(Arc::new(Invert)));
        mixer.append_video(0, MediaBuffer::video(vec![0x0Fu8], 0, true));
        assert_eq!(output.buffers.lock()[0].payload.as_deref(), Some(&[0xF0u8][..]));

        mixer.unregister_output(&handle);
        assert!(!output.attached.load(Ordering::SeqCst));
        mixer.append_video(0, MediaBuffer::video(vec![0u8], 33_000, false));
        assert_eq!(output.buffers.lock().len(), 1);

        mixer.dispose().await;
        assert!(!mixer.has_video());
    }
}
