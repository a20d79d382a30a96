//! Encode/decode pipeline around a [`Coder`]
//!
//! A [`Codec`] feeds buffers into its coder and forwards every output to a
//! [`CodecListener`]. Coder errors are logged and skipped; the next append
//! naturally retries.

pub mod coder;
pub mod format;
pub mod settings;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::media::buffer::{BufferPools, MediaBuffer, MediaType};

pub use coder::{Coder, CoderOutput, PassthroughCoder, Rejected};
pub use format::{
    MediaFormat, MIMETYPE_AUDIO_AAC, MIMETYPE_AUDIO_RAW, MIMETYPE_VIDEO_AVC, MIMETYPE_VIDEO_HEVC,
    MIMETYPE_VIDEO_RAW,
};
pub use settings::{AudioCodecSettings, VideoCodecSettings};

/// Receives what a [`Codec`] produces
pub trait CodecListener: Send + Sync {
    /// Called once per format negotiation, and again on every change
    fn on_format_changed(&self, mime: &str, format: &MediaFormat);

    /// Called for every produced sample
    ///
    /// Returning the buffer hands it back to the codec's pool; keeping it
    /// means the listener retained it.
    fn on_sample_output(&self, mime: &str, buffer: MediaBuffer) -> Option<MediaBuffer>;
}

struct CodecState {
    coder: Box<dyn Coder>,
    format: Option<MediaFormat>,
    output_mime: String,
}

/// One audio or video coder with its listener
pub struct Codec {
    media_type: MediaType,
    state: Mutex<CodecState>,
    listener: Mutex<Option<Weak<dyn CodecListener>>>,
    pools: Arc<BufferPools>,
    running: AtomicBool,
}

impl Codec {
    pub fn new(media_type: MediaType, coder: Box<dyn Coder>, pools: Arc<BufferPools>) -> Self {
        Self {
            media_type,
            state: Mutex::new(CodecState {
                coder,
                format: None,
                output_mime: String::new(),
            }),
            listener: Mutex::new(None),
            pools,
            running: AtomicBool::new(false),
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn set_listener(&self, listener: Weak<dyn CodecListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Swap the coder; takes effect on the next `start_running`
    pub fn set_coder(&self, coder: Box<dyn Coder>) {
        let mut state = self.state.lock();
        if self.running.load(Ordering::Acquire) {
            state.coder.stop();
        }
        state.coder = coder;
        state.output_mime.clear();
        self.running.store(false, Ordering::Release);
    }

    pub fn format(&self) -> Option<MediaFormat> {
        self.state.lock().format.clone()
    }

    /// Input format; a running coder is reconfigured in place
    pub fn set_format(&self, format: MediaFormat) {
        let outputs = {
            let mut state = self.state.lock();
            if state.format.as_ref() == Some(&format) {
                return;
            }
            state.format = Some(format);
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            Self::start_coder(&mut state);
            Self::drain(&mut state)
        };
        self.dispatch(outputs);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start_running(&self) {
        let outputs = {
            let mut state = self.state.lock();
            if self.running.swap(true, Ordering::AcqRel) {
                return;
            }
            Self::start_coder(&mut state);
            Self::drain(&mut state)
        };
        self.dispatch(outputs);
    }

    pub fn stop_running(&self) {
        let mut state = self.state.lock();
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        state.coder.stop();
        state.output_mime.clear();
    }

    /// Feed one buffer; it is released to the pool if the codec is stopped
    pub fn append(&self, buffer: MediaBuffer) {
        let outputs = {
            let mut state = self.state.lock();
            if !self.running.load(Ordering::Acquire) {
                drop(state);
                self.pools.release(buffer);
                return;
            }
            if let Err(rejected) = state.coder.queue_input(buffer) {
                tracing::warn!(
                    media_type = ?self.media_type,
                    error = %rejected.error,
                    "Coder rejected input"
                );
                self.pools.release(rejected.buffer);
            }
            Self::drain(&mut state)
        };
        self.dispatch(outputs);
    }

    fn start_coder(state: &mut CodecState) {
        let Some(format) = state.format.clone() else {
            tracing::debug!("Codec started without a format");
            return;
        };
        if let Err(e) = state.coder.start(&format) {
            tracing::warn!(mime = %format.mime, error = %e, "Coder failed to start");
        }
    }

    fn drain(state: &mut CodecState) -> Vec<(String, CoderOutput)> {
        let mut outputs = Vec::new();
        loop {
            match state.coder.dequeue_output() {
                Ok(Some(output)) => {
                    if let CoderOutput::FormatChanged(format) = &output {
                        state.output_mime = format.mime.clone();
                    }
                    outputs.push((state.output_mime.clone(), output));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Coder output failed");
                    break;
                }
            }
        }
        outputs
    }

    fn dispatch(&self, outputs: Vec<(String, CoderOutput)>) {
        if outputs.is_empty() {
            return;
        }
        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        for (mime, output) in outputs {
            match output {
                CoderOutput::FormatChanged(format) => {
                    if let Some(listener) = &listener {
                        listener.on_format_changed(&mime, &format);
                    }
                }
                CoderOutput::Sample(buffer) => {
                    let unretained = match &listener {
                        Some(listener) => listener.on_sample_output(&mime, buffer),
                        None => Some(buffer),
                    };
                    if let Some(buffer) = unretained {
                        self.pools.release(buffer);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("media_type", &self.media_type)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use bytes::Bytes;

    #[derive(Default)]
    struct Recorder {
        formats: Mutex<Vec<String>>,
        samples: Mutex<Vec<i64>>,
        retain: bool,
    }

    impl CodecListener for Recorder {
        fn on_format_changed(&self, mime: &str, _format: &MediaFormat) {
            self.formats.lock().push(mime.to_string());
        }

        fn on_sample_output(&self, _mime: &str, buffer: MediaBuffer) -> Option<MediaBuffer> {
            self.samples.lock().push(buffer.timestamp_us);
            if self.retain {
                None
            } else {
                Some(buffer)
            }
        }
    }

    fn codec_with(listener: &Arc<Recorder>, pools: Arc<BufferPools>) -> Codec {
        let codec = Codec::new(MediaType::Video, Box::new(PassthroughCoder::new()), pools);
        let weak: Weak<dyn CodecListener> = Arc::downgrade(listener) as Weak<dyn CodecListener>;
        codec.set_listener(weak);
        codec
    }

    #[test]
    fn test_format_then_samples() {
        let listener = Arc::new(Recorder::default());
        let pools = Arc::new(BufferPools::new(4));
        let codec = codec_with(&listener, pools.clone());
        codec.set_format(MediaFormat::video(MIMETYPE_VIDEO_AVC, 640, 360));
        codec.start_running();
        codec.start_running();

        codec.append(MediaBuffer::video(Bytes::from_static(b"a"), 0, true));
        codec.append(MediaBuffer::video(Bytes::from_static(b"b"), 33_000, false));

        assert_eq!(*listener.formats.lock(), vec![MIMETYPE_VIDEO_AVC.to_string()]);
        assert_eq!(*listener.samples.lock(), vec![0, 33_000]);
        assert_eq!(pools.pool(MediaType::Video).available(), 2);
    }

    #[test]
    fn test_format_change_while_running() {
        let listener = Arc::new(Recorder::default());
        let codec = codec_with(&listener, Arc::new(BufferPools::new(4)));
        codec.set_format(MediaFormat::video(MIMETYPE_VIDEO_AVC, 640, 360));
        codec.start_running();
        codec.set_format(MediaFormat::video(MIMETYPE_VIDEO_AVC, 1280, 720));
        assert_eq!(listener.formats.lock().len(), 2);
    }

    #[test]
    fn test_stopped_codec_releases_input() {
        let listener = Arc::new(Recorder {
            retain: true,
            ..Default::default()
        });
        let pools = Arc::new(BufferPools::new(4));
        let codec = codec_with(&listener, pools.clone());
        codec.append(MediaBuffer::video(Bytes::from_static(b"a"), 0, true));
        assert!(listener.samples.lock().is_empty());
        assert_eq!(pools.pool(MediaType::Video).available(), 1);
    }

    struct FailingCoder;

    impl Coder for FailingCoder {
        fn start(&mut self, _format: &MediaFormat) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self) {}

        fn queue_input(&mut self, buffer: MediaBuffer) -> std::result::Result<(), Rejected> {
            Err(Rejected::new(Error::IllegalState("coder in error state"), buffer))
        }

        fn dequeue_output(&mut self) -> Result<Option<CoderOutput>> {
            Err(Error::IllegalState("coder in error state"))
        }
    }

    #[test]
    fn test_coder_errors_are_skipped() {
        let pools = Arc::new(BufferPools::new(4));
        let codec = Codec::new(MediaType::Audio, Box::new(FailingCoder), pools.clone());
        codec.set_format(MediaFormat::audio(MIMETYPE_AUDIO_AAC, 44100, 2));
        codec.start_running();
        codec.append(MediaBuffer::audio(Bytes::from_static(b"x"), 0));
        codec.append(MediaBuffer::audio(Bytes::from_static(b"y"), 23_000));
        assert!(codec.is_running());
        // Rejected input goes back to the pool
        assert_eq!(pools.pool(MediaType::Audio).available(), 2);
        codec.stop_running();
        codec.stop_running();
        assert!(!codec.is_running());
    }
}
