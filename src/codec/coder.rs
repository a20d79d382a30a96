//! Boundary to the platform encoder/decoder

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::media::buffer::MediaBuffer;

use super::format::MediaFormat;

/// What a coder produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoderOutput {
    /// The output format was negotiated or changed
    FormatChanged(MediaFormat),
    Sample(MediaBuffer),
}

/// Input the coder would not take, handed back with the reason
#[derive(Debug)]
pub struct Rejected {
    pub error: Error,
    pub buffer: MediaBuffer,
}

impl Rejected {
    pub fn new(error: Error, buffer: MediaBuffer) -> Self {
        Self { error, buffer }
    }
}

/// A hardware or software encoder/decoder
///
/// Errors such as an invalid coder state are reported per call; the caller
/// logs them and keeps the pipeline alive.
pub trait Coder: Send {
    /// Configure for `format` and start accepting input
    fn start(&mut self, format: &MediaFormat) -> Result<()>;

    fn stop(&mut self);

    /// Take one input buffer; a rejected buffer comes back to the caller
    fn queue_input(&mut self, buffer: MediaBuffer) -> std::result::Result<(), Rejected>;

    /// Next pending output, or `None` when the coder has nothing ready
    fn dequeue_output(&mut self) -> Result<Option<CoderOutput>>;
}

/// Coder that forwards samples unchanged
///
/// Used when sources already deliver compressed samples and on playback
/// when decoding happens downstream of the outputs.
#[derive(Debug, Default)]
pub struct PassthroughCoder {
    format: Option<MediaFormat>,
    pending: VecDeque<CoderOutput>,
}

impl PassthroughCoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Coder for PassthroughCoder {
    fn start(&mut self, format: &MediaFormat) -> Result<()> {
        if self.format.as_ref() != Some(format) {
            self.pending.push_back(CoderOutput::FormatChanged(format.clone()));
        }
        self.format = Some(format.clone());
        Ok(())
    }

    fn stop(&mut self) {
        self.format = None;
        self.pending.clear();
    }

    fn queue_input(&mut self, buffer: MediaBuffer) -> std::result::Result<(), Rejected> {
        if self.format.is_none() {
            return Err(Rejected::new(Error::IllegalState("coder not started"), buffer));
        }
        self.pending.push_back(CoderOutput::Sample(buffer));
        Ok(())
    }

    fn dequeue_output(&mut self) -> Result<Option<CoderOutput>> {
        Ok(self.pending.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::format::MIMETYPE_VIDEO_AVC;

    #[test]
    fn test_passthrough_reports_format_once() {
        let mut coder = PassthroughCoder::new();
        let format = MediaFormat::video(MIMETYPE_VIDEO_AVC, 640, 360);
        coder.start(&format).unwrap();
        coder.start(&format).unwrap();
        coder.queue_input(MediaBuffer::video(vec![1u8], 0, true)).unwrap();

        assert_eq!(
            coder.dequeue_output().unwrap(),
            Some(CoderOutput::FormatChanged(format))
        );
        assert!(matches!(coder.dequeue_output().unwrap(), Some(CoderOutput::Sample(_))));
        assert_eq!(coder.dequeue_output().unwrap(), None);
    }

    #[test]
    fn test_input_before_start_is_rejected() {
        let mut coder = PassthroughCoder::new();
        let rejected = coder.queue_input(MediaBuffer::audio(vec![7u8], 23_000)).unwrap_err();
        assert!(matches!(rejected.error, Error::IllegalState(_)));
        assert_eq!(rejected.buffer.timestamp_us, 23_000);
    }
}
