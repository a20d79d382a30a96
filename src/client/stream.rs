//! RTMP NetStream
//!
//! ```text
//! Initialized --createStream--> Open --publish--> Publishing
//!                                    \--play----> Playing
//! any --close()--> Closed
//! ```
//!
//! `publish`/`play` issued before the stream is open are queued and sent
//! once the server assigns the stream id.
//!
//! Publishing: buffers appended through [`MediaOutput`] go through the
//! encoder codecs; every output sample becomes an audio or video tag whose
//! timestamp is relative to the first sample sent on the stream.
//!
//! Playing: incoming tags are parsed, handed to the decoder codecs and then
//! to a [`MediaLink`] which releases them to the registered outputs in time.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::amf::AmfValue;
use crate::codec::settings::metadata;
use crate::codec::{
    AudioCodecSettings, Codec, CodecListener, MediaFormat, PassthroughCoder, VideoCodecSettings,
    MIMETYPE_AUDIO_AAC, MIMETYPE_VIDEO_AVC, MIMETYPE_VIDEO_HEVC,
};
use crate::error::Result;
use crate::media::aac::AudioSpecificConfig;
use crate::media::buffer::{BufferPools, MediaBuffer, MediaType};
use crate::media::flv::{self, AudioPacket, FlvTag, VideoCodec, VideoPacket, VideoPacketType};
use crate::media::h264::{self, AvcConfig};
use crate::media::hevc::HevcConfig;
use crate::media::link::{AudioSink, LinkTarget, MediaLink, MediaLinkConfig};
use crate::media::mixer::{same_output, MediaOutput, MediaOutputDataSource};
use crate::protocol::constants::*;
use crate::protocol::message::{
    Command, DataMessage, MessageFactory, MessageKind, RtmpMessage, UserControlEvent,
};
use crate::stats::{StreamStats, StreamStatsSnapshot};

use super::connection::{ConnectionInner, RtmpConnection};
use super::status::{StatusEvent, StreamCode};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Initialized = 0,
    /// `createStream` sent, waiting for the stream id
    Creating = 1,
    Open = 2,
    Publishing = 3,
    Playing = 4,
    Closed = 5,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Creating,
            2 => StreamState::Open,
            3 => StreamState::Publishing,
            4 => StreamState::Playing,
            5 => StreamState::Closed,
            _ => StreamState::Initialized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Publish,
    Play,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Queued {
    Publish(String),
    Play(String),
}

#[derive(Default)]
struct PublishState {
    timestamp_base: Option<i64>,
    last_audio: u32,
    last_video: u32,
    video_codec: Option<VideoCodec>,
    video_header_sent: bool,
}

impl PublishState {
    /// Milliseconds since the first sample sent on the stream, never
    /// going backwards per media type
    fn timestamp(&mut self, media_type: MediaType, timestamp_us: i64) -> u32 {
        let base = *self.timestamp_base.get_or_insert(timestamp_us);
        let timestamp = ((timestamp_us - base).max(0) / 1000) as u32;
        let last = match media_type {
            MediaType::Audio => &mut self.last_audio,
            MediaType::Video => &mut self.last_video,
        };
        *last = (*last).max(timestamp);
        *last
    }
}

struct PlaybackState {
    nalu_length_size: u8,
    has_audio: bool,
    has_video: bool,
    metadata: Option<AmfValue>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            nalu_length_size: 4,
            has_audio: false,
            has_video: false,
            metadata: None,
        }
    }
}

pub(crate) struct StreamInner {
    this: Weak<StreamInner>,
    connection: Weak<ConnectionInner>,
    id: AtomicU32,
    state: AtomicU8,
    mode: Mutex<Mode>,
    queued: Mutex<Option<Queued>>,
    fc_publish_name: Mutex<Option<String>>,
    status_tx: broadcast::Sender<StatusEvent>,
    stats: StreamStats,
    pools: Arc<BufferPools>,
    audio_codec: Codec,
    video_codec: Codec,
    link: MediaLink,
    audio_settings: Mutex<AudioCodecSettings>,
    video_settings: Mutex<VideoCodecSettings>,
    has_audio: AtomicBool,
    has_video: AtomicBool,
    outputs: Mutex<Vec<Arc<dyn MediaOutput>>>,
    data_source: Mutex<Option<Weak<dyn MediaOutputDataSource>>>,
    publish: Mutex<PublishState>,
    playback: Mutex<PlaybackState>,
    encoder: Arc<EncoderListener>,
    decoder: Arc<DecoderListener>,
}

/// Publish or play stream on an [`RtmpConnection`]
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct RtmpStream {
    inner: Arc<StreamInner>,
}

impl RtmpStream {
    pub fn new(connection: &RtmpConnection) -> Self {
        Self::with_link_config(connection, MediaLinkConfig::default())
    }

    pub fn with_link_config(connection: &RtmpConnection, link_config: MediaLinkConfig) -> Self {
        let pools = Arc::new(BufferPools::new(connection.config().buffer_pool_size));
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        let inner = Arc::new_cyclic(|this: &Weak<StreamInner>| {
            let target: Weak<dyn LinkTarget> = this.clone();
            StreamInner {
                this: this.clone(),
                connection: Arc::downgrade(&connection.inner),
                id: AtomicU32::new(0),
                state: AtomicU8::new(StreamState::Initialized as u8),
                mode: Mutex::new(Mode::Idle),
                queued: Mutex::new(None),
                fc_publish_name: Mutex::new(None),
                status_tx,
                stats: StreamStats::new(),
                audio_codec: Codec::new(
                    MediaType::Audio,
                    Box::new(PassthroughCoder::new()),
                    pools.clone(),
                ),
                video_codec: Codec::new(
                    MediaType::Video,
                    Box::new(PassthroughCoder::new()),
                    pools.clone(),
                ),
                pools,
                link: MediaLink::new(target, link_config),
                audio_settings: Mutex::new(AudioCodecSettings::default()),
                video_settings: Mutex::new(VideoCodecSettings::default()),
                has_audio: AtomicBool::new(false),
                has_video: AtomicBool::new(false),
                outputs: Mutex::new(Vec::new()),
                data_source: Mutex::new(None),
                publish: Mutex::new(PublishState::default()),
                playback: Mutex::new(PlaybackState::default()),
                encoder: Arc::new(EncoderListener { stream: this.clone() }),
                decoder: Arc::new(DecoderListener { stream: this.clone() }),
            }
        });

        connection.inner.attach_stream(&inner);
        Self { inner }
    }

    /// Server-assigned stream id, 0 until the stream is open
    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    pub fn state(&self) -> StreamState {
        self.inner.state()
    }

    /// Receive `NetStream.*` status events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status_tx.subscribe()
    }

    /// Name announced with releaseStream/FCPublish before `createStream`
    pub fn set_fc_publish_name(&self, name: Option<String>) {
        *self.inner.fc_publish_name.lock() = name;
    }

    pub fn fc_publish_name(&self) -> Option<String> {
        self.inner.fc_publish_name()
    }

    pub fn audio_settings(&self) -> AudioCodecSettings {
        self.inner.audio_settings.lock().clone()
    }

    pub fn set_audio_settings(&self, settings: AudioCodecSettings) {
        *self.inner.audio_settings.lock() = settings;
    }

    pub fn video_settings(&self) -> VideoCodecSettings {
        self.inner.video_settings.lock().clone()
    }

    pub fn set_video_settings(&self, settings: VideoCodecSettings) {
        *self.inner.video_settings.lock() = settings;
    }

    /// Publish an audio track; ignored while a mixer is the data source
    pub fn set_has_audio(&self, has_audio: bool) {
        self.inner.has_audio.store(has_audio, Ordering::Release);
    }

    /// Publish a video track; ignored while a mixer is the data source
    pub fn set_has_video(&self, has_video: bool) {
        self.inner.has_video.store(has_video, Ordering::Release);
    }

    pub fn audio_codec(&self) -> &Codec {
        &self.inner.audio_codec
    }

    pub fn video_codec(&self) -> &Codec {
        &self.inner.video_codec
    }

    /// Playback synchronizer, e.g. to drive `do_frame` from a display
    pub fn media_link(&self) -> &MediaLink {
        &self.inner.link
    }

    /// Audio device for playback; it also becomes the playback clock
    pub fn set_audio_sink(&self, sink: Option<Box<dyn AudioSink>>) {
        self.inner.link.set_audio_sink(sink);
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.link.set_paused(paused);
    }

    /// `onMetaData` received while playing
    pub fn metadata(&self) -> Option<AmfValue> {
        self.inner.playback.lock().metadata.clone()
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn publish(&self, name: &str) {
        self.inner.request(Queued::Publish(name.to_string()));
    }

    pub fn play(&self, name: &str) {
        self.inner.request(Queued::Play(name.to_string()));
    }

    /// Stop publishing or playing and delete the stream on the server
    ///
    /// Closing a closed stream, or one that never opened, does nothing.
    pub fn close(&self) {
        self.inner.close();
    }

    /// This stream as a capture output, e.g. for
    /// [`MediaMixer::register_output`](crate::media::MediaMixer::register_output)
    pub fn as_output(&self) -> Arc<dyn MediaOutput> {
        self.inner.clone()
    }

    /// Add a playback output; rendered frames are appended to it
    pub fn register_output(&self, output: Arc<dyn MediaOutput>) {
        MediaOutputDataSource::register_output(&*self.inner, output);
    }

    pub fn unregister_output(&self, output: &Arc<dyn MediaOutput>) {
        MediaOutputDataSource::unregister_output(&*self.inner, output);
    }
}

impl std::fmt::Debug for RtmpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmpStream")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl StreamInner {
    fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        let previous = StreamState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::debug!(stream_id = self.id(), from = ?previous, to = ?state, "Stream state");
        }
    }

    pub(crate) fn fc_publish_name(&self) -> Option<String> {
        self.fc_publish_name.lock().clone()
    }

    fn transition(&self, from: StreamState, to: StreamState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            tracing::debug!(stream_id = self.id(), ?from, ?to, "Stream state");
        }
        swapped
    }

    /// Claim the stream for `createStream`
    ///
    /// Only one caller wins; false if the stream is already being created or
    /// already has an id.
    pub(crate) fn prepare(&self) -> bool {
        // A closed stream starts over on the next connection
        if self.transition(StreamState::Closed, StreamState::Initialized) {
            self.id.store(0, Ordering::Release);
        }
        self.transition(StreamState::Initialized, StreamState::Creating)
    }

    /// `createStream` was refused; the next `Connect.Success` retries
    pub(crate) fn on_create_failed(&self) {
        self.transition(StreamState::Creating, StreamState::Initialized);
    }

    fn emit(&self, event: StatusEvent) {
        let _ = self.status_tx.send(event);
    }

    fn publishes_audio(&self) -> bool {
        match self.data_source.lock().as_ref() {
            Some(source) => source.upgrade().is_some_and(|s| s.has_audio()),
            None => self.has_audio.load(Ordering::Acquire),
        }
    }

    fn publishes_video(&self) -> bool {
        match self.data_source.lock().as_ref() {
            Some(source) => source.upgrade().is_some_and(|s| s.has_video()),
            None => self.has_video.load(Ordering::Acquire),
        }
    }

    fn request(&self, request: Queued) {
        match self.state() {
            StreamState::Open => self.issue(request),
            StreamState::Initialized | StreamState::Creating | StreamState::Closed => {
                tracing::debug!(?request, "Stream not open yet, queued");
                *self.queued.lock() = Some(request);
            }
            state => tracing::warn!(?request, ?state, "Request ignored"),
        }
    }

    fn issue(&self, request: Queued) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let id = self.id();
        match request {
            Queued::Publish(name) => {
                tracing::debug!(stream_id = id, name = %name, "Publish");
                self.enter_mode(Mode::Publish);
                *self.publish.lock() = PublishState::default();
                let command = Command::new(
                    CMD_PUBLISH,
                    0.0,
                    AmfValue::Null,
                    vec![name.into(), "live".into()],
                )
                .on_stream(id);
                connection.send(&RtmpMessage::Command(command), id);
            }
            Queued::Play(name) => {
                tracing::debug!(stream_id = id, name = %name, "Play");
                self.enter_mode(Mode::Play);
                *self.playback.lock() = PlaybackState::default();
                self.link.start_running();
                connection.send(
                    &RtmpMessage::UserControl(UserControlEvent::SetBufferLength {
                        stream_id: id,
                        buffer_ms: connection.config().buffer_length,
                    }),
                    0,
                );
                let command = Command::new(
                    CMD_PLAY,
                    0.0,
                    AmfValue::Null,
                    vec![name.into(), (-2.0).into(), (-1.0).into(), true.into()],
                )
                .on_stream(id);
                connection.send(&RtmpMessage::Command(command), id);
            }
        }
    }

    /// Point both codecs at the listener for `mode`
    fn enter_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
        self.audio_codec.stop_running();
        self.video_codec.stop_running();
        let listener: Weak<dyn CodecListener> = match mode {
            Mode::Play => Arc::downgrade(&self.decoder) as Weak<dyn CodecListener>,
            _ => Arc::downgrade(&self.encoder) as Weak<dyn CodecListener>,
        };
        self.audio_codec.set_listener(listener.clone());
        self.video_codec.set_listener(listener);
    }

    fn mode(&self) -> Mode {
        *self.mode.lock()
    }

    pub(crate) fn on_created(&self, id: u32) {
        if self.state() != StreamState::Creating {
            tracing::debug!(stream_id = id, state = ?self.state(), "Late createStream reply");
            return;
        }
        self.id.store(id, Ordering::Release);
        if !self.transition(StreamState::Creating, StreamState::Open) {
            return;
        }
        let queued = self.queued.lock().take();
        if let Some(request) = queued {
            self.issue(request);
        }
    }

    pub(crate) fn on_status(&self, event: StatusEvent) {
        tracing::debug!(stream_id = self.id(), code = %event.code, "Stream status");
        match event.stream_code() {
            Some(StreamCode::PublishStart) => {
                self.set_state(StreamState::Publishing);
                self.start_publishing();
            }
            Some(StreamCode::PlayStart) => self.set_state(StreamState::Playing),
            _ if event.is_error() => {
                tracing::warn!(
                    stream_id = self.id(),
                    code = %event.code,
                    description = %event.description,
                    "Stream error"
                );
            }
            _ => {}
        }
        self.emit(event);
    }

    fn start_publishing(&self) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let id = self.id();
        let audio = self.publishes_audio().then(|| self.audio_settings.lock().clone());
        let video = self.publishes_video().then(|| self.video_settings.lock().clone());

        let meta = metadata(audio.as_ref(), video.as_ref());
        connection.send(&RtmpMessage::Data(DataMessage::set_data_frame(id, meta)), id);

        if let Some(audio) = audio {
            self.audio_codec.set_format(audio.to_format());
            self.audio_codec.start_running();
        }
        if let Some(video) = video {
            self.video_codec.set_format(video.to_format());
            self.video_codec.start_running();
        }
    }

    pub(crate) fn on_tick(&self) {
        self.stats.on_tick();
    }

    pub(crate) fn close(&self) {
        self.queued.lock().take();
        let previous = self.state();
        if matches!(previous, StreamState::Initialized | StreamState::Closed) {
            return;
        }
        let previous =
            StreamState::from_u8(self.state.swap(StreamState::Closed as u8, Ordering::AcqRel));
        match previous {
            StreamState::Closed => return,
            // No id yet, nothing to close on the server
            StreamState::Creating => {
                tracing::debug!("Stream closed while being created");
                return;
            }
            _ => {}
        }

        let id = self.id();
        if let Some(connection) = self.connection.upgrade() {
            if previous == StreamState::Publishing {
                if let Some(name) = self.fc_publish_name() {
                    connection.call_command(CMD_FC_UNPUBLISH, vec![name.into()]);
                }
            }
            let close =
                Command::new(CMD_CLOSE_STREAM, 0.0, AmfValue::Null, Vec::new()).on_stream(id);
            connection.send(&RtmpMessage::Command(close), id);
            connection.call_command(CMD_DELETE_STREAM, vec![(id as f64).into()]);
            connection.detach_stream(id);
        }

        self.audio_codec.stop_running();
        self.video_codec.stop_running();
        self.link.stop_running();
        *self.mode.lock() = Mode::Idle;
        tracing::debug!(stream_id = id, "Stream closed");
    }

    // Publish path

    fn send_tag(
        &self,
        connection: &ConnectionInner,
        kind: MessageKind,
        timestamp: u32,
        write: impl FnOnce(&mut BytesMut),
    ) {
        let data = tag_payload(connection.factory(), kind, write);
        let message = match kind {
            MessageKind::Audio => RtmpMessage::Audio { timestamp, data },
            _ => RtmpMessage::Video { timestamp, data },
        };
        connection.send(&message, self.id());
    }

    fn on_encoded_format(&self, mime: &str, format: &MediaFormat) {
        if self.state() != StreamState::Publishing {
            return;
        }
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        tracing::debug!(stream_id = self.id(), mime, "Encoder format");

        match mime {
            MIMETYPE_AUDIO_AAC => {
                let csd = match &format.csd {
                    Some(csd) => csd.clone(),
                    None => {
                        let profile = self.audio_settings.lock().profile;
                        let config =
                            AudioSpecificConfig::new(profile, format.sample_rate, format.channels);
                        match config {
                            Ok(config) => config.to_csd(),
                            Err(e) => {
                                tracing::warn!(error = %e, "Cannot describe AAC output");
                                return;
                            }
                        }
                    }
                };
                let timestamp = self.publish.lock().last_audio;
                self.send_tag(&connection, MessageKind::Audio, timestamp, |buf| {
                    flv::write_aac(buf, true, &csd)
                });
            }
            MIMETYPE_VIDEO_AVC | MIMETYPE_VIDEO_HEVC => {
                let codec = if mime == MIMETYPE_VIDEO_HEVC {
                    VideoCodec::Hevc
                } else {
                    VideoCodec::Avc
                };
                {
                    let mut publish = self.publish.lock();
                    publish.video_codec = Some(codec);
                    publish.video_header_sent = false;
                }
                // Without csd the header is built from the first key frame
                if let Some(csd) = &format.csd {
                    if let Err(e) = self.send_video_header(&connection, codec, csd) {
                        tracing::warn!(error = %e, "Invalid video codec data");
                    }
                }
            }
            mime => tracing::warn!(mime, "Unsupported encoder output"),
        }
    }

    fn send_video_header(
        &self,
        connection: &ConnectionInner,
        codec: VideoCodec,
        annex_b: &[u8],
    ) -> Result<()> {
        let mut record = BytesMut::new();
        match codec {
            VideoCodec::Avc => AvcConfig::from_annex_b(annex_b)?.encode(&mut record),
            VideoCodec::Hevc => HevcConfig::from_annex_b(annex_b)?.encode(&mut record),
        }

        let timestamp = {
            let mut publish = self.publish.lock();
            publish.video_header_sent = true;
            publish.last_video
        };
        let packet_type = VideoPacketType::SequenceStart;
        self.send_tag(connection, MessageKind::Video, timestamp, |buf| match codec {
            VideoCodec::Avc => flv::write_avc(buf, packet_type, true, 0, &record),
            VideoCodec::Hevc => flv::write_hevc(buf, packet_type, true, &record),
        });
        Ok(())
    }

    fn on_encoded_sample(&self, buffer: &MediaBuffer) {
        if self.state() != StreamState::Publishing {
            return;
        }
        let Some(payload) = buffer.payload.as_ref() else {
            return;
        };
        let Some(connection) = self.connection.upgrade() else {
            return;
        };

        match buffer.media_type {
            MediaType::Audio => {
                let timestamp =
                    self.publish.lock().timestamp(MediaType::Audio, buffer.timestamp_us);
                self.send_tag(&connection, MessageKind::Audio, timestamp, |buf| {
                    flv::write_aac(buf, false, payload)
                });
                self.stats.record_audio(payload.len());
            }
            MediaType::Video => {
                let (codec, header_sent) = {
                    let publish = self.publish.lock();
                    (publish.video_codec.unwrap_or(VideoCodec::Avc), publish.video_header_sent)
                };
                if !header_sent && self.send_video_header(&connection, codec, payload).is_err() {
                    tracing::debug!("No parameter sets yet, frame skipped");
                    return;
                }

                let timestamp =
                    self.publish.lock().timestamp(MediaType::Video, buffer.timestamp_us);
                let mut frame = BytesMut::with_capacity(payload.len() + 16);
                if is_annex_b(payload) {
                    h264::annex_b_to_avcc(payload, &mut frame);
                } else {
                    frame.extend_from_slice(payload);
                }
                let keyframe = buffer.sync;
                self.send_tag(&connection, MessageKind::Video, timestamp, |buf| match codec {
                    VideoCodec::Avc => {
                        flv::write_avc(buf, VideoPacketType::CodedFrames, keyframe, 0, &frame)
                    }
                    VideoCodec::Hevc => {
                        flv::write_hevc(buf, VideoPacketType::CodedFramesX, keyframe, &frame)
                    }
                });
                self.stats.record_video(payload.len(), keyframe);
            }
        }
    }

    // Playback path

    pub(crate) fn on_audio(&self, timestamp: u32, data: Bytes) {
        if self.mode() != Mode::Play {
            return;
        }
        self.stats.record_audio(data.len());

        match FlvTag::audio(timestamp, data).parse_audio() {
            Ok(AudioPacket::AacConfig(csd)) => match AudioSpecificConfig::parse(csd.clone()) {
                Ok(config) => {
                    self.playback.lock().has_audio = true;
                    let format = MediaFormat::audio(
                        MIMETYPE_AUDIO_AAC,
                        config.sampling_frequency,
                        config.channel_configuration,
                    )
                    .with_csd(csd);
                    self.audio_codec.set_format(format);
                    self.audio_codec.start_running();
                }
                Err(e) => tracing::warn!(error = %e, "Invalid AAC sequence header"),
            },
            Ok(AudioPacket::AacFrame(frame)) => {
                let mut buffer = self.pools.acquire(MediaType::Audio);
                buffer.set(MediaType::Audio, 0, frame, timestamp as i64 * 1000, false);
                self.audio_codec.append(buffer);
            }
            Err(e) => tracing::debug!(error = %e, "Audio tag skipped"),
        }
    }

    pub(crate) fn on_video(&self, timestamp: u32, data: Bytes) {
        if self.mode() != Mode::Play {
            return;
        }

        let packet = match FlvTag::video(timestamp, data).parse_video() {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(error = %e, "Video tag skipped");
                return;
            }
        };

        match packet {
            VideoPacket::Config { codec, record } => {
                let configured = match codec {
                    VideoCodec::Avc => AvcConfig::parse(record).map(|config| {
                        let format =
                            MediaFormat::video(MIMETYPE_VIDEO_AVC, 0, 0).with_csd(config.to_csd());
                        (format, config.nalu_length_size)
                    }),
                    VideoCodec::Hevc => HevcConfig::parse(record).map(|config| {
                        let (width, height) = config.video_size().unwrap_or((0, 0));
                        let format = MediaFormat::video(MIMETYPE_VIDEO_HEVC, width, height)
                            .with_csd(config.to_csd());
                        (format, config.nalu_length_size())
                    }),
                };
                match configured {
                    Ok((format, nalu_length_size)) => {
                        {
                            let mut playback = self.playback.lock();
                            playback.has_video = true;
                            playback.nalu_length_size = nalu_length_size;
                        }
                        self.video_codec.set_format(format);
                        self.video_codec.start_running();
                    }
                    Err(e) => tracing::warn!(error = %e, "Invalid video sequence header"),
                }
            }
            VideoPacket::Frame {
                keyframe,
                composition_time,
                data,
                ..
            } => {
                self.stats.record_video(data.len(), keyframe);
                let nalu_length_size = self.playback.lock().nalu_length_size;
                let mut frame = BytesMut::with_capacity(data.len() + 16);
                h264::avcc_to_annex_b(&data, nalu_length_size, &mut frame);

                let pts_us = (timestamp as i64 + composition_time as i64) * 1000;
                let mut buffer = self.pools.acquire(MediaType::Video);
                buffer.set(MediaType::Video, 0, frame.freeze(), pts_us, keyframe);
                self.video_codec.append(buffer);
            }
            VideoPacket::EndOfSequence { .. } => tracing::debug!("Video end of sequence"),
        }
    }

    pub(crate) fn on_data(&self, data: DataMessage) {
        let values = if data.name == CMD_SET_DATA_FRAME {
            &data.values[1.min(data.values.len())..]
        } else if data.name == CMD_ON_METADATA {
            &data.values[..]
        } else {
            tracing::debug!(name = %data.name, "Data message ignored");
            return;
        };
        if let Some(meta) = values.first() {
            tracing::debug!(stream_id = self.id(), "Metadata received");
            self.playback.lock().metadata = Some(meta.clone());
        }
    }

    fn on_decoded_sample(&self, buffer: MediaBuffer) {
        match buffer.media_type {
            MediaType::Audio => self.link.queue_audio(buffer),
            MediaType::Video => self.link.queue_video(buffer),
        }
    }

    fn fan_out(&self, buffer: &MediaBuffer) {
        let outputs = self.outputs.lock().clone();
        for output in outputs {
            output.append(buffer.clone());
        }
    }
}

fn is_annex_b(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

impl LinkTarget for StreamInner {
    fn has_video(&self) -> bool {
        self.playback.lock().has_video
    }

    fn release_output_buffer(&self, buffer: MediaBuffer, render: bool) {
        if buffer.media_type == MediaType::Video {
            if render {
                self.fan_out(&buffer);
            } else {
                self.stats.record_dropped(1);
            }
        }
        self.pools.release(buffer);
    }
}

impl MediaOutput for StreamInner {
    fn append(&self, buffer: MediaBuffer) {
        if self.mode() != Mode::Publish || self.state() != StreamState::Publishing {
            self.pools.release(buffer);
            return;
        }
        match buffer.media_type {
            MediaType::Audio => self.audio_codec.append(buffer),
            MediaType::Video => self.video_codec.append(buffer),
        }
    }

    fn set_data_source(&self, source: Option<Weak<dyn MediaOutputDataSource>>) {
        *self.data_source.lock() = source;
    }
}

impl MediaOutputDataSource for StreamInner {
    fn has_audio(&self) -> bool {
        self.playback.lock().has_audio
    }

    fn has_video(&self) -> bool {
        self.playback.lock().has_video
    }

    fn register_output(&self, output: Arc<dyn MediaOutput>) {
        {
            let mut outputs = self.outputs.lock();
            if outputs.iter().any(|o| same_output(o, &output)) {
                return;
            }
            outputs.push(output.clone());
        }
        let source: Weak<dyn MediaOutputDataSource> = self.this.clone();
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

/// Encoder output to tags
struct EncoderListener {
    stream: Weak<StreamInner>,
}

impl CodecListener for EncoderListener {
    fn on_format_changed(&self, mime: &str, format: &MediaFormat) {
        if let Some(stream) = self.stream.upgrade() {
            stream.on_encoded_format(mime, format);
        }
    }

    fn on_sample_output(&self, _mime: &str, buffer: MediaBuffer) -> Option<MediaBuffer> {
        if let Some(stream) = self.stream.upgrade() {
            stream.on_encoded_sample(&buffer);
        }
        Some(buffer)
    }
}

/// Decoder output to the media link
struct DecoderListener {
    stream: Weak<StreamInner>,
}

impl CodecListener for DecoderListener {
    fn on_format_changed(&self, mime: &str, format: &MediaFormat) {
        tracing::debug!(mime, width = format.width, height = format.height, "Decoder format");
    }

    fn on_sample_output(&self, _mime: &str, buffer: MediaBuffer) -> Option<MediaBuffer> {
        match self.stream.upgrade() {
            Some(stream) => {
                stream.on_decoded_sample(buffer);
                None
            }
            None => Some(buffer),
        }
    }
}

/// Build a tag payload in a pooled buffer
///
/// The payload is copied out so the pooled buffer goes back with its
/// allocation intact while the sent tag waits on the writer.
fn tag_payload(
    factory: &MessageFactory,
    kind: MessageKind,
    write: impl FnOnce(&mut BytesMut),
) -> Bytes {
    let mut buf = factory.acquire(kind);
    write(&mut buf);
    let data = Bytes::copy_from_slice(&buf);
    factory.release(kind, buf);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::config::ClientConfig;

    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<(i64, bool)>>,
        attached: AtomicBool,
    }

    impl MediaOutput for Collector {
        fn append(&self, buffer: MediaBuffer) {
            self.frames.lock().push((buffer.timestamp_us, buffer.sync));
        }

        fn set_data_source(&self, source: Option<Weak<dyn MediaOutputDataSource>>) {
            self.attached.store(source.is_some(), Ordering::Release);
        }
    }

    fn stream() -> RtmpStream {
        RtmpStream::new(&RtmpConnection::new(ClientConfig::default()))
    }

    #[test]
    fn test_publish_timestamps_are_stream_relative() {
        let mut state = PublishState::default();
        assert_eq!(state.timestamp(MediaType::Video, 5_000_000), 0);
        assert_eq!(state.timestamp(MediaType::Audio, 5_023_000), 23);
        assert_eq!(state.timestamp(MediaType::Video, 5_033_400), 33);
        // Never before the base, never backwards
        assert_eq!(state.timestamp(MediaType::Audio, 4_000_000), 23);
        assert_eq!(state.timestamp(MediaType::Video, 5_066_000), 66);
    }

    #[test]
    fn test_requests_are_queued_until_open() {
        let stream = stream();
        stream.publish("test");
        assert_eq!(stream.state(), StreamState::Initialized);
        assert_eq!(
            *stream.inner.queued.lock(),
            Some(Queued::Publish("test".to_string()))
        );

        stream.play("other");
        assert_eq!(*stream.inner.queued.lock(), Some(Queued::Play("other".to_string())));
    }

    #[test]
    fn test_close_before_open_is_noop() {
        let stream = stream();
        stream.close();
        stream.close();
        assert_eq!(stream.state(), StreamState::Initialized);
    }

    #[test]
    fn test_close_is_idempotent() {
        let stream = stream();
        assert!(stream.inner.prepare());
        stream.inner.on_created(1);
        assert_eq!(stream.state(), StreamState::Open);
        assert_eq!(stream.id(), 1);

        stream.close();
        assert_eq!(stream.state(), StreamState::Closed);
        stream.close();
        assert_eq!(stream.state(), StreamState::Closed);

        // A new connection reopens it
        assert!(stream.inner.prepare());
        assert_eq!(stream.state(), StreamState::Creating);
        assert_eq!(stream.id(), 0);
    }

    #[test]
    fn test_prepare_claims_stream_once() {
        let stream = stream();
        assert!(stream.inner.prepare());
        assert_eq!(stream.state(), StreamState::Creating);
        assert!(!stream.inner.prepare());

        // Refused createStream hands the stream back
        stream.inner.on_create_failed();
        assert_eq!(stream.state(), StreamState::Initialized);
        assert!(stream.inner.prepare());

        stream.inner.on_created(7);
        assert_eq!(stream.state(), StreamState::Open);
        assert_eq!(stream.id(), 7);
        assert!(!stream.inner.prepare());
    }

    #[test]
    fn test_concurrent_prepare_has_one_winner() {
        for _ in 0..64 {
            let stream = stream();
            let inner = &stream.inner;
            let winners = std::thread::scope(|scope| {
                let handles: Vec<_> =
                    (0..4).map(|_| scope.spawn(move || inner.prepare())).collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap())
                    .filter(|won| *won)
                    .count()
            });
            assert_eq!(winners, 1);
            assert_eq!(stream.state(), StreamState::Creating);
        }
    }

    #[test]
    fn test_close_while_creating_ignores_late_reply() {
        let stream = stream();
        stream.publish("test");
        assert!(stream.inner.prepare());
        stream.close();
        assert_eq!(stream.state(), StreamState::Closed);

        stream.inner.on_created(3);
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(stream.id(), 0);
        assert!(stream.inner.queued.lock().is_none());
    }

    #[test]
    fn test_tag_buffers_keep_capacity() {
        let factory = MessageFactory::new(4);
        let payload = [0x17u8; 4096];

        // Sent tags stay alive on the writer while the next one is built
        let mut sent = Vec::new();
        for _ in 0..3 {
            let data = tag_payload(&factory, MessageKind::Video, |buf| {
                buf.extend_from_slice(&payload)
            });
            assert_eq!(&data[..], &payload[..]);
            assert_eq!(factory.pool(MessageKind::Video).available(), 1);
            sent.push(data);
        }
        assert_eq!(factory.pool(MessageKind::Video).misses(), 1);

        let buf = factory.acquire(MessageKind::Video);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= payload.len());
        assert_eq!(sent.len(), 3);
    }

    #[test]
    fn test_appends_outside_publishing_are_released() {
        let stream = stream();
        let output = stream.as_output();
        output.append(MediaBuffer::audio(Bytes::from_static(b"aac"), 0));
        assert_eq!(stream.inner.pools.pool(MediaType::Audio).available(), 1);
    }

    #[test]
    fn test_output_registration() {
        let stream = stream();
        let collector = Arc::new(Collector::default());
        let output: Arc<dyn MediaOutput> = collector.clone();

        stream.register_output(output.clone());
        stream.register_output(output.clone());
        assert_eq!(stream.inner.outputs.lock().len(), 1);
        assert!(collector.attached.load(Ordering::Acquire));

        let frame = MediaBuffer::video(Bytes::from_static(b"frame"), 33_000, true);
        stream.inner.release_output_buffer(frame, true);
        let dropped = MediaBuffer::video(Bytes::from_static(b"frame"), 66_000, false);
        stream.inner.release_output_buffer(dropped, false);
        assert_eq!(*collector.frames.lock(), vec![(33_000, true)]);
        assert_eq!(stream.stats().dropped_frames, 1);

        stream.unregister_output(&output);
        stream.unregister_output(&output);
        assert!(stream.inner.outputs.lock().is_empty());
        assert!(!collector.attached.load(Ordering::Acquire));
    }

    #[test]
    fn test_metadata_from_data_frame() {
        let stream = stream();
        let meta = AmfValue::ecma_array([("width", 1280.0)]);
        stream.inner.on_data(DataMessage::set_data_frame(1, meta.clone()));
        assert_eq!(stream.metadata(), Some(meta));

        stream
            .inner
            .on_data(DataMessage::new("|RtmpSampleAccess", vec![true.into(), true.into()]));
        assert_eq!(stream.metadata().and_then(|m| m.get_number("width")), Some(1280.0));
    }

    #[tokio::test]
    async fn test_playback_tags_reach_outputs() {
        let connection = RtmpConnection::default();
        let stream = RtmpStream::with_link_config(
            &connection,
            MediaLinkConfig {
                frame_interval: None,
                ..Default::default()
            },
        );
        let collector = Arc::new(Collector::default());
        stream.register_output(collector.clone());
        assert!(stream.inner.prepare());
        stream.inner.on_created(1);
        stream.play("live");

        let record = {
            let config = AvcConfig::from_annex_b(&[
                0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1F, 0xAC, //
                0, 0, 0, 1, 0x68, 0xEF, 0x38,
            ])
            .unwrap();
            let mut record = BytesMut::new();
            config.encode(&mut record);
            record
        };
        let mut tag = BytesMut::new();
        flv::write_avc(&mut tag, VideoPacketType::SequenceStart, true, 0, &record);
        stream.inner.on_video(0, tag.freeze());
        assert!(LinkTarget::has_video(&*stream.inner));

        for (ts, key) in [(0u32, false), (33, true), (66, false)] {
            let mut tag = BytesMut::new();
            let frame = [0, 0, 0, 2, 0x41, 0x9A];
            flv::write_avc(&mut tag, VideoPacketType::CodedFrames, key, 0, &frame);
            stream.inner.on_video(ts, tag.freeze());
        }

        let link = stream.media_link();
        link.do_frame(0);
        assert!(collector.frames.lock().is_empty());
        link.do_frame(40_000_000);
        assert_eq!(*collector.frames.lock(), vec![(33_000, true)]);
        link.do_frame(70_000_000);
        assert_eq!(collector.frames.lock().len(), 2);
        assert_eq!(stream.stats().video_messages, 3);
    }
}
