//! RTMP NetConnection
//!
//! ```text
//! Closed --connect(url)--> Connecting --handshake--> Connected --close()--> Closed
//! ```
//!
//! The socket is driven by two tasks. The reader owns the read half and the
//! [`ChunkDecoder`]; it handles chunk-level control itself and dispatches
//! every other message through [`ConnectionInner::handle_message`]. The
//! writer owns the write half and the [`ChunkEncoder`] and drains an
//! unbounded queue of chunks, so sending never blocks callers such as codec
//! callbacks.
//!
//! Status changes are published as [`StatusEvent`]s on a broadcast channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::amf::AmfValue;
use crate::error::{Error, HandshakeError, Result};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
use crate::protocol::constants::*;
use crate::protocol::handshake::{Handshake, HandshakeRole};
use crate::protocol::message::{Command, MessageFactory, MessageKind, RtmpMessage, UserControlEvent};
use crate::stats::{ConnectionStats, ConnectionStatsSnapshot};

use super::config::{ClientConfig, RtmpUri};
use super::responder::Responder;
use super::status::{ConnectionCode, StatusEvent};
use super::stream::StreamInner;
use super::transport::{self, BoxedTransport};

const STATUS_CHANNEL_CAPACITY: usize = 64;
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Closed = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }
}

/// What a transaction id is waiting for
enum Pending {
    Connect,
    CreateStream(Weak<StreamInner>),
    External(Box<dyn Responder>),
}

#[derive(Default)]
struct Shared {
    uri: Option<RtmpUri>,
    transaction_id: u32,
    responders: HashMap<u32, Pending>,
    /// Streams with an assigned id
    streams: HashMap<u32, Arc<StreamInner>>,
    /// Every stream built on this connection; each gets `createStream` on
    /// `Connect.Success`
    registered: Vec<Weak<StreamInner>>,
    connect_args: Vec<AmfValue>,
    /// `Connect.Success` was received on the current socket
    accepted: bool,
    connect_waiter: Option<oneshot::Sender<Result<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct ConnectionInner {
    config: ClientConfig,
    state: AtomicU8,
    shared: Mutex<Shared>,
    writer: Mutex<Option<mpsc::UnboundedSender<RtmpChunk>>>,
    status_tx: broadcast::Sender<StatusEvent>,
    factory: Arc<MessageFactory>,
    stats: Arc<ConnectionStats>,
    /// Peer window acknowledgement size, 0 until announced
    ack_window: AtomicU32,
    last_ack: AtomicU64,
}

/// A two-way RTMP connection to an application on a server
///
/// Cloning yields another handle to the same connection. Methods that start
/// work (`connect`, `open`) must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct RtmpConnection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl RtmpConnection {
    pub fn new(config: ClientConfig) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let factory = Arc::new(MessageFactory::new(config.message_pool_size));
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                state: AtomicU8::new(ConnectionState::Closed as u8),
                shared: Mutex::new(Shared::default()),
                writer: Mutex::new(None),
                status_tx,
                factory,
                stats: Arc::new(ConnectionStats::new()),
                ack_window: AtomicU32::new(0),
                last_ack: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// URL passed to the last `connect`
    pub fn uri(&self) -> Option<RtmpUri> {
        self.inner.shared.lock().uri.clone()
    }

    /// Receive `NetConnection.*` status events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status_tx.subscribe()
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Number of streams with an assigned id
    pub fn stream_count(&self) -> usize {
        self.inner.shared.lock().streams.len()
    }

    /// Start connecting to `url`
    ///
    /// Returns once the attempt is under way; the outcome is reported as a
    /// `NetConnection.Connect.*` status event. Connecting while already
    /// connecting or connected does nothing.
    pub fn connect(&self, url: &str) -> Result<()> {
        self.connect_with(url, Vec::new())
    }

    /// Like [`connect`](Self::connect), appending `arguments` after the
    /// connect command object
    pub fn connect_with(&self, url: &str, arguments: Vec<AmfValue>) -> Result<()> {
        let uri = RtmpUri::parse(url)?;
        self.inner.start_connect(uri, arguments);
        Ok(())
    }

    /// Connect and wait for `NetConnection.Connect.Success`
    ///
    /// Fails with [`Error::InProgress`] if another `open` is still pending,
    /// with [`Error::Status`] carrying the code when the server refuses, and
    /// with [`Error::ConnectionClosed`] if `close` is called meanwhile.
    pub async fn open(&self, url: &str) -> Result<()> {
        let uri = RtmpUri::parse(url)?;
        let rx = {
            let mut shared = self.inner.shared.lock();
            if shared.connect_waiter.is_some() {
                return Err(Error::InProgress);
            }
            if shared.accepted && self.is_connected() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            shared.connect_waiter = Some(tx);
            rx
        };
        self.inner.start_connect(uri, Vec::new());
        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Call a command on the server
    ///
    /// Does nothing unless connected. The responder, if any, receives the
    /// `_result` or `_error` reply.
    pub fn call(
        &self,
        command_name: &str,
        responder: Option<Box<dyn Responder>>,
        arguments: Vec<AmfValue>,
    ) {
        self.inner.call(command_name, responder.map(Pending::External), arguments);
    }

    /// Close every stream and the socket; closing a closed connection does nothing
    pub fn close(&self) {
        self.inner
            .shutdown(ConnectionCode::ConnectClosed, "closed by client");
    }
}

impl Default for RtmpConnection {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl std::fmt::Debug for RtmpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmpConnection")
            .field("state", &self.state())
            .field("uri", &self.uri().map(|u| u.to_string()))
            .finish()
    }
}

impl ConnectionInner {
    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn factory(&self) -> &MessageFactory {
        &self.factory
    }

    fn start_connect(self: &Arc<Self>, uri: RtmpUri, arguments: Vec<AmfValue>) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Closed as u8,
                ConnectionState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!(uri = %uri, "Connect ignored, connection already active");
            return;
        }

        tracing::debug!(uri = %uri, "Connecting");
        self.ack_window.store(0, Ordering::Release);
        self.last_ack.store(0, Ordering::Release);

        let task = tokio::spawn(run_connection(
            Arc::downgrade(self),
            uri.clone(),
            self.config.clone(),
        ));

        let mut shared = self.shared.lock();
        shared.uri = Some(uri);
        shared.connect_args = arguments;
        shared.transaction_id = 0;
        shared.tasks.push(task);
    }

    /// Queue a message for the writer; false when there is no socket
    pub(crate) fn send(&self, message: &RtmpMessage, stream_id: u32) -> bool {
        self.send_chunk(message.to_chunk(stream_id))
    }

    pub(crate) fn send_chunk(&self, chunk: RtmpChunk) -> bool {
        match self.writer.lock().as_ref() {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }

    fn call(&self, command_name: &str, pending: Option<Pending>, arguments: Vec<AmfValue>) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let transaction_id = {
            let mut shared = self.shared.lock();
            shared.transaction_id += 1;
            let id = shared.transaction_id;
            if let Some(pending) = pending {
                shared.responders.insert(id, pending);
            }
            id
        };
        let command = Command::new(command_name, transaction_id as f64, AmfValue::Null, arguments);
        self.send(&RtmpMessage::Command(command), 0)
    }

    pub(crate) fn call_command(&self, command_name: &str, arguments: Vec<AmfValue>) -> bool {
        self.call(command_name, None, arguments)
    }

    /// Register a stream; `createStream` is issued now or on `Connect.Success`
    pub(crate) fn attach_stream(&self, stream: &Arc<StreamInner>) {
        let ready = {
            let mut shared = self.shared.lock();
            shared.registered.retain(|s| s.strong_count() > 0);
            shared.registered.push(Arc::downgrade(stream));
            shared.accepted && self.state() == ConnectionState::Connected
        };
        if ready {
            self.create_stream(stream);
        }
    }

    fn registered_streams(&self) -> Vec<Arc<StreamInner>> {
        self.shared
            .lock()
            .registered
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn detach_stream(&self, stream_id: u32) {
        self.shared.lock().streams.remove(&stream_id);
    }

    fn create_stream(&self, stream: &Arc<StreamInner>) {
        if !stream.prepare() {
            return;
        }
        if let Some(name) = stream.fc_publish_name() {
            self.call_command(CMD_RELEASE_STREAM, vec![name.as_str().into()]);
            self.call_command(CMD_FC_PUBLISH, vec![name.into()]);
        }
        self.call(
            CMD_CREATE_STREAM,
            Some(Pending::CreateStream(Arc::downgrade(stream))),
            Vec::new(),
        );
    }

    fn streams(&self) -> Vec<Arc<StreamInner>> {
        self.shared.lock().streams.values().cloned().collect()
    }

    fn stream(&self, stream_id: u32) -> Option<Arc<StreamInner>> {
        self.shared.lock().streams.get(&stream_id).cloned()
    }

    fn emit(&self, event: StatusEvent) {
        tracing::debug!(code = %event.code, level = event.level.as_str(), "Connection status");
        let _ = self.status_tx.send(event);
    }

    /// Handshake finished: start the writer and send `connect`
    fn on_handshake_done(
        self: &Arc<Self>,
        write_half: WriteHalf<BoxedTransport>,
        uri: &RtmpUri,
    ) -> bool {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.writer.lock() = Some(tx);

        if self
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            self.writer.lock().take();
            return false;
        }

        tokio::spawn(write_loop(rx, write_half, self.stats.clone(), self.factory.clone()));

        let (transaction_id, arguments) = {
            let mut shared = self.shared.lock();
            shared.transaction_id += 1;
            let id = shared.transaction_id;
            shared.responders.insert(id, Pending::Connect);
            (id, std::mem::take(&mut shared.connect_args))
        };

        let command = self.connect_command(uri, transaction_id, arguments);
        self.send(&RtmpMessage::Command(command), 0);
        tracing::debug!(app = %uri.app(), "Handshake done, connect sent");
        true
    }

    fn connect_command(
        &self,
        uri: &RtmpUri,
        transaction_id: u32,
        arguments: Vec<AmfValue>,
    ) -> Command {
        let optional =
            |value: &Option<String>| value.clone().map_or(AmfValue::Null, AmfValue::String);

        let mut object = AmfValue::object([
            ("app", uri.app()),
            ("flashVer", self.config.flash_ver.clone()),
        ]);
        object.insert("swfUrl", optional(&self.config.swf_url));
        object.insert("tcUrl", uri.tc_url());
        object.insert("fpad", false);
        object.insert("capabilities", DEFAULT_CAPABILITIES);
        object.insert("audioCodecs", SUPPORT_SND_AAC);
        object.insert("videoCodecs", SUPPORT_VID_H264);
        object.insert("videoFunction", SUPPORT_VID_CLIENT_SEEK);
        object.insert("pageUrl", optional(&self.config.page_url));
        object.insert("objectEncoding", OBJECT_ENCODING_AMF0);

        Command::new(CMD_CONNECT, transaction_id as f64, object, arguments)
    }

    /// Count received bytes and acknowledge each full window
    fn on_bytes_in(&self, n: usize) {
        let total = self.stats.add_bytes_in(n);
        let window = self.ack_window.load(Ordering::Acquire) as u64;
        if window == 0 {
            return;
        }
        let last = self.last_ack.load(Ordering::Acquire);
        if total - last >= window {
            self.last_ack.store(total, Ordering::Release);
            self.send(
                &RtmpMessage::Acknowledgement {
                    sequence: total as u32,
                },
                0,
            );
        }
    }

    fn handle_message(self: &Arc<Self>, message: RtmpMessage, stream_id: u32) {
        match message {
            RtmpMessage::WindowAckSize(size) => {
                tracing::debug!(size, "Peer window acknowledgement size");
                self.ack_window.store(size, Ordering::Release);
            }
            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                tracing::debug!(size, limit_type, "Peer bandwidth");
                self.send(&RtmpMessage::WindowAckSize(self.config.window_ack_size), 0);
            }
            RtmpMessage::Acknowledgement { sequence } => {
                tracing::trace!(sequence, "Acknowledgement");
            }
            RtmpMessage::UserControl(event) => self.on_user_control(event),
            RtmpMessage::Audio { timestamp, data } => {
                if let Some(stream) = self.stream(stream_id) {
                    stream.on_audio(timestamp, data);
                }
            }
            RtmpMessage::Video { timestamp, data } => {
                if let Some(stream) = self.stream(stream_id) {
                    stream.on_video(timestamp, data);
                }
            }
            RtmpMessage::Data(data) => {
                if let Some(stream) = self.stream(stream_id) {
                    stream.on_data(data);
                }
            }
            RtmpMessage::Command(command) => self.on_command(command),
            // Chunk-level control is applied by the reader
            RtmpMessage::SetChunkSize(_) | RtmpMessage::Abort { .. } => {}
        }
    }

    fn on_user_control(&self, event: UserControlEvent) {
        match event {
            UserControlEvent::PingRequest(timestamp) => {
                self.send(
                    &RtmpMessage::UserControl(UserControlEvent::PingResponse(timestamp)),
                    0,
                );
            }
            event => tracing::debug!(?event, "User control"),
        }
    }

    fn on_command(self: &Arc<Self>, command: Command) {
        match command.name.as_str() {
            CMD_RESULT | CMD_ERROR => {
                let success = command.name == CMD_RESULT;
                let pending = self
                    .shared
                    .lock()
                    .responders
                    .remove(&(command.transaction_id as u32));
                match pending {
                    Some(Pending::Connect) => self.on_connect_reply(&command, success),
                    Some(Pending::CreateStream(stream)) => {
                        self.on_create_stream_reply(&command, success, stream)
                    }
                    Some(Pending::External(responder)) => {
                        if success {
                            responder.on_result(&command.arguments);
                        } else {
                            responder.on_status(&command.arguments);
                        }
                    }
                    None => tracing::trace!(
                        transaction_id = command.transaction_id,
                        "Reply without responder"
                    ),
                }
            }
            CMD_ON_STATUS => {
                let Some(event) = command
                    .info()
                    .and_then(|info| StatusEvent::from_info(info, command.stream_id))
                else {
                    tracing::debug!("onStatus without a status object");
                    return;
                };
                if command.stream_id == 0 {
                    self.on_status(event);
                } else if let Some(stream) = self.stream(command.stream_id) {
                    stream.on_status(event);
                }
            }
            name => tracing::debug!(command = name, "Unhandled command"),
        }
    }

    fn on_connect_reply(self: &Arc<Self>, command: &Command, success: bool) {
        let fallback = if success {
            ConnectionCode::ConnectSuccess
        } else {
            ConnectionCode::ConnectFailed
        };
        let event = command
            .info()
            .and_then(|info| StatusEvent::from_info(info, 0))
            .unwrap_or_else(|| fallback.event(""));
        self.on_status(event);
    }

    fn on_create_stream_reply(&self, command: &Command, success: bool, stream: Weak<StreamInner>) {
        let Some(stream) = stream.upgrade() else {
            return;
        };
        let id = command.arguments.iter().find_map(AmfValue::as_number);
        match id {
            Some(id) if success => {
                let id = id as u32;
                tracing::debug!(stream_id = id, "Stream created");
                self.shared.lock().streams.insert(id, stream.clone());
                stream.on_created(id);
            }
            _ => {
                tracing::warn!(arguments = ?command.arguments, "createStream failed");
                stream.on_create_failed();
            }
        }
    }

    fn on_status(self: &Arc<Self>, event: StatusEvent) {
        match event.connection_code() {
            Some(ConnectionCode::ConnectSuccess) => {
                tracing::info!(chunk_size = self.config.chunk_size, "Connected");
                self.send(&RtmpMessage::SetChunkSize(self.config.chunk_size), 0);
                self.start_tick();
                self.shared.lock().accepted = true;
                // Streams are back in Initialized before listeners react
                for stream in self.registered_streams() {
                    self.create_stream(&stream);
                }
                self.emit(event);
                if let Some(waiter) = self.shared.lock().connect_waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
            }
            Some(
                ConnectionCode::ConnectRejected
                | ConnectionCode::ConnectFailed
                | ConnectionCode::ConnectInvalidApp
                | ConnectionCode::ConnectAppShutdown,
            ) => {
                self.emit(event.clone());
                if let Some(waiter) = self.shared.lock().connect_waiter.take() {
                    let _ = waiter.send(Err(Error::Status(event.code.clone())));
                }
                self.shutdown(ConnectionCode::ConnectClosed, &event.code);
            }
            _ => self.emit(event),
        }
    }

    fn start_tick(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.tick_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                for stream in inner.streams() {
                    stream.on_tick();
                }
            }
        });
        self.shared.lock().tasks.push(task);
    }

    /// Tear down the connection and report `code`
    ///
    /// Streams are closed first so their close commands still reach the
    /// writer, which drains its queue before the socket is shut.
    fn shutdown(&self, code: ConnectionCode, description: &str) {
        if self.state() == ConnectionState::Closed {
            return;
        }

        for stream in self.registered_streams() {
            stream.close();
        }
        self.shared.lock().streams.clear();

        let previous = ConnectionState::from_u8(
            self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel),
        );
        if previous == ConnectionState::Closed {
            return;
        }

        let (tasks, waiter) = {
            let mut shared = self.shared.lock();
            shared.transaction_id = 0;
            shared.responders.clear();
            shared.accepted = false;
            (std::mem::take(&mut shared.tasks), shared.connect_waiter.take())
        };
        self.writer.lock().take();
        for task in tasks {
            task.abort();
        }

        let never_connected = previous == ConnectionState::Connecting;
        let code = if never_connected && code == ConnectionCode::ConnectClosed {
            ConnectionCode::ConnectFailed
        } else {
            code
        };
        if let Some(waiter) = waiter {
            let error = match code {
                ConnectionCode::ConnectClosed => Error::ConnectionClosed,
                code => Error::Status(code.as_str().to_string()),
            };
            let _ = waiter.send(Err(error));
        }

        tracing::info!(code = code.as_str(), reason = description, "Connection closed");
        self.emit(code.event(description));
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        for task in self.shared.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}

/// Connect task: socket, handshake, then the read loop
async fn run_connection(weak: Weak<ConnectionInner>, uri: RtmpUri, config: ClientConfig) {
    let (transport, read_buf) = match establish(&uri, &config).await {
        Ok(established) => established,
        Err(e) => {
            tracing::warn!(uri = %uri, error = %e, "Connect failed");
            if let Some(inner) = weak.upgrade() {
                inner.shutdown(ConnectionCode::ConnectFailed, &e.to_string());
            }
            return;
        }
    };

    let (read_half, write_half) = tokio::io::split(transport);
    match weak.upgrade() {
        Some(inner) if inner.on_handshake_done(write_half, &uri) => {}
        _ => return,
    }

    let reason = match read_loop(&weak, read_half, read_buf).await {
        Ok(()) => "connection closed by peer".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Connection error");
            e.to_string()
        }
    };
    if let Some(inner) = weak.upgrade() {
        inner.shutdown(ConnectionCode::ConnectClosed, &reason);
    }
}

/// Open the transport and run the client handshake
///
/// Returns the transport with any bytes read past S2.
async fn establish(uri: &RtmpUri, config: &ClientConfig) -> Result<(BoxedTransport, BytesMut)> {
    let mut transport = transport::open(uri, config).await?;

    let mut handshake = Handshake::new(HandshakeRole::Client);
    let c0c1 = handshake.generate_initial().ok_or(HandshakeError::InvalidState)?;
    transport.write_all(&c0c1).await?;
    transport.flush().await?;

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    timeout(config.connect_timeout, async {
        while !handshake.is_done() {
            if let Some(c2) = handshake.process(&mut buf)? {
                transport.write_all(&c2).await?;
                transport.flush().await?;
                continue;
            }
            if transport.read_buf(&mut buf).await? == 0 {
                return Err(Error::Handshake(HandshakeError::ConnectionClosed));
            }
        }
        Ok::<_, Error>(())
    })
    .await
    .map_err(|_| Error::Timeout)??;

    Ok((transport, buf))
}

async fn read_loop(
    weak: &Weak<ConnectionInner>,
    mut reader: ReadHalf<BoxedTransport>,
    mut buf: BytesMut,
) -> Result<()> {
    let mut decoder = ChunkDecoder::new();
    loop {
        while let Some(chunk) = decoder.decode(&mut buf)? {
            match RtmpMessage::from_chunk(&chunk)? {
                RtmpMessage::SetChunkSize(size) => {
                    tracing::debug!(size, "Peer chunk size");
                    decoder.set_chunk_size(size);
                }
                RtmpMessage::Abort { csid } => decoder.abort(csid),
                message => {
                    let Some(inner) = weak.upgrade() else {
                        return Ok(());
                    };
                    inner.handle_message(message, chunk.stream_id);
                }
            }
        }

        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        match weak.upgrade() {
            Some(inner) => inner.on_bytes_in(n),
            None => return Ok(()),
        }
    }
}

/// Writer task; ends when every sender is gone and the queue is drained
async fn write_loop(
    mut rx: mpsc::UnboundedReceiver<RtmpChunk>,
    write_half: WriteHalf<BoxedTransport>,
    stats: Arc<ConnectionStats>,
    factory: Arc<MessageFactory>,
) {
    let mut writer = BufWriter::with_capacity(READ_BUFFER_SIZE, write_half);
    let mut encoder = ChunkEncoder::new();

    'outer: while let Some(chunk) = rx.recv().await {
        let mut next = Some(chunk);
        while let Some(chunk) = next {
            if let Err(e) = write_chunk(&mut writer, &mut encoder, &chunk, &factory, &stats).await {
                tracing::warn!(error = %e, "Write failed");
                break 'outer;
            }
            next = rx.try_recv().ok();
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(error = %e, "Flush failed");
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_chunk(
    writer: &mut BufWriter<WriteHalf<BoxedTransport>>,
    encoder: &mut ChunkEncoder,
    chunk: &RtmpChunk,
    factory: &MessageFactory,
    stats: &ConnectionStats,
) -> Result<()> {
    let kind = MessageKind::of(chunk.message_type);
    let mut out = factory.acquire(kind);
    encoder.encode(chunk, &mut out);
    let result = writer.write_all(&out).await;
    stats.add_bytes_out(out.len());
    factory.release(kind, out);
    result?;

    // Our chunk size changes only after the peer was told
    if chunk.message_type == MSG_SET_CHUNK_SIZE && chunk.payload.len() >= 4 {
        let size = u32::from_be_bytes([
            chunk.payload[0],
            chunk.payload[1],
            chunk.payload[2],
            chunk.payload[3],
        ]);
        encoder.set_chunk_size(size & 0x7FFF_FFFF);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_command_object() {
        let config = ClientConfig::default().page_url("https://example.com");
        let connection = RtmpConnection::new(config);
        let uri = RtmpUri::parse("rtmp://user:pw@localhost/live/sub/test?token=1").unwrap();
        let command = connection
            .inner
            .connect_command(&uri, 1, vec![AmfValue::String("extra".into())]);

        assert_eq!(command.name, CMD_CONNECT);
        assert_eq!(command.transaction_id, 1.0);
        let object = &command.command_object;
        assert_eq!(object.get_string("app"), Some("live/sub?token=1"));
        assert_eq!(object.get_string("tcUrl"), Some("rtmp://localhost/live/sub?token=1"));
        assert_eq!(object.get_string("flashVer"), Some(DEFAULT_FLASH_VER));
        assert_eq!(object.get("swfUrl"), Some(&AmfValue::Null));
        assert_eq!(object.get_string("pageUrl"), Some("https://example.com"));
        assert_eq!(object.get("fpad"), Some(&AmfValue::Boolean(false)));
        assert_eq!(object.get_number("capabilities"), Some(239.0));
        assert_eq!(object.get_number("audioCodecs"), Some(512.0));
        assert_eq!(object.get_number("videoCodecs"), Some(128.0));
        assert_eq!(object.get_number("videoFunction"), Some(1.0));
        assert_eq!(object.get_number("objectEncoding"), Some(0.0));
        assert_eq!(command.arguments, vec![AmfValue::String("extra".into())]);
    }

    #[test]
    fn test_call_is_noop_when_closed() {
        let connection = RtmpConnection::default();
        connection.call("custom", None, vec![]);
        assert_eq!(connection.inner.shared.lock().transaction_id, 0);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let connection = RtmpConnection::default();
        assert!(matches!(connection.connect("http://host/app/stream"), Err(Error::Config(_))));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_while_closed_is_noop() {
        let connection = RtmpConnection::default();
        let mut events = connection.subscribe();
        connection.close();
        connection.close();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refused_connect_reports_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connection = RtmpConnection::default();
        let mut events = connection.subscribe();
        let result = connection.open(&format!("rtmp://127.0.0.1:{}/live/test", port)).await;

        assert!(matches!(
            result,
            Err(Error::Status(code)) if code == "NetConnection.Connect.Failed"
        ));
        let event = events.recv().await.unwrap();
        assert_eq!(event.connection_code(), Some(ConnectionCode::ConnectFailed));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_resolves_pending_open() {
        // Accepts but never answers the handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            drop(socket);
        });

        let connection = RtmpConnection::default();
        let url = format!("rtmp://127.0.0.1:{}/live/test", port);
        let pending = {
            let connection = connection.clone();
            let url = url.clone();
            tokio::spawn(async move { connection.open(&url).await })
        };

        while connection.inner.shared.lock().connect_waiter.is_none() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(connection.open(&url).await, Err(Error::InProgress)));
        assert_eq!(connection.state(), ConnectionState::Connecting);

        // Second connect while connecting is a no-op
        connection.connect(&url).unwrap();
        assert_eq!(connection.inner.shared.lock().tasks.len(), 1);

        connection.close();
        assert!(pending.await.unwrap().is_err());
        assert_eq!(connection.state(), ConnectionState::Closed);
        server.abort();
    }
}
