//! RTMP and RTMPS sessions

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::client::{
    ClientConfig, ConnectionCode, RtmpConnection, RtmpStream, RtmpUri, StatusEvent, StreamCode,
};
use crate::error::{Error, Result};

use super::{Method, ReadyState, SessionFactory, StreamSession};

/// Factory for `rtmp://` and `rtmps://` URLs
#[derive(Debug, Clone, Copy, Default)]
pub struct RtmpSessionFactory;

impl SessionFactory for RtmpSessionFactory {
    fn schemes(&self) -> &[&'static str] {
        &["rtmp", "rtmps"]
    }

    fn create(&self, url: &str, config: ClientConfig) -> Box<dyn StreamSession> {
        Box::new(RtmpStreamSession::new(url, config))
    }
}

/// [`StreamSession`] over one [`RtmpConnection`] and one [`RtmpStream`]
pub struct RtmpStreamSession {
    url: String,
    connection: RtmpConnection,
    stream: RtmpStream,
    ready_state: watch::Sender<ReadyState>,
}

impl RtmpStreamSession {
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Self {
        let connection = RtmpConnection::new(config);
        let stream = RtmpStream::new(&connection);
        let (ready_state, _) = watch::channel(ReadyState::Closed);
        Self {
            url: url.into(),
            connection,
            stream,
            ready_state,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection(&self) -> &RtmpConnection {
        &self.connection
    }

    fn set_ready_state(&self, state: ReadyState) {
        let previous = self.ready_state.send_replace(state);
        if previous != state {
            tracing::debug!(url = %self.url, from = ?previous, to = ?state, "Session state");
        }
    }

    async fn establish(&self, method: Method) -> Result<()> {
        let uri = RtmpUri::parse(&self.url)?;
        let name = uri.stream_name().to_string();

        let mut connection_events = self.connection.subscribe();
        let mut stream_events = self.stream.subscribe();

        match method {
            Method::Ingest => {
                if self.connection.config().fc_publish {
                    self.stream.set_fc_publish_name(Some(name.clone()));
                }
                self.stream.publish(&name);
            }
            Method::Playback => {
                self.stream.set_fc_publish_name(None);
                self.stream.play(&name);
            }
        }

        self.connection.open(&self.url).await?;

        let timeout = self.connection.config().connect_timeout;
        let started = wait_started(method, &mut connection_events, &mut stream_events);
        tokio::time::timeout(timeout, started)
            .await
            .map_err(|_| Error::Timeout)?
    }
}

/// Wait for the stream to start publishing or playing
///
/// Warnings such as `Play.Reset` are not failures; only error-level stream
/// codes and the connection going away are.
async fn wait_started(
    method: Method,
    connection_events: &mut broadcast::Receiver<StatusEvent>,
    stream_events: &mut broadcast::Receiver<StatusEvent>,
) -> Result<()> {
    let started = match method {
        Method::Ingest => StreamCode::PublishStart,
        Method::Playback => StreamCode::PlayStart,
    };

    loop {
        tokio::select! {
            event = stream_events.recv() => match event {
                Ok(event) if event.stream_code() == Some(started) => return Ok(()),
                Ok(event) if event.is_error() => return Err(Error::Status(event.code)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ConnectionClosed),
            },
            event = connection_events.recv() => match event {
                Ok(event) => match event.connection_code() {
                    Some(ConnectionCode::ConnectClosed) => return Err(Error::ConnectionClosed),
                    Some(
                        code @ (ConnectionCode::ConnectFailed
                        | ConnectionCode::ConnectRejected
                        | ConnectionCode::ConnectAppShutdown
                        | ConnectionCode::ConnectInvalidApp),
                    ) => return Err(Error::Status(code.as_str().to_string())),
                    _ => {}
                },
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ConnectionClosed),
            },
        }
    }
}

#[async_trait]
impl StreamSession for RtmpStreamSession {
    async fn connect(&self, method: Method) -> Result<()> {
        let mut current = ReadyState::Closed;
        let started = self.ready_state.send_if_modified(|state| {
            current = *state;
            if *state == ReadyState::Closed {
                *state = ReadyState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return match current {
                ReadyState::Open => Ok(()),
                _ => Err(Error::InProgress),
            };
        }

        tracing::info!(url = %self.url, ?method, "Session connecting");
        match self.establish(method).await {
            Ok(()) => {
                self.set_ready_state(ReadyState::Open);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Session failed");
                self.stream.close();
                self.connection.close();
                self.set_ready_state(ReadyState::Closed);
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if *self.ready_state.borrow() == ReadyState::Closed {
            return Ok(());
        }
        self.set_ready_state(ReadyState::Closing);
        self.stream.close();
        self.connection.close();
        self.set_ready_state(ReadyState::Closed);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready_state.borrow()
    }

    fn watch_ready_state(&self) -> watch::Receiver<ReadyState> {
        self.ready_state.subscribe()
    }

    fn stream(&self) -> &RtmpStream {
        &self.stream
    }
}

impl std::fmt::Debug for RtmpStreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmpStreamSession")
            .field("url", &self.url)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}
