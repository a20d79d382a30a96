//! Client configuration and RTMP URL handling

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::protocol::constants::{
    CONNECTED_CHUNK_SIZE, DEFAULT_BUFFER_LENGTH, DEFAULT_FLASH_VER, DEFAULT_WINDOW_ACK_SIZE,
    RTMPS_PORT, RTMP_PORT,
};

/// Schemes a connection can be opened for, with their default ports
pub const SUPPORTED_SCHEMES: &[(&str, u16)] = &[("rtmp", RTMP_PORT), ("rtmps", RTMPS_PORT)];

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time allowed for the TCP connect and the handshake
    pub connect_timeout: Duration,

    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,

    /// Flash version string to send
    pub flash_ver: String,

    /// SWF URL to send
    pub swf_url: Option<String>,

    /// Page URL to send
    pub page_url: Option<String>,

    /// Outgoing chunk size announced after `NetConnection.Connect.Success`
    pub chunk_size: u32,

    /// Window acknowledgement size sent in reply to SetPeerBandwidth
    pub window_ack_size: u32,

    /// Play buffer length in milliseconds
    pub buffer_length: u32,

    /// Interval of the per-stream bookkeeping tick
    pub tick_interval: Duration,

    /// Free-list capacity of each outgoing message pool
    pub message_pool_size: usize,

    /// Free-list capacity of each media buffer pool
    pub buffer_pool_size: usize,

    /// Send releaseStream/FCPublish before createStream when publishing
    pub fc_publish: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            flash_ver: DEFAULT_FLASH_VER.to_string(),
            swf_url: None,
            page_url: None,
            chunk_size: CONNECTED_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            buffer_length: DEFAULT_BUFFER_LENGTH,
            tick_interval: Duration::from_secs(1),
            message_pool_size: 4,
            buffer_pool_size: 16,
            fc_publish: true,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn flash_ver(mut self, flash_ver: impl Into<String>) -> Self {
        self.flash_ver = flash_ver.into();
        self
    }

    pub fn swf_url(mut self, url: impl Into<String>) -> Self {
        self.swf_url = Some(url.into());
        self
    }

    pub fn page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }

    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn window_ack_size(mut self, size: u32) -> Self {
        self.window_ack_size = size;
        self
    }

    pub fn buffer_length(mut self, ms: u32) -> Self {
        self.buffer_length = ms;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn message_pool_size(mut self, size: usize) -> Self {
        self.message_pool_size = size;
        self
    }

    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = size;
        self
    }

    pub fn fc_publish(mut self, enabled: bool) -> Self {
        self.fc_publish = enabled;
        self
    }
}

/// Parsed RTMP URL
///
/// `rtmp://host[:port]/app[/instance...]/streamName[?query]`: every path
/// segment but the last forms the application path; the last one is the
/// stream name used by publish/play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUri {
    url: Url,
    segments: Vec<String>,
}

impl RtmpUri {
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| Error::Config(format!("invalid URL {}: {}", input, e)))?;

        if default_port(url.scheme()).is_none() {
            return Err(Error::Config(format!("unsupported scheme: {}", url.scheme())));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(Error::Config(format!("missing host in {}", input)));
        }

        let segments = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self { url, segments })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Explicit port, or the scheme's default
    pub fn port(&self) -> u16 {
        self.url
            .port()
            .or_else(|| default_port(self.scheme()))
            .unwrap_or(RTMP_PORT)
    }

    pub fn is_secure(&self) -> bool {
        self.scheme() == "rtmps"
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    /// Path segments forming the application, joined with `/`
    pub fn app_path(&self) -> String {
        match self.segments.len() {
            0 => String::new(),
            1 => self.segments[0].clone(),
            n => self.segments[..n - 1].join("/"),
        }
    }

    /// The `app` property of the connect command, query included
    pub fn app(&self) -> String {
        match self.query() {
            Some(q) => format!("{}?{}", self.app_path(), q),
            None => self.app_path(),
        }
    }

    /// Connection URL without the stream name and without user info
    pub fn tc_url(&self) -> String {
        let mut tc_url = format!("{}://{}", self.scheme(), self.host());
        if let Some(port) = self.url.port() {
            tc_url.push_str(&format!(":{}", port));
        }
        tc_url.push('/');
        tc_url.push_str(&self.app_path());
        if let Some(q) = self.query() {
            tc_url.push('?');
            tc_url.push_str(q);
        }
        tc_url
    }

    /// Last path segment; empty when the URL names only an application
    pub fn stream_name(&self) -> &str {
        match self.segments.len() {
            0 | 1 => "",
            n => &self.segments[n - 1],
        }
    }
}

impl fmt::Display for RtmpUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut url = self.url.clone();
        let _ = url.set_username("");
        let _ = url.set_password(None);
        write!(f, "{}", url)
    }
}

impl std::str::FromStr for RtmpUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RtmpUri::parse(s)
    }
}

/// Default port for a supported scheme
pub fn default_port(scheme: &str) -> Option<u16> {
    SUPPORTED_SCHEMES
        .iter()
        .find(|(s, _)| *s == scheme)
        .map(|(_, port)| *port)
}
