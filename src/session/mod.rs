//! Stream sessions
//!
//! A [`StreamSession`] pairs one connection with one stream and drives them
//! from a single URL such as `rtmp://host/app/name`: `connect` opens the
//! connection and then publishes or plays the URL's stream name.
//!
//! Sessions are created through a [`SessionRegistry`], which maps URL
//! schemes to [`SessionFactory`]s. An unregistered scheme is an error.

pub mod rtmp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::client::{ClientConfig, RtmpStream};
use crate::error::{Error, Result};

pub use rtmp::{RtmpSessionFactory, RtmpStreamSession};

/// What `connect` does once the connection is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Publish the local capture
    Ingest,
    /// Play the remote stream
    Playback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One connection carrying one stream
#[async_trait]
pub trait StreamSession: Send + Sync {
    /// Connect, then publish or play; resolves once the stream has started
    async fn connect(&self, method: Method) -> Result<()>;

    /// Close the stream and the connection; closing twice is not an error
    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn ready_state(&self) -> ReadyState;

    /// Observe ready state changes
    fn watch_ready_state(&self) -> watch::Receiver<ReadyState>;

    fn stream(&self) -> &RtmpStream;
}

/// Creates sessions for a set of URL schemes
pub trait SessionFactory: Send + Sync {
    fn schemes(&self) -> &[&'static str];

    fn create(&self, url: &str, config: ClientConfig) -> Box<dyn StreamSession>;
}

/// URL scheme to session factory table
#[derive(Clone)]
pub struct SessionRegistry {
    factories: HashMap<String, Arc<dyn SessionFactory>>,
}

impl SessionRegistry {
    /// Empty registry; see [`with_defaults`](Self::with_defaults)
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry knowing `rtmp` and `rtmps`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RtmpSessionFactory));
        registry
    }

    /// Register `factory` for each of its schemes, replacing earlier entries
    pub fn register(&mut self, factory: Arc<dyn SessionFactory>) {
        for scheme in factory.schemes() {
            self.factories.insert(scheme.to_ascii_lowercase(), factory.clone());
        }
    }

    pub fn is_registered(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Create a session for `url` with the factory registered for its scheme
    pub fn create(&self, url: &str, config: ClientConfig) -> Result<Box<dyn StreamSession>> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid URL {}: {}", url, e)))?;
        let factory = self.factories.get(parsed.scheme()).ok_or_else(|| {
            Error::Config(format!("no session registered for scheme {}", parsed.scheme()))
        })?;
        Ok(factory.create(url, config))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<_> = self.factories.keys().collect();
        schemes.sort();
        f.debug_struct("SessionRegistry").field("schemes", &schemes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schemes() {
        let registry = SessionRegistry::default();
        assert!(registry.is_registered("rtmp"));
        assert!(registry.is_registered("RTMPS"));
        assert!(!registry.is_registered("srt"));
    }

    #[tokio::test]
    async fn test_unregistered_scheme_fails() {
        let registry = SessionRegistry::with_defaults();
        let result = registry.create("srt://example.com:9000/live", ClientConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));

        let empty = SessionRegistry::new();
        let result = empty.create("rtmp://example.com/live/key", ClientConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_created_session_starts_closed() {
        let registry = SessionRegistry::with_defaults();
        let session = registry
            .create("rtmp://example.com/live/key", ClientConfig::default())
            .unwrap();
        assert_eq!(session.ready_state(), ReadyState::Closed);
        assert!(!session.is_connected());
        session.close().await.unwrap();
        assert_eq!(session.ready_state(), ReadyState::Closed);
    }
}
