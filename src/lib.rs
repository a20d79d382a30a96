//! rtmp-live: RTMP publish/play client
//!
//! This library provides:
//! - AMF0 serialization and the RTMP handshake and chunk stream codec
//! - `RtmpConnection` / `RtmpStream` for publishing and playing over
//!   `rtmp://` and `rtmps://`
//! - FLV tag packaging for AAC, H.264 and Enhanced RTMP HEVC
//! - A codec pipeline around pluggable hardware or software coders
//! - `MediaLink`, which releases decoded frames in sync with the audio
//!   clock, and `MediaMixer`, which fans captured media out to outputs
//! - `StreamSession`, the one-URL facade over a connection and a stream
//!
//! # Example: Publish
//!
//! ```no_run
//! use rtmp_live::session::{Method, SessionRegistry};
//! use rtmp_live::media::{MediaMixer, MixerConfig};
//! use rtmp_live::ClientConfig;
//!
//! #[tokio::main]
//! async fn main() -> rtmp_live::Result<()> {
//!     let registry = SessionRegistry::with_defaults();
//!     let session = registry.create("rtmp://localhost/live/key", ClientConfig::default())?;
//!
//!     let stream = session.stream();
//!     stream.set_has_video(true);
//!
//!     let mixer = MediaMixer::new(MixerConfig::default());
//!     mixer.register_output(stream.as_output());
//!
//!     session.connect(Method::Ingest).await?;
//!     // Frames appended to the mixer are now published
//!     session.close().await?;
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod client;
pub mod codec;
pub mod error;
pub mod media;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod stats;

pub use client::{ClientConfig, RtmpConnection, RtmpStream, StatusEvent};
pub use error::{Error, Result};
pub use media::{MediaBuffer, MediaLink, MediaMixer};
pub use session::{Method, ReadyState, SessionRegistry, StreamSession};
