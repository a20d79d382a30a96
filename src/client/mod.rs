//! RTMP client
//!
//! An [`RtmpConnection`] owns one socket (plain or TLS), runs the handshake
//! and the `connect` command, and multiplexes any number of
//! [`RtmpStream`]s, each publishing or playing one stream name.
//!
//! Status is reported through broadcast channels of [`StatusEvent`]s:
//! `NetConnection.*` codes on the connection, `NetStream.*` codes on the
//! stream they concern.

pub mod config;
pub mod connection;
pub mod responder;
pub mod status;
pub mod stream;
pub mod transport;

pub use config::{ClientConfig, RtmpUri};
pub use connection::{ConnectionState, RtmpConnection};
pub use responder::{NullResponder, OneshotResponder, Reply, Responder};
pub use status::{ConnectionCode, StatusEvent, StatusLevel, StreamCode};
pub use stream::{RtmpStream, StreamState};
