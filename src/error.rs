//! Unified error types for rtmp-live

use std::fmt;
use std::io;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all connection, stream and media operations
#[derive(Debug)]
pub enum Error {
    /// I/O error during network operations
    Io(io::Error),
    /// RTMP protocol violation
    Protocol(ProtocolError),
    /// AMF encoding/decoding error
    Amf(AmfError),
    /// Handshake failure (fatal, never retried)
    Handshake(HandshakeError),
    /// Media packaging or parsing error
    Media(MediaError),
    /// A command was answered with a failure status code
    Status(String),
    /// Another completion of the same operation is still pending
    InProgress,
    /// Component misuse that must not be silently ignored
    IllegalState(&'static str),
    /// Operation timed out
    Timeout,
    /// Connection was closed
    ConnectionClosed,
    /// Invalid configuration or URL
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake failed: {}", e),
            Error::Media(e) => write!(f, "Media error: {}", e),
            Error::Status(code) => write!(f, "Command failed with status: {}", code),
            Error::InProgress => write!(f, "Operation already in progress"),
            Error::IllegalState(what) => write!(f, "Illegal state: {}", what),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Amf(e) => Some(e),
            Error::Handshake(e) => Some(e),
            Error::Media(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<MediaError> for Error {
    fn from(err: MediaError) -> Self {
        Error::Media(err)
    }
}

/// Protocol-level errors
#[derive(Debug)]
pub enum ProtocolError {
    InvalidChunkHeader,
    UnknownMessageType(u8),
    MessageTooLarge { size: u32, max: u32 },
    InvalidChunkStreamId(u32),
    UnexpectedMessage(String),
    MissingField(String),
    InvalidCommand(String),
    StreamNotFound(u32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidChunkHeader => write!(f, "Invalid chunk header"),
            ProtocolError::UnknownMessageType(t) => write!(f, "Unknown message type: {}", t),
            ProtocolError::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max {})", size, max)
            }
            ProtocolError::InvalidChunkStreamId(id) => write!(f, "Invalid chunk stream ID: {}", id),
            ProtocolError::UnexpectedMessage(msg) => write!(f, "Unexpected message: {}", msg),
            ProtocolError::MissingField(field) => write!(f, "Missing required field: {}", field),
            ProtocolError::InvalidCommand(cmd) => write!(f, "Invalid command: {}", cmd),
            ProtocolError::StreamNotFound(id) => write!(f, "Stream not found: {}", id),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// AMF encoding/decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmfError {
    /// Marker byte outside the supported AMF0 subset
    UnsupportedType(u8),
    UnexpectedEof,
    InvalidUtf8,
    NestingTooDeep,
    InvalidObjectEnd,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::UnsupportedType(m) => write!(f, "Unsupported AMF0 type marker: 0x{:02x}", m),
            AmfError::UnexpectedEof => write!(f, "Unexpected end of AMF data"),
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
            AmfError::NestingTooDeep => write!(f, "AMF nesting too deep"),
            AmfError::InvalidObjectEnd => write!(f, "Invalid object end marker"),
        }
    }
}

impl std::error::Error for AmfError {}

/// Handshake-specific errors
#[derive(Debug)]
pub enum HandshakeError {
    InvalidVersion(u8),
    InvalidState,
    /// Peer closed the socket before the exchange completed
    ConnectionClosed,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidVersion(v) => write!(f, "Invalid RTMP version: {}", v),
            HandshakeError::InvalidState => write!(f, "Invalid handshake state"),
            HandshakeError::ConnectionClosed => write!(f, "Peer closed during handshake"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Media packaging errors
#[derive(Debug)]
pub enum MediaError {
    InvalidFlvTag,
    InvalidAvcPacket,
    InvalidAacPacket,
    InvalidHevcRecord,
    UnsupportedCodec(String),
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::InvalidFlvTag => write!(f, "Invalid FLV tag"),
            MediaError::InvalidAvcPacket => write!(f, "Invalid AVC packet"),
            MediaError::InvalidAacPacket => write!(f, "Invalid AAC packet"),
            MediaError::InvalidHevcRecord => write!(f, "Invalid HEVC decoder configuration record"),
            MediaError::UnsupportedCodec(c) => write!(f, "Unsupported codec: {}", c),
        }
    }
}

impl std::error::Error for MediaError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;
    use std::io;

    #[test]
    fn test_error_display() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::Io(io_err);
        assert!(err.to_string().contains("I/O error"));

        let err = Error::Protocol(ProtocolError::InvalidChunkHeader);
        assert!(err.to_string().contains("Protocol error"));
        assert!(err.to_string().contains("Invalid chunk header"));

        let err = Error::Amf(AmfError::UnsupportedType(0x11));
        assert!(err.to_string().contains("AMF error"));
        assert!(err.to_string().contains("0x11"));

        let err = Error::Handshake(HandshakeError::InvalidVersion(5));
        assert!(err.to_string().contains("Handshake failed"));
        assert!(err.to_string().contains("5"));

        let err = Error::Status("NetStream.Publish.BadName".into());
        assert!(err.to_string().contains("Publish.BadName"));

        let err = Error::InProgress;
        assert!(err.to_string().contains("in progress"));

        let err = Error::IllegalState("recorder already started");
        assert!(err.to_string().contains("recorder already started"));

        let err = Error::Config("unsupported scheme: http".into());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("http"));
    }

    #[test]
    fn test_error_source() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(StdError::source(&err).is_some());

        let err = Error::Amf(AmfError::UnexpectedEof);
        assert!(StdError::source(&err).is_some());

        let err = Error::Timeout;
        assert!(StdError::source(&err).is_none());

        let err = Error::Status("NetConnection.Connect.Rejected".into());
        assert!(StdError::source(&err).is_none());
    }

    #[test]
    fn test_from_conversions() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "timeout").into();
        assert!(matches!(err, Error::Io(_)));

        let err: Error = ProtocolError::MessageTooLarge { size: 100, max: 50 }.into();
        assert!(matches!(err, Error::Protocol(_)));

        let err: Error = AmfError::InvalidUtf8.into();
        assert!(matches!(err, Error::Amf(_)));

        let err: Error = HandshakeError::ConnectionClosed.into();
        assert!(matches!(err, Error::Handshake(_)));

        let err: Error = MediaError::InvalidHevcRecord.into();
        assert!(matches!(err, Error::Media(_)));
    }

    #[test]
    fn test_protocol_error_display() {
        assert!(ProtocolError::UnknownMessageType(99).to_string().contains("99"));

        let err = ProtocolError::MessageTooLarge { size: 1000, max: 500 };
        assert!(err.to_string().contains("1000"));
        assert!(err.to_string().contains("500"));

        assert!(ProtocolError::InvalidChunkStreamId(123).to_string().contains("123"));
        assert!(ProtocolError::MissingField("code".into()).to_string().contains("code"));
        assert!(ProtocolError::StreamNotFound(5).to_string().contains("5"));
    }

    #[test]
    fn test_media_error_display() {
        assert!(MediaError::InvalidFlvTag.to_string().contains("FLV"));
        assert!(MediaError::InvalidAvcPacket.to_string().contains("AVC"));
        assert!(MediaError::InvalidAacPacket.to_string().contains("AAC"));
        assert!(MediaError::InvalidHevcRecord.to_string().contains("HEVC"));
        assert!(MediaError::UnsupportedCodec("VP9".into()).to_string().contains("VP9"));
    }
}
