//! NetConnection / NetStream status codes and events

use std::fmt;

use crate::amf::AmfValue;

/// Severity carried in the `level` field of a status object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Status,
    Warning,
    Error,
}

impl StatusLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusLevel::Status => "status",
            StatusLevel::Warning => "warning",
            StatusLevel::Error => "error",
        }
    }

    pub fn parse(level: &str) -> Self {
        match level {
            "error" => StatusLevel::Error,
            "warning" => StatusLevel::Warning,
            _ => StatusLevel::Status,
        }
    }
}

/// Status codes raised by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCode {
    CallBadVersion,
    CallFailed,
    CallProhibited,
    ConnectAppShutdown,
    ConnectClosed,
    ConnectFailed,
    ConnectIdleTimeOut,
    ConnectInvalidApp,
    ConnectNetworkChange,
    ConnectRejected,
    ConnectSuccess,
}

impl ConnectionCode {
    const ALL: [ConnectionCode; 11] = [
        ConnectionCode::CallBadVersion,
        ConnectionCode::CallFailed,
        ConnectionCode::CallProhibited,
        ConnectionCode::ConnectAppShutdown,
        ConnectionCode::ConnectClosed,
        ConnectionCode::ConnectFailed,
        ConnectionCode::ConnectIdleTimeOut,
        ConnectionCode::ConnectInvalidApp,
        ConnectionCode::ConnectNetworkChange,
        ConnectionCode::ConnectRejected,
        ConnectionCode::ConnectSuccess,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionCode::CallBadVersion => "NetConnection.Call.BadVersion",
            ConnectionCode::CallFailed => "NetConnection.Call.Failed",
            ConnectionCode::CallProhibited => "NetConnection.Call.Prohibited",
            ConnectionCode::ConnectAppShutdown => "NetConnection.Connect.AppShutdown",
            ConnectionCode::ConnectClosed => "NetConnection.Connect.Closed",
            ConnectionCode::ConnectFailed => "NetConnection.Connect.Failed",
            ConnectionCode::ConnectIdleTimeOut => "NetConnection.Connect.IdleTimeOut",
            ConnectionCode::ConnectInvalidApp => "NetConnection.Connect.InvalidApp",
            ConnectionCode::ConnectNetworkChange => "NetConnection.Connect.NetworkChange",
            ConnectionCode::ConnectRejected => "NetConnection.Connect.Rejected",
            ConnectionCode::ConnectSuccess => "NetConnection.Connect.Success",
        }
    }

    pub fn level(self) -> StatusLevel {
        match self {
            ConnectionCode::CallBadVersion
            | ConnectionCode::CallFailed
            | ConnectionCode::CallProhibited
            | ConnectionCode::ConnectFailed
            | ConnectionCode::ConnectInvalidApp => StatusLevel::Error,
            _ => StatusLevel::Status,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }

    /// Status event for this code raised locally by the connection
    pub fn event(self, description: impl Into<String>) -> StatusEvent {
        StatusEvent {
            code: self.as_str().to_string(),
            level: self.level(),
            description: description.into(),
            stream_id: 0,
        }
    }
}

/// Status codes raised by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCode {
    PublishStart,
    PublishBadName,
    PublishFailed,
    UnpublishSuccess,
    PlayStart,
    PlayReset,
    PlayStop,
    PlayStreamNotFound,
    PlayFailed,
    PauseNotify,
    UnpauseNotify,
}

impl StreamCode {
    const ALL: [StreamCode; 11] = [
        StreamCode::PublishStart,
        StreamCode::PublishBadName,
        StreamCode::PublishFailed,
        StreamCode::UnpublishSuccess,
        StreamCode::PlayStart,
        StreamCode::PlayReset,
        StreamCode::PlayStop,
        StreamCode::PlayStreamNotFound,
        StreamCode::PlayFailed,
        StreamCode::PauseNotify,
        StreamCode::UnpauseNotify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamCode::PublishStart => "NetStream.Publish.Start",
            StreamCode::PublishBadName => "NetStream.Publish.BadName",
            StreamCode::PublishFailed => "NetStream.Failed",
            StreamCode::UnpublishSuccess => "NetStream.Unpublish.Success",
            StreamCode::PlayStart => "NetStream.Play.Start",
            StreamCode::PlayReset => "NetStream.Play.Reset",
            StreamCode::PlayStop => "NetStream.Play.Stop",
            StreamCode::PlayStreamNotFound => "NetStream.Play.StreamNotFound",
            StreamCode::PlayFailed => "NetStream.Play.Failed",
            StreamCode::PauseNotify => "NetStream.Pause.Notify",
            StreamCode::UnpauseNotify => "NetStream.Unpause.Notify",
        }
    }

    pub fn level(self) -> StatusLevel {
        match self {
            StreamCode::PublishBadName
            | StreamCode::PublishFailed
            | StreamCode::PlayStreamNotFound
            | StreamCode::PlayFailed => StatusLevel::Error,
            _ => StatusLevel::Status,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }
}

/// A `{code, level, description}` status notification
///
/// Codes are kept as strings since servers send codes outside the known
/// tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub code: String,
    pub level: StatusLevel,
    pub description: String,
    /// Message stream the event concerns; 0 for the connection itself
    pub stream_id: u32,
}

impl StatusEvent {
    /// Read a status info object as carried by `onStatus` / `_result` / `_error`
    pub fn from_info(info: &AmfValue, stream_id: u32) -> Option<Self> {
        let code = info.get_string("code")?;
        Some(Self {
            code: code.to_string(),
            level: StatusLevel::parse(info.get_string("level").unwrap_or("status")),
            description: info.get_string("description").unwrap_or_default().to_string(),
            stream_id,
        })
    }

    pub fn to_amf(&self) -> AmfValue {
        let mut info =
            AmfValue::object([("level", self.level.as_str()), ("code", self.code.as_str())]);
        if !self.description.is_empty() {
            info.insert("description", self.description.as_str());
        }
        info
    }

    pub fn is_error(&self) -> bool {
        self.level == StatusLevel::Error
    }

    pub fn connection_code(&self) -> Option<ConnectionCode> {
        ConnectionCode::from_code(&self.code)
    }

    pub fn stream_code(&self) -> Option<StreamCode> {
        StreamCode::from_code(&self.code)
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.level.as_str())?;
        if !self.description.is_empty() {
            write!(f, ": {}", self.description)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_code_levels() {
        assert_eq!(ConnectionCode::ConnectSuccess.level(), StatusLevel::Status);
        assert_eq!(ConnectionCode::ConnectRejected.level(), StatusLevel::Status);
        assert_eq!(ConnectionCode::ConnectFailed.level(), StatusLevel::Error);
        assert_eq!(ConnectionCode::ConnectInvalidApp.level(), StatusLevel::Error);
        assert_eq!(
            ConnectionCode::from_code("NetConnection.Connect.IdleTimeOut"),
            Some(ConnectionCode::ConnectIdleTimeOut)
        );
    }

    #[test]
    fn test_stream_code_lookup() {
        assert_eq!(
            StreamCode::from_code("NetStream.Publish.Start"),
            Some(StreamCode::PublishStart)
        );
        assert_eq!(StreamCode::from_code("NetStream.Custom"), None);
        assert!(StreamCode::PlayStreamNotFound.level() == StatusLevel::Error);
    }

    #[test]
    fn test_event_from_info() {
        let info = AmfValue::object([
            ("level", "error"),
            ("code", "NetStream.Publish.BadName"),
            ("description", "Stream already publishing"),
        ]);
        let event = StatusEvent::from_info(&info, 1).unwrap();
        assert!(event.is_error());
        assert_eq!(event.stream_code(), Some(StreamCode::PublishBadName));
        assert_eq!(event.stream_id, 1);
        assert_eq!(StatusEvent::from_info(&AmfValue::Null, 0), None);
    }

    #[test]
    fn test_event_to_amf_skips_empty_description() {
        let event = ConnectionCode::ConnectClosed.event("");
        let info = event.to_amf();
        assert_eq!(info.get_string("code"), Some("NetConnection.Connect.Closed"));
        assert!(info.get("description").is_none());
    }
}
