//! Callbacks for `RtmpConnection::call` responses

use crate::amf::AmfValue;

/// Receives the reply to a command sent with [`call`](super::RtmpConnection::call)
///
/// `_result` replies go to `on_result`, `_error` replies to `on_status`.
/// Arguments exclude the command object.
pub trait Responder: Send + Sync {
    fn on_result(&self, arguments: &[AmfValue]);

    fn on_status(&self, arguments: &[AmfValue]);
}

/// Responder that ignores every reply
#[derive(Debug, Clone, Copy, Default)]
pub struct NullResponder;

impl Responder for NullResponder {
    fn on_result(&self, _arguments: &[AmfValue]) {}

    fn on_status(&self, _arguments: &[AmfValue]) {}
}

/// Responder backed by a oneshot channel, resolved by the first reply
///
/// `Ok(args)` for `_result`, `Err(args)` for `_error`.
pub struct OneshotResponder {
    tx: parking_lot::Mutex<Option<tokio::sync::oneshot::Sender<Reply>>>,
}

pub type Reply = std::result::Result<Vec<AmfValue>, Vec<AmfValue>>;

impl OneshotResponder {
    pub fn new() -> (Self, tokio::sync::oneshot::Receiver<Reply>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (
            Self {
                tx: parking_lot::Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn resolve(&self, reply: Reply) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(reply);
        }
    }
}

impl Responder for OneshotResponder {
    fn on_result(&self, arguments: &[AmfValue]) {
        self.resolve(Ok(arguments.to_vec()));
    }

    fn on_status(&self, arguments: &[AmfValue]) {
        self.resolve(Err(arguments.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_oneshot_resolves_once() {
        let (responder, rx) = OneshotResponder::new();
        responder.on_result(&[AmfValue::Number(1.0)]);
        responder.on_status(&[AmfValue::Null]);
        assert_eq!(rx.await.unwrap(), Ok(vec![AmfValue::Number(1.0)]));
    }

    #[tokio::test]
    async fn test_oneshot_error_reply() {
        let (responder, rx) = OneshotResponder::new();
        responder.on_status(&[AmfValue::String("failed".into())]);
        assert!(rx.await.unwrap().is_err());
    }
}
