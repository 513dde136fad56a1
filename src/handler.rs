use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::connection::ConnectionId;
use crate::error::{BoxError, Error};
use crate::util::lock_unpoisoned;

/// What the engine should do after a response part was delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerState {
    Continue,
    /// The response is complete; the connection may be reused.
    Complete,
    /// Stop reading; the connection is discarded.
    Abort,
}

/// Receives the events of one request.
///
/// The engine does not interpret response bytes: the handler decides when a
/// response is complete. A replayed request reuses the same handler, after
/// [`on_retry`](Self::on_retry).
pub trait AsyncHandler: Send + Sync + 'static {
    type Output: Clone + Send + 'static;

    fn on_connection_pooled(&self, _connection: ConnectionId) {}

    fn on_connection_offer(&self, _connection: ConnectionId) {}

    fn on_request_sent(&self) {}

    fn on_retry(&self) {}

    /// Called at most once per request, with its terminal failure.
    fn on_throwable(&self, _error: &Error) {}

    /// Whether the connection may go back to the pool after completion.
    fn keep_alive(&self) -> bool {
        true
    }

    fn on_body_part(&self, part: &[u8]) -> Result<HandlerState, BoxError>;

    fn on_completed(&self) -> Result<Self::Output, BoxError>;
}

type CompletionCheck = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Buffers the whole response.
///
/// Completes when the peer closes the connection, or earlier when the
/// optional completion check accepts the bytes received so far.
pub struct BytesHandler {
    buffer: Mutex<BytesMut>,
    complete_when: Option<CompletionCheck>,
}

impl BytesHandler {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(BytesMut::new()),
            complete_when: None,
        }
    }

    pub fn until<F>(check: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        Self {
            buffer: Mutex::new(BytesMut::new()),
            complete_when: Some(Box::new(check)),
        }
    }
}

impl Default for BytesHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncHandler for BytesHandler {
    type Output = Bytes;

    fn on_retry(&self) {
        lock_unpoisoned(&self.buffer).clear();
    }

    fn keep_alive(&self) -> bool {
        self.complete_when.is_some()
    }

    fn on_body_part(&self, part: &[u8]) -> Result<HandlerState, BoxError> {
        let mut buffer = lock_unpoisoned(&self.buffer);
        buffer.extend_from_slice(part);
        match &self.complete_when {
            Some(check) if check(&buffer) => Ok(HandlerState::Complete),
            _ => Ok(HandlerState::Continue),
        }
    }

    fn on_completed(&self) -> Result<Self::Output, BoxError> {
        Ok(lock_unpoisoned(&self.buffer).split().freeze())
    }
}

/// A shared handler, so the caller can keep inspecting it while the request
/// runs.
impl<H: AsyncHandler> AsyncHandler for Arc<H> {
    type Output = H::Output;

    fn on_connection_pooled(&self, connection: ConnectionId) {
        (**self).on_connection_pooled(connection);
    }

    fn on_connection_offer(&self, connection: ConnectionId) {
        (**self).on_connection_offer(connection);
    }

    fn on_request_sent(&self) {
        (**self).on_request_sent();
    }

    fn on_retry(&self) {
        (**self).on_retry();
    }

    fn on_throwable(&self, error: &Error) {
        (**self).on_throwable(error);
    }

    fn keep_alive(&self) -> bool {
        (**self).keep_alive()
    }

    fn on_body_part(&self, part: &[u8]) -> Result<HandlerState, BoxError> {
        (**self).on_body_part(part)
    }

    fn on_completed(&self) -> Result<Self::Output, BoxError> {
        (**self).on_completed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_handler_completes_when_check_accepts() {
        let handler = BytesHandler::until(|bytes| bytes.ends_with(b"\r\n\r\n"));
        assert_eq!(
            handler.on_body_part(b"HTTP/1.1 204 No Content\r\n").expect("part"),
            HandlerState::Continue
        );
        assert_eq!(
            handler.on_body_part(b"\r\n").expect("part"),
            HandlerState::Complete
        );
        let output = handler.on_completed().expect("output");
        assert_eq!(&output[..], b"HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[test]
    fn bytes_handler_without_check_waits_for_close() {
        let handler = BytesHandler::new();
        assert!(!handler.keep_alive());
        assert_eq!(
            handler.on_body_part(b"partial").expect("part"),
            HandlerState::Continue
        );
        handler.on_retry();
        let output = handler.on_completed().expect("output");
        assert!(output.is_empty());
    }
}
