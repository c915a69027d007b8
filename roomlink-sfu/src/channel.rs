//! Per-peer signaling channel
//!
//! Owns the outbound half of a peer's WebSocket (as an mpsc queue drained by
//! the connection's writer task) and the table of server-initiated requests
//! still waiting for an answer.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::protocol::{self, Notification, RemoteError, ResponseFrame, ServerRequest};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("request timed out")]
    Timeout,

    #[error("request rejected ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

type PendingResponse = oneshot::Sender<Result<Value, RemoteError>>;

pub struct PeerChannel {
    outbound: mpsc::Sender<String>,
    pending: Mutex<HashMap<u32, PendingResponse>>,
    next_request_id: AtomicU32,
    request_timeout: Duration,
    closed: CancellationToken,
}

impl PeerChannel {
    #[must_use]
    pub fn new(outbound: mpsc::Sender<String>, request_timeout: Duration) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU32::new(1),
            request_timeout,
            closed: CancellationToken::new(),
        }
    }

    /// Best-effort notification; dropped when the peer is gone or its queue is full
    pub fn notify(&self, notification: &Notification) {
        if self.is_closed() {
            return;
        }
        let frame = match protocol::encode_notification(notification) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode notification");
                return;
            }
        };
        if let Err(e) = self.outbound.try_send(frame) {
            debug!(error = %e, "Dropping notification");
        }
    }

    pub async fn reply(&self, id: u32, data: &Value) {
        match protocol::encode_success(id, data) {
            Ok(frame) => self.send(frame).await,
            Err(e) => warn!(request_id = id, error = %e, "Failed to encode response"),
        }
    }

    pub async fn reply_error(&self, id: u32, error: &ProtocolError) {
        match protocol::encode_error(id, error.code(), &error.to_string()) {
            Ok(frame) => self.send(frame).await,
            Err(e) => warn!(request_id = id, error = %e, "Failed to encode error response"),
        }
    }

    /// Send a server-initiated request and wait for the peer's answer
    pub async fn request(&self, request: &ServerRequest) -> Result<Value, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = protocol::encode_request(id, request)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.outbound.send(frame).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(ChannelError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ChannelError::Timeout)
            }
            // Sender dropped by close()
            Ok(Err(_)) => Err(ChannelError::Closed),
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(remote))) => Err(ChannelError::Rejected {
                code: remote.code,
                reason: remote.reason,
            }),
        }
    }

    /// Route a response frame to the request waiting for it
    pub fn handle_response(&self, frame: ResponseFrame) {
        match self.pending.lock().remove(&frame.id) {
            Some(tx) => {
                let _ = tx.send(frame.result);
            }
            None => debug!(request_id = frame.id, "Response for unknown request"),
        }
    }

    /// Stop sending and fail every pending request
    pub fn close(&self) {
        self.closed.cancel();
        self.pending.lock().clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn send(&self, frame: String) {
        if self.is_closed() {
            return;
        }
        if self.outbound.send(frame).await.is_err() {
            debug!("Peer writer gone, dropping frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, NewDataConsumer};
    use serde_json::json;
    use std::sync::Arc;

    fn request() -> ServerRequest {
        ServerRequest::NewDataConsumer(NewDataConsumer {
            peer_id: None,
            data_producer_id: "dp".to_string(),
            id: "dc".to_string(),
            sctp_stream_parameters: None,
            label: "bot".to_string(),
            protocol: String::new(),
            app_data: json!({}),
        })
    }

    fn outgoing_id(text: &str) -> u32 {
        match Message::parse(text).unwrap() {
            Message::Request(frame) => frame.id,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_resolves_with_response() {
        let (tx, mut rx) = mpsc::channel(8);
        let channel = Arc::new(PeerChannel::new(tx, Duration::from_secs(5)));

        let requester = channel.clone();
        let pending = tokio::spawn(async move { requester.request(&request()).await });

        let id = outgoing_id(&rx.recv().await.unwrap());
        channel.handle_response(ResponseFrame {
            id,
            result: Ok(json!({"accepted": true})),
        });

        assert_eq!(pending.await.unwrap().unwrap(), json!({"accepted": true}));
    }

    #[tokio::test]
    async fn test_rejected_request() {
        let (tx, mut rx) = mpsc::channel(8);
        let channel = Arc::new(PeerChannel::new(tx, Duration::from_secs(5)));

        let requester = channel.clone();
        let pending = tokio::spawn(async move { requester.request(&request()).await });

        let id = outgoing_id(&rx.recv().await.unwrap());
        channel.handle_response(ResponseFrame {
            id,
            result: Err(RemoteError {
                code: 500,
                reason: "nope".to_string(),
            }),
        });

        assert!(matches!(
            pending.await.unwrap(),
            Err(ChannelError::Rejected { code: 500, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let (tx, _rx) = mpsc::channel(8);
        let channel = PeerChannel::new(tx, Duration::from_secs(20));

        let result = channel.request(&request()).await;
        assert!(matches!(result, Err(ChannelError::Timeout)));
        assert!(channel.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (tx, mut rx) = mpsc::channel(8);
        let channel = Arc::new(PeerChannel::new(tx, Duration::from_secs(5)));

        let requester = channel.clone();
        let pending = tokio::spawn(async move { requester.request(&request()).await });
        let _ = rx.recv().await.unwrap();

        channel.close();

        assert!(matches!(pending.await.unwrap(), Err(ChannelError::Closed)));
        assert!(matches!(channel.request(&request()).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_notify_drops_when_queue_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = PeerChannel::new(tx, Duration::from_secs(5));
        let note = Notification::PeerClosed {
            peer_id: "a".to_string(),
        };

        channel.notify(&note);
        channel.notify(&note);

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
