//! Peer connection handler
//!
//! Drives one admitted peer: the reader resolves responses immediately and
//! queues requests for a worker that answers them one at a time, in arrival
//! order. Whatever a request defers runs only after its reply went out.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::peer::Peer;
use crate::protocol::{Message, Request, RequestFrame};
use crate::session::Session;

/// Serve `peer` until its inbound stream ends or the session drops it
pub async fn serve_peer<S>(session: Arc<Session>, peer: Arc<Peer>, mut inbound: S)
where
    S: Stream<Item = String> + Unpin + Send,
{
    let (queue, requests) = mpsc::unbounded_channel();
    let worker = tokio::spawn(process_requests(session.clone(), peer.clone(), requests));
    let closed = peer.channel().closed_token();

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            text = inbound.next() => {
                let Some(text) = text else {
                    break;
                };
                match Message::parse(&text) {
                    Ok(Message::Request(frame)) => {
                        if queue.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Response(frame)) => peer.channel().handle_response(frame),
                    Ok(Message::Notification(frame)) => {
                        debug!(peer_id = %peer.id(), method = %frame.method, "Ignoring client notification");
                    }
                    Err(e) => warn!(peer_id = %peer.id(), error = %e, "Discarding malformed message"),
                }
            }
        }
    }

    drop(queue);
    session.close_peer(&peer);
    // The worker finishes the request in flight, then sees the peer closed
    drop(worker);
    info!(room_id = %session.id(), peer_id = %peer.id(), "Peer connection closed");
}

async fn process_requests(
    session: Arc<Session>,
    peer: Arc<Peer>,
    mut requests: mpsc::UnboundedReceiver<RequestFrame>,
) {
    while let Some(frame) = requests.recv().await {
        if peer.is_closed() {
            break;
        }

        let request = match Request::from_frame(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer_id = %peer.id(), method = %frame.method, error = %e, "Rejecting request");
                peer.channel().reply_error(frame.id, &e).await;
                continue;
            }
        };

        match session.handle_request(&peer, request).await {
            Ok(outcome) => {
                peer.channel().reply(frame.id, &outcome.response).await;
                if let Some(follow_up) = outcome.follow_up {
                    session.follow_up(&peer, follow_up);
                }
            }
            Err(e) => {
                warn!(
                    room_id = %session.id(),
                    peer_id = %peer.id(),
                    method = %frame.method,
                    error = %e,
                    "Request failed"
                );
                peer.channel().reply_error(frame.id, &e).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PeerChannel;
    use crate::protocol::{Message, ResponseFrame};
    use crate::session::tests::{caps, session};
    use crate::types::PeerId;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    struct Client {
        inbound: mpsc::UnboundedSender<String>,
        outbound: mpsc::Receiver<String>,
        peer: Arc<Peer>,
        serving: tokio::task::JoinHandle<()>,
        next_id: u32,
    }

    impl Client {
        fn connect(session: &Arc<Session>, peer_id: &str) -> Self {
            let (tx, outbound) = mpsc::channel(256);
            let channel = PeerChannel::new(tx, Duration::from_secs(2));
            let peer = session.admit(PeerId::from(peer_id), channel).unwrap();
            let (inbound, rx) = mpsc::unbounded_channel();
            let serving = tokio::spawn(serve_peer(
                session.clone(),
                peer.clone(),
                UnboundedReceiverStream::new(rx),
            ));
            Self {
                inbound,
                outbound,
                peer,
                serving,
                next_id: 100,
            }
        }

        fn send(&mut self, method: &str, data: Value) -> u32 {
            self.next_id += 1;
            let frame = json!({ "request": true, "id": self.next_id, "method": method, "data": data });
            self.inbound.send(frame.to_string()).unwrap();
            self.next_id
        }

        async fn next(&mut self) -> Message {
            let text = tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("timed out")
                .expect("closed");
            Message::parse(&text).unwrap()
        }

        /// Answer server requests until the response to `id` arrives
        async fn response(&mut self, id: u32) -> Result<Value, (u16, String)> {
            loop {
                match self.next().await {
                    Message::Response(ResponseFrame { id: got, result }) if got == id => {
                        return result.map_err(|e| (e.code, e.reason));
                    }
                    Message::Request(frame) => {
                        let answer = json!({ "response": true, "id": frame.id, "ok": true, "data": {} });
                        self.inbound.send(answer.to_string()).unwrap();
                    }
                    _ => {}
                }
            }
        }

        async fn call(&mut self, method: &str, data: Value) -> Result<Value, (u16, String)> {
            let id = self.send(method, data);
            self.response(id).await
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected() {
        let (session, _worker) = session(2, 0).await;
        let mut a = Client::connect(&session, "a");

        let err = a.call("fly", json!({})).await.unwrap_err();
        assert_eq!(err.1, "unknown request.method \"fly\"");

        let err = a.call("produce", json!({ "transportId": 5 })).await.unwrap_err();
        assert_eq!(err.0, 400);
    }

    #[tokio::test]
    async fn test_join_reply_precedes_offers() {
        let (session, _worker) = session(2, 0).await;
        let mut a = Client::connect(&session, "a");
        let mut b = Client::connect(&session, "b");

        a.call("createWebRtcTransport", json!({ "consuming": true })).await.unwrap();
        let send = a.call("createWebRtcTransport", json!({ "producing": true })).await.unwrap();
        a.call("join", json!({ "displayName": "A", "rtpCapabilities": caps() })).await.unwrap();
        a.call("produce", json!({ "transportId": send["id"], "kind": "video", "rtpParameters": {} }))
            .await
            .unwrap();

        b.call("createWebRtcTransport", json!({ "consuming": true })).await.unwrap();
        let join_id = b.send("join", json!({ "displayName": "B", "rtpCapabilities": caps() }));

        // The join response must arrive before any newConsumer offer
        match b.next().await {
            Message::Response(frame) => {
                assert_eq!(frame.id, join_id);
                let peers = frame.result.unwrap()["peers"].clone();
                assert_eq!(peers[0]["id"], "a");
            }
            other => panic!("expected join response first, got {other:?}"),
        }
        match b.next().await {
            Message::Request(frame) => assert_eq!(frame.method, "newConsumer"),
            other => panic!("expected newConsumer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_requests_are_answered_in_order() {
        let (session, _worker) = session(2, 0).await;
        let mut a = Client::connect(&session, "a");

        let first = a.send("getRouterRtpCapabilities", Value::Null);
        let second = a.send("join", json!({}));
        let third = a.send("join", json!({}));

        let mut answered = Vec::new();
        while answered.len() < 3 {
            if let Message::Response(frame) = a.next().await {
                answered.push((frame.id, frame.result.is_ok()));
            }
        }
        assert_eq!(answered, vec![(first, true), (second, true), (third, false)]);
    }

    #[tokio::test]
    async fn test_stream_end_closes_peer_and_session() {
        let (session, _worker) = session(2, 0).await;
        let a = Client::connect(&session, "a");

        drop(a.inbound);
        a.serving.await.unwrap();

        assert!(a.peer.is_closed());
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_replaced_peer_connection_ends() {
        let (session, _worker) = session(2, 0).await;
        let first = Client::connect(&session, "a");
        let _second = Client::connect(&session, "a");

        tokio::time::timeout(Duration::from_secs(2), first.serving)
            .await
            .unwrap()
            .unwrap();
        assert!(session.is_open());
        assert_eq!(session.peer_count(), 1);
    }
}
