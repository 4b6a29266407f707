//! Per-socket connection state and the write pump.
//!
//! The hub never owns a socket. It holds a [`ConnectionHandle`] per
//! connection: the bounded outbound queue's sender plus a cancellation
//! token that tears both socket tasks down. The socket tasks own the two
//! halves of the WebSocket; the write pump here drains the queue, the read
//! pump lives with the session handler.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::protocol::{Envelope, ErrorCode};

/// Opaque connection handle id, unique within a hub.
pub type ConnectionId = Uuid;

/// The hub-side view of one authenticated socket.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: u64,
    pub username: String,
    sender: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle and the receiving end of its outbound queue.
    pub fn new(
        user_id: u64,
        username: impl Into<String>,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            username: username.into(),
            sender,
            cancel: CancellationToken::new(),
        });
        (handle, receiver)
    }

    /// Non-blocking enqueue of a pre-encoded frame. Returns `false` when
    /// the queue is full or closed; the frame is dropped, never retried.
    pub fn try_send(&self, frame: Vec<u8>) -> bool {
        self.sender.try_send(frame).is_ok()
    }

    /// Encodes and enqueues an envelope, dropping it on a full queue.
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(bytes) => self.try_send(bytes),
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "failed to encode outbound frame");
                false
            }
        }
    }

    /// Enqueues an `error` frame echoing the originating request id.
    pub fn send_error(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        request_id: Option<String>,
    ) -> bool {
        self.send_envelope(&Envelope::error(code, message, request_id))
    }

    /// Signals both socket tasks to stop. Idempotent.
    pub fn shut_down(&self) {
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token the socket tasks select on.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Drains the outbound queue onto the socket and runs the heartbeat.
///
/// Exits when the connection is shut down, the queue closes, or a write
/// misses its deadline; on exit the socket is closed.
pub async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    config: DeliveryConfig,
) {
    let mut heartbeat = interval_at(Instant::now() + config.ping_period, config.ping_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                // Frames are always JSON produced by the codec.
                let Ok(text) = String::from_utf8(frame) else { continue };
                match timeout(config.write_deadline, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, "socket write failed");
                        break;
                    }
                    Err(_) => {
                        debug!("socket write missed its deadline");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                let ping = sink.send(Message::Ping(Vec::new()));
                if timeout(config.write_deadline, ping).await.map_or(true, |r| r.is_err()) {
                    debug!("heartbeat ping failed");
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RoomRef, ServerFrame};

    #[test]
    fn try_send_drops_when_queue_is_full() {
        let (handle, _rx) = ConnectionHandle::new(1, "alice", 2);
        assert!(handle.try_send(b"one".to_vec()));
        assert!(handle.try_send(b"two".to_vec()));
        assert!(!handle.try_send(b"three".to_vec()));
    }

    #[test]
    fn try_send_fails_after_receiver_drops() {
        let (handle, rx) = ConnectionHandle::new(1, "alice", 2);
        drop(rx);
        assert!(!handle.try_send(b"frame".to_vec()));
    }

    #[tokio::test]
    async fn enqueued_frames_preserve_order() {
        let (handle, mut rx) = ConnectionHandle::new(1, "alice", 8);
        for i in 0..4 {
            assert!(handle.send_envelope(&Envelope::new(ServerFrame::RoomJoined(RoomRef {
                room_id: i,
            }))));
        }
        for i in 0..4 {
            let bytes = rx.recv().await.unwrap();
            let envelope = Envelope::decode(&bytes).unwrap();
            assert!(matches!(envelope.frame, ServerFrame::RoomJoined(r) if r.room_id == i));
        }
    }

    #[test]
    fn shut_down_is_idempotent() {
        let (handle, _rx) = ConnectionHandle::new(1, "alice", 2);
        assert!(!handle.is_shut_down());
        handle.shut_down();
        handle.shut_down();
        assert!(handle.is_shut_down());
    }
}
