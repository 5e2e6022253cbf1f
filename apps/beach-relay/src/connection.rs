use std::{
    borrow::Cow,
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use axum::extract::ws::{close_code, CloseFrame, Message};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_OUTBOUND_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Handle for one live peer transport.
///
/// The session that accepted the socket owns the receiving half of the
/// outbound queue and is the only writer to the socket; everyone else (the
/// router forwarding calls, the registry closing it) enqueues frames through
/// this handle. The cancellation token is the connection's lifecycle: once
/// cancelled, the session's read loop and writer both wind down.
#[derive(Debug)]
pub struct PeerConnection {
    id: Uuid,
    peer_id: String,
    headers: HashMap<String, String>,
    connected_at: DateTime<Utc>,
    remote_addr: Option<SocketAddr>,
    client_ip: String,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    close_sent: AtomicBool,
}

impl PeerConnection {
    pub fn new(peer_id: impl Into<String>, queue_depth: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let conn = Self {
            id: Uuid::new_v4(),
            peer_id: peer_id.into(),
            headers: HashMap::new(),
            connected_at: Utc::now(),
            remote_addr: None,
            client_ip: String::new(),
            outbound: tx,
            cancel: CancellationToken::new(),
            close_sent: AtomicBool::new(false),
        };
        (conn, rx)
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_addresses(mut self, remote_addr: Option<SocketAddr>, client_ip: String) -> Self {
        self.remote_addr = remote_addr;
        self.client_ip = client_ip;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn lifecycle(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }

    /// Queue a frame for the session's writer. Waits for queue space, but gives
    /// up as soon as the connection is cancelled.
    pub async fn send(&self, message: Message) -> Result<(), ConnectionClosed> {
        if self.cancel.is_cancelled() {
            return Err(ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnectionClosed),
            result = self.outbound.send(message) => result.map_err(|_| ConnectionClosed),
        }
    }

    /// Queue a normal-closure close frame and cancel the connection. Safe to
    /// call more than once, from any number of tasks; only the first call
    /// queues a frame, and none does after a plain [`cancel`](Self::cancel).
    pub fn close(&self, reason: &'static str) {
        if self.cancel.is_cancelled() || self.close_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outbound.try_send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed(reason),
        })));
        self.cancel.cancel();
    }

    /// Cancel without sending a close frame (the socket is already gone).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn send_enqueues_until_closed() {
        let (conn, mut rx) = PeerConnection::new("peer-a", 4);
        conn.send(Message::Binary(b"one".to_vec())).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Message::Binary(bytes)) if bytes == b"one"));

        conn.close("peer offline");
        assert!(conn.is_closed());
        match rx.recv().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, close_code::NORMAL);
                assert_eq!(frame.reason, "peer offline");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(conn.send(Message::Binary(b"two".to_vec())).await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent() {
        let (conn, mut rx) = PeerConnection::new("peer-a", 4);
        conn.close("peer offline");
        conn.close("peer offline");
        assert!(matches!(rx.recv().await, Some(Message::Close(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn send_fails_once_the_writer_is_gone() {
        let (conn, rx) = PeerConnection::new("peer-a", 1);
        drop(rx);
        assert!(conn.send(Message::Text("x".into())).await.is_err());
        assert!(conn.is_closed());
    }

    #[test_timeout::timeout]
    fn concurrent_closes_queue_one_frame() {
        let (conn, mut rx) = PeerConnection::new("peer-a", 16);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| conn.close("peer offline"));
            }
        });

        assert!(matches!(rx.try_recv(), Ok(Message::Close(_))));
        assert!(rx.try_recv().is_err());
        assert!(conn.is_closed());
    }
}
