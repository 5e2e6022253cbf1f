//! One peer connection from upgrade to close.
//!
//! A session registers its connection, reads frames until the socket ends or
//! the connection's lifecycle token is cancelled, and always unregisters on the
//! way out. All writes go through the connection's outbound queue, drained by a
//! single writer task.

use std::{
    fmt::Display,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use async_trait::async_trait;
use axum::extract::ws::{close_code, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    connection::PeerConnection,
    correlator::CallCorrelator,
    frame::{CallRequest, CallResponse},
    router::Relay,
};

/// Application-level handling of a request frame a peer sent on its own
/// connection. The relay's implementation forwards it to the addressed peer.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// Returns the response to write back to the calling peer, if any.
    async fn handle_call(&self, request: CallRequest) -> Option<CallResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the socket or the stream ended.
    ClosedNormal,
    /// A read failed or the peer sent an unusable frame.
    ClosedError,
    /// The connection's lifecycle token was cancelled.
    ClosedCancelled,
}

impl SessionEnd {
    fn label(self) -> &'static str {
        match self {
            SessionEnd::ClosedNormal => "normal",
            SessionEnd::ClosedError => "error",
            SessionEnd::ClosedCancelled => "cancelled",
        }
    }
}

/// Drive one connection until it ends. `reader` and `writer` are the two
/// halves of the peer's socket; `outbound` is the queue paired with `conn`.
pub async fn run_session<R, W, E>(
    reader: R,
    writer: W,
    conn: Arc<PeerConnection>,
    outbound: mpsc::Receiver<Message>,
    relay: Arc<Relay>,
    handler: Arc<dyn CallHandler>,
) -> SessionEnd
where
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
{
    let writer_task = tokio::spawn(
        write_loop(writer, outbound, conn.lifecycle().clone())
            .instrument(tracing::debug_span!("writer", connection_id = %conn.id())),
    );

    relay.registry().register(conn.clone());
    counter!("beach_relay_connections_total").increment(1);
    record_gauges(&relay);
    info!(
        peer_id = %conn.peer_id(),
        connection_id = %conn.id(),
        client_ip = %conn.client_ip(),
        connections = relay.registry().connections_for(conn.peer_id()),
        "peer connected"
    );

    let end = read_loop(reader, &conn, relay.correlator(), &handler).await;

    relay.registry().unregister(&conn);
    conn.cancel();
    if let Err(err) = writer_task.await {
        warn!(connection_id = %conn.id(), error = %err, "writer task failed");
    }

    counter!("beach_relay_connections_closed_total", "reason" => end.label()).increment(1);
    record_gauges(&relay);
    info!(
        peer_id = %conn.peer_id(),
        connection_id = %conn.id(),
        reason = end.label(),
        "peer disconnected"
    );
    end
}

async fn read_loop<R, E>(
    mut reader: R,
    conn: &Arc<PeerConnection>,
    correlator: &CallCorrelator,
    handler: &Arc<dyn CallHandler>,
) -> SessionEnd
where
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    let lifecycle = conn.lifecycle().clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = lifecycle.cancelled() => return SessionEnd::ClosedCancelled,
            next = reader.next() => next,
        };

        let message = match next {
            None => return SessionEnd::ClosedNormal,
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                log_read_error(conn, &err);
                return SessionEnd::ClosedError;
            }
        };

        match message {
            Message::Text(text) => {
                debug!(connection_id = %conn.id(), len = text.len(), "reply frame");
                if text.is_empty() {
                    warn!(connection_id = %conn.id(), "empty reply frame");
                    return SessionEnd::ClosedError;
                }
                match CallResponse::from_bytes(text.as_bytes()) {
                    Ok(response) => dispatch_reply(correlator, response),
                    Err(err) => {
                        warn!(connection_id = %conn.id(), error = %err, "undecodable reply frame");
                        return SessionEnd::ClosedError;
                    }
                }
            }
            Message::Binary(bytes) => {
                debug!(connection_id = %conn.id(), len = bytes.len(), "request frame");
                if bytes.is_empty() {
                    warn!(connection_id = %conn.id(), "empty request frame");
                    return SessionEnd::ClosedError;
                }
                match CallRequest::from_bytes(&bytes) {
                    Ok(request) => spawn_call(conn, handler, request),
                    Err(err) => {
                        counter!("beach_relay_malformed_frames_total").increment(1);
                        debug!(connection_id = %conn.id(), error = %err, "malformed request frame");
                        let reply = Message::Text(CallResponse::malformed().to_text());
                        if conn.send(reply).await.is_err() {
                            return SessionEnd::ClosedCancelled;
                        }
                    }
                }
            }
            Message::Close(frame) => {
                match &frame {
                    Some(frame)
                        if frame.code != close_code::NORMAL && frame.code != close_code::AWAY =>
                    {
                        warn!(
                            connection_id = %conn.id(),
                            code = frame.code,
                            reason = %frame.reason,
                            "peer closed with error status"
                        );
                    }
                    _ => debug!(connection_id = %conn.id(), "peer closed websocket"),
                }
                return SessionEnd::ClosedNormal;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Hand a reply to its waiting call. Delivery must never unwind into the read
/// loop, so a panic here is contained and logged.
fn dispatch_reply(correlator: &CallCorrelator, response: CallResponse) {
    let call_id = response.call_id.clone();
    match catch_unwind(AssertUnwindSafe(|| correlator.deliver(response))) {
        Ok(true) => {}
        Ok(false) => {
            counter!("beach_relay_unmatched_replies_total").increment(1);
        }
        Err(_) => {
            error!(call_id = %call_id, "reply dispatch panicked");
        }
    }
}

fn spawn_call(conn: &Arc<PeerConnection>, handler: &Arc<dyn CallHandler>, request: CallRequest) {
    let conn = Arc::clone(conn);
    let handler = Arc::clone(handler);
    let span = tracing::debug_span!(
        "inbound_call",
        from_peer = %conn.peer_id(),
        call_id = %request.call_id,
    );
    tokio::spawn(
        async move {
            // Closing the connection abandons its calls, releasing their
            // correlator slots instead of waiting out the deadline.
            let lifecycle = conn.lifecycle().clone();
            let handled = tokio::select! {
                biased;
                _ = lifecycle.cancelled() => {
                    debug!("caller connection closed; abandoning call");
                    return;
                }
                handled = handler.handle_call(request) => handled,
            };
            let Some(response) = handled else {
                return;
            };
            if conn.send(Message::Text(response.to_text())).await.is_err() {
                debug!("caller connection closed before response could be written");
            }
        }
        .instrument(span),
    );
}

async fn write_loop<W>(mut sink: W, mut outbound: mpsc::Receiver<Message>, lifecycle: CancellationToken)
where
    W: Sink<Message> + Unpin + Send,
    W::Error: Display + Send,
{
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = lifecycle.cancelled() => {
                // Flush what was queued before cancellation, typically the
                // close frame from unregistering.
                while let Ok(message) = outbound.try_recv() {
                    let closing = matches!(message, Message::Close(_));
                    if sink.send(message).await.is_err() || closing {
                        break;
                    }
                }
                break;
            }
        };

        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            debug!(error = %err, "socket write failed");
            lifecycle.cancel();
            break;
        }
        if closing {
            lifecycle.cancel();
            break;
        }
    }
    let _ = sink.close().await;
}

/// Normal closure, going-away, resets and truncated streams are routine ends
/// for a peer socket; anything else is worth a warning.
fn log_read_error(conn: &PeerConnection, err: &impl Display) {
    let text = err.to_string();
    let lowered = text.to_ascii_lowercase();
    let expected = [
        "connection reset",
        "reset by peer",
        "without closing handshake",
        "unexpected eof",
        "corrupt",
        "broken pipe",
        "already closed",
        "connection closed",
    ]
    .iter()
    .any(|needle| lowered.contains(needle));

    if expected {
        info!(connection_id = %conn.id(), error = %text, "websocket closed");
    } else {
        warn!(connection_id = %conn.id(), error = %text, "failed to read websocket frame");
    }
}

fn record_gauges(relay: &Relay) {
    gauge!("beach_relay_connections_active").set(relay.registry().connection_count() as f64);
    gauge!("beach_relay_peers_active").set(relay.registry().peer_count() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CallStatus;
    use std::{io, time::Duration};
    use tokio_util::sync::PollSender;

    type Inbound = mpsc::UnboundedSender<Result<Message, io::Error>>;

    struct Harness {
        inbound: Inbound,
        written: mpsc::Receiver<Message>,
        conn: Arc<PeerConnection>,
        session: tokio::task::JoinHandle<SessionEnd>,
    }

    struct Echo;

    #[async_trait]
    impl CallHandler for Echo {
        async fn handle_call(&self, request: CallRequest) -> Option<CallResponse> {
            if request.method == "silent" {
                return None;
            }
            Some(CallResponse::ok(request.call_id, request.method, request.data))
        }
    }

    struct Panicky;

    #[async_trait]
    impl CallHandler for Panicky {
        async fn handle_call(&self, _request: CallRequest) -> Option<CallResponse> {
            panic!("handler blew up");
        }
    }

    fn start(relay: &Arc<Relay>, peer_id: &str, handler: Arc<dyn CallHandler>) -> Harness {
        let (inbound, inbound_rx) = mpsc::unbounded_channel::<Result<Message, io::Error>>();
        let reader = futures_util::stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let reader = Box::pin(reader);
        let (sink_tx, written) = mpsc::channel(16);
        let writer = PollSender::new(sink_tx);

        let (conn, outbound) = PeerConnection::new(peer_id, 16);
        let conn = Arc::new(conn);
        let session = tokio::spawn(run_session(
            reader,
            writer,
            conn.clone(),
            outbound,
            relay.clone(),
            handler,
        ));
        Harness {
            inbound,
            written,
            conn,
            session,
        }
    }

    async fn wait_registered(relay: &Relay, peer_id: &str) {
        while !relay.registry().contains(peer_id) {
            tokio::task::yield_now().await;
        }
    }

    async fn next_text(written: &mut mpsc::Receiver<Message>) -> CallResponse {
        match written.recv().await {
            Some(Message::Text(text)) => CallResponse::from_bytes(text.as_bytes()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn registers_and_unregisters_around_the_socket() {
        let relay = Relay::shared(Duration::from_secs(5));
        let harness = start(&relay, "peer-a", Arc::new(Echo));
        wait_registered(&relay, "peer-a").await;
        assert_eq!(relay.registry().connections_for("peer-a"), 1);

        drop(harness.inbound);
        assert_eq!(harness.session.await.unwrap(), SessionEnd::ClosedNormal);
        assert!(!relay.registry().contains("peer-a"));
        assert!(harness.conn.is_closed());
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_request_is_answered_and_session_survives() {
        let relay = Relay::shared(Duration::from_secs(5));
        let mut harness = start(&relay, "peer-a", Arc::new(Echo));

        harness
            .inbound
            .send(Ok(Message::Binary(b"{not json".to_vec())))
            .unwrap();
        assert_eq!(next_text(&mut harness.written).await, CallResponse::malformed());

        let request = CallRequest::new("peer-b", "c2", "echo", b"hi".to_vec());
        harness
            .inbound
            .send(Ok(Message::Binary(request.to_bytes())))
            .unwrap();
        let response = next_text(&mut harness.written).await;
        assert_eq!(response.call_id, "c2");
        assert_eq!(response.data, b"hi");

        drop(harness.inbound);
        assert_eq!(harness.session.await.unwrap(), SessionEnd::ClosedNormal);
    }

    #[test_timeout::tokio_timeout_test]
    async fn empty_handler_result_writes_nothing() {
        let relay = Relay::shared(Duration::from_secs(5));
        let mut harness = start(&relay, "peer-a", Arc::new(Echo));

        let silent = CallRequest::new("peer-b", "c1", "silent", Vec::new());
        let loud = CallRequest::new("peer-b", "c2", "echo", Vec::new());
        harness.inbound.send(Ok(Message::Binary(silent.to_bytes()))).unwrap();
        harness.inbound.send(Ok(Message::Binary(loud.to_bytes()))).unwrap();

        assert_eq!(next_text(&mut harness.written).await.call_id, "c2");
        drop(harness.inbound);
        harness.session.await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn reply_frames_reach_the_correlator() {
        let relay = Relay::shared(Duration::from_secs(5));
        let harness = start(&relay, "peer-a", Arc::new(Echo));
        let pending = relay.correlator().register("c1");

        let reply = CallResponse::ok("c1", "ping", b"pong".to_vec());
        harness.inbound.send(Ok(Message::Text(reply.to_text()))).unwrap();
        // An unmatched reply is dropped without ending the session.
        let stray = CallResponse::ok("unknown", "ping", Vec::new());
        harness.inbound.send(Ok(Message::Text(stray.to_text()))).unwrap();

        match pending.wait(Duration::from_secs(5)).await {
            crate::correlator::CallOutcome::Delivered(response) => {
                assert_eq!(response.status, CallStatus::Ok);
                assert_eq!(response.data, b"pong");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!harness.session.is_finished());
        drop(harness.inbound);
        assert_eq!(harness.session.await.unwrap(), SessionEnd::ClosedNormal);
    }

    #[test_timeout::tokio_timeout_test]
    async fn undecodable_reply_ends_the_session() {
        let relay = Relay::shared(Duration::from_secs(5));
        let harness = start(&relay, "peer-a", Arc::new(Echo));
        harness.inbound.send(Ok(Message::Text("garbage".into()))).unwrap();
        assert_eq!(harness.session.await.unwrap(), SessionEnd::ClosedError);
        assert!(!relay.registry().contains("peer-a"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn empty_frames_end_the_session() {
        let relay = Relay::shared(Duration::from_secs(5));
        let harness = start(&relay, "peer-a", Arc::new(Echo));
        harness.inbound.send(Ok(Message::Binary(Vec::new()))).unwrap();
        assert_eq!(harness.session.await.unwrap(), SessionEnd::ClosedError);
    }

    #[test_timeout::tokio_timeout_test]
    async fn read_error_ends_the_session() {
        let relay = Relay::shared(Duration::from_secs(5));
        let harness = start(&relay, "peer-a", Arc::new(Echo));
        harness
            .inbound
            .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")))
            .unwrap();
        assert_eq!(harness.session.await.unwrap(), SessionEnd::ClosedError);
        assert!(!relay.registry().contains("peer-a"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn cancellation_closes_with_peer_offline() {
        let relay = Relay::shared(Duration::from_secs(5));
        let mut harness = start(&relay, "peer-a", Arc::new(Echo));
        wait_registered(&relay, "peer-a").await;

        harness.conn.close("peer offline");
        assert_eq!(harness.session.await.unwrap(), SessionEnd::ClosedCancelled);
        assert!(!relay.registry().contains("peer-a"));
        match harness.written.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.reason, "peer offline"),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn panicking_handler_does_not_take_down_the_session() {
        let relay = Relay::shared(Duration::from_secs(5));
        let harness = start(&relay, "peer-a", Arc::new(Panicky));
        let request = CallRequest::new("peer-b", "c1", "boom", Vec::new());
        harness.inbound.send(Ok(Message::Binary(request.to_bytes()))).unwrap();

        let pending = relay.correlator().register("c9");
        let reply = CallResponse::ok("c9", "ping", Vec::new());
        harness.inbound.send(Ok(Message::Text(reply.to_text()))).unwrap();
        assert!(matches!(
            pending.wait(Duration::from_secs(5)).await,
            crate::correlator::CallOutcome::Delivered(_)
        ));

        drop(harness.inbound);
        assert_eq!(harness.session.await.unwrap(), SessionEnd::ClosedNormal);
    }

    #[test_timeout::tokio_timeout_test]
    async fn reply_without_status_is_delivered_as_ok() {
        let relay = Relay::shared(Duration::from_secs(5));
        let harness = start(&relay, "peer-a", Arc::new(Echo));
        let pending = relay.correlator().register("c1");

        harness
            .inbound
            .send(Ok(Message::Text(r#"{"callId":"c1","method":"ping","data":""}"#.into())))
            .unwrap();
        match pending.wait(Duration::from_secs(5)).await {
            crate::correlator::CallOutcome::Delivered(response) => {
                assert_eq!(response.status, CallStatus::Ok);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!harness.session.is_finished());
        assert!(relay.registry().contains("peer-a"));

        drop(harness.inbound);
        assert_eq!(harness.session.await.unwrap(), SessionEnd::ClosedNormal);
    }

    #[test_timeout::tokio_timeout_test]
    async fn closing_the_caller_abandons_its_calls() {
        let relay = Relay::shared(Duration::from_secs(30));
        let (target, _target_rx) = PeerConnection::new("peer-b", 16);
        relay.registry().register(Arc::new(target));

        let harness = start(&relay, "peer-a", relay.clone());
        let request = CallRequest::new("peer-b", "c1", "ping", Vec::new());
        harness.inbound.send(Ok(Message::Binary(request.to_bytes()))).unwrap();
        while relay.correlator().in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        harness.conn.close("peer offline");
        assert_eq!(harness.session.await.unwrap(), SessionEnd::ClosedCancelled);
        tokio::time::timeout(Duration::from_secs(5), async {
            while relay.correlator().in_flight() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("slot was not released after the caller closed");
    }

    #[test_timeout::timeout]
    fn metrics_reach_the_prometheus_recorder() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let relay = Relay::new(Duration::from_secs(5));
        let (conn, _rx) = PeerConnection::new("peer-a", 4);
        relay.registry().register(Arc::new(conn));

        metrics::with_local_recorder(&recorder, || {
            dispatch_reply(relay.correlator(), CallResponse::ok("nobody", "ping", Vec::new()));
            record_gauges(&relay);
        });

        let rendered = handle.render();
        assert!(rendered.contains("beach_relay_unmatched_replies_total 1"), "{rendered}");
        assert!(rendered.contains("beach_relay_peers_active 1"), "{rendered}");
        assert!(rendered.contains("beach_relay_connections_active 1"), "{rendered}");
    }
}
