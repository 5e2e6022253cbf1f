use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::extract::ws::Message;
use metrics::{counter, histogram};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    correlator::{CallCorrelator, CallOutcome},
    error::RelayError,
    frame::{CallRequest, CallResponse},
    registry::ConnectionRegistry,
    session::CallHandler,
};

/// The relay service: live peer connections plus the calls in flight between
/// them. Built once at startup and shared by every session and HTTP handler.
pub struct Relay {
    registry: ConnectionRegistry,
    correlator: CallCorrelator,
    call_timeout: Duration,
}

impl Relay {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            correlator: CallCorrelator::new(),
            call_timeout,
        }
    }

    pub fn shared(call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self::new(call_timeout))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn correlator(&self) -> &CallCorrelator {
        &self.correlator
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Forward `request` to one live connection of its target peer and wait
    /// for the reply.
    ///
    /// Exactly one frame is written and one correlator slot is used per call.
    /// Nothing is retried; an unreachable target surfaces as
    /// [`RelayError::PeerOffline`] without waiting out the timeout.
    pub async fn on_call(&self, request: CallRequest) -> Result<CallResponse, RelayError> {
        if let Err(source) = request.validate() {
            counter!("beach_relay_calls_total", "outcome" => "invalid_argument").increment(1);
            return Err(RelayError::InvalidArgument {
                call_id: request.call_id,
                method: request.method,
                source,
            });
        }

        let span = info_span!(
            "call",
            peer_id = %request.peer_id,
            call_id = %request.call_id,
            method = %request.method,
        );
        let started = Instant::now();
        let result = self.forward(request).instrument(span).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.metric_label(),
        };
        counter!("beach_relay_calls_total", "outcome" => outcome).increment(1);
        histogram!("beach_relay_call_duration_ms", "outcome" => outcome)
            .record(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn forward(&self, request: CallRequest) -> Result<CallResponse, RelayError> {
        let Some(conn) = self.registry.resolve(&request.peer_id) else {
            debug!("target peer has no live connection");
            return Err(RelayError::PeerOffline {
                call_id: request.call_id,
                method: request.method,
            });
        };

        // One deadline covers both queueing the request and waiting for the reply.
        let deadline = Instant::now() + self.call_timeout;
        let pending = self.correlator.register(request.call_id.as_str());
        let frame = Message::Binary(request.to_bytes());
        match timeout_at(deadline, conn.send(frame)).await {
            Ok(Ok(())) => debug!(connection_id = %conn.id(), "request forwarded"),
            Ok(Err(_)) => {
                // A failed write means the transport is gone; the caller sees the
                // same outcome as for an unknown peer.
                debug!(connection_id = %conn.id(), "write to target connection failed");
                return Err(RelayError::PeerOffline {
                    call_id: request.call_id,
                    method: request.method,
                });
            }
            Err(_) => {
                warn!(connection_id = %conn.id(), "target outbound queue stayed full until the deadline");
                return Err(timed_out(request));
            }
        }

        match pending.wait_until(deadline).await {
            CallOutcome::Delivered(response) => Ok(response),
            CallOutcome::TimedOut => {
                warn!(timeout_ms = self.call_timeout.as_millis() as u64, "call timed out");
                Err(timed_out(request))
            }
        }
    }
}

fn timed_out(request: CallRequest) -> RelayError {
    RelayError::CallTimeout {
        call_id: request.call_id,
        method: request.method,
    }
}

#[async_trait]
impl CallHandler for Relay {
    async fn handle_call(&self, request: CallRequest) -> Option<CallResponse> {
        Some(match self.on_call(request).await {
            Ok(response) => response,
            Err(err) => err.to_response(),
        })
    }
}
