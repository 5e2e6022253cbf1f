//! One-shot rendezvous between a forwarded call and its eventual reply.
//!
//! The router registers a slot before it writes the request to the target
//! peer, then waits on it with a deadline. The target's session hands the
//! reply to [`CallCorrelator::deliver`] from its own read loop. Whichever side
//! removes the slot first wins: a reply that shows up after the deadline finds
//! nothing and is dropped.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, warn};

use crate::frame::CallResponse;

#[derive(Clone, Default)]
pub struct CallCorrelator {
    inner: Arc<CorrelatorInner>,
}

#[derive(Default)]
struct CorrelatorInner {
    slots: DashMap<String, Slot>,
    next_ticket: AtomicU64,
}

struct Slot {
    /// Distinguishes successive registrations of the same call id so a
    /// waiter only ever removes its own slot.
    ticket: u64,
    reply: oneshot::Sender<CallResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Delivered(CallResponse),
    TimedOut,
}

impl CallCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a reply slot for `call_id`. A call id already in flight is
    /// replaced; its waiter will run out its deadline.
    pub fn register(&self, call_id: impl Into<String>) -> PendingCall {
        let call_id = call_id.into();
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let previous = self
            .inner
            .slots
            .insert(call_id.clone(), Slot { ticket, reply: tx });
        if previous.is_some() {
            warn!(call_id = %call_id, "call id already in flight; replacing older slot");
        }
        PendingCall {
            correlator: self.clone(),
            call_id,
            ticket,
            reply: rx,
        }
    }

    /// Hand `response` to the waiter registered under its call id. Never
    /// blocks; unknown or expired ids are ignored and reported as `false`.
    pub fn deliver(&self, response: CallResponse) -> bool {
        let Some((call_id, slot)) = self.inner.slots.remove(&response.call_id) else {
            debug!(call_id = %response.call_id, "no waiter for reply; dropping");
            return false;
        };
        if slot.reply.send(response).is_err() {
            debug!(call_id = %call_id, "waiter went away before reply; dropping");
            return false;
        }
        true
    }

    pub fn in_flight(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_pending(&self, call_id: &str) -> bool {
        self.inner.slots.contains_key(call_id)
    }

    fn release(&self, call_id: &str, ticket: u64) {
        self.inner
            .slots
            .remove_if(call_id, |_, slot| slot.ticket == ticket);
    }
}

/// A registered slot awaiting its reply. Dropping it, including by
/// cancelling the future that waits on it, removes the slot.
pub struct PendingCall {
    correlator: CallCorrelator,
    call_id: String,
    ticket: u64,
    reply: oneshot::Receiver<CallResponse>,
}

impl PendingCall {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub async fn wait(self, timeout: Duration) -> CallOutcome {
        self.wait_until(Instant::now() + timeout).await
    }

    /// Wait for the reply until `deadline`, which may already have passed.
    pub async fn wait_until(mut self, deadline: Instant) -> CallOutcome {
        let outcome = match tokio::time::timeout_at(deadline, &mut self.reply).await {
            Ok(Ok(response)) => CallOutcome::Delivered(response),
            Ok(Err(_)) => {
                // Superseded by a newer registration of the same id.
                tokio::time::sleep_until(deadline).await;
                CallOutcome::TimedOut
            }
            Err(_) => CallOutcome::TimedOut,
        };
        self.correlator.release(&self.call_id, self.ticket);
        outcome
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.correlator.release(&self.call_id, self.ticket);
    }
}
