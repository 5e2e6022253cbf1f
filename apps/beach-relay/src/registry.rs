use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use rand::{rngs::OsRng, Rng, RngCore};
use tracing::{debug, warn};

use crate::connection::PeerConnection;

pub const PEER_OFFLINE_REASON: &str = "peer offline";

/// Live connections grouped by peer identity.
///
/// A peer may hold several connections at once (multiple tabs, a reconnect
/// racing the old socket's teardown); calls are spread across them at random.
/// Lists are kept in connect order and never stored empty.
#[derive(Default)]
pub struct ConnectionRegistry {
    peers: RwLock<HashMap<String, Vec<Arc<PeerConnection>>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub connections: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Arc<PeerConnection>) {
        let mut peers = self.peers.write();
        let list = peers.entry(conn.peer_id().to_string()).or_default();
        list.push(conn.clone());
        debug!(
            peer_id = %conn.peer_id(),
            connection_id = %conn.id(),
            connections = list.len(),
            "peer connection registered"
        );
    }

    /// Remove `conn` (by identity, not by peer id) and close it. Returns
    /// `false` when it was not registered, which makes repeated calls no-ops.
    pub fn unregister(&self, conn: &Arc<PeerConnection>) -> bool {
        let removed = {
            let mut peers = self.peers.write();
            let Some(list) = peers.get_mut(conn.peer_id()) else {
                return false;
            };
            let before = list.len();
            list.retain(|entry| !Arc::ptr_eq(entry, conn));
            let removed = list.len() != before;
            if list.is_empty() {
                peers.remove(conn.peer_id());
            }
            removed
        };

        if removed {
            conn.close(PEER_OFFLINE_REASON);
            debug!(
                peer_id = %conn.peer_id(),
                connection_id = %conn.id(),
                "peer connection unregistered"
            );
        }
        removed
    }

    /// Pick one live connection for `peer_id`, uniformly at random.
    pub fn resolve(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        let peers = self.peers.read();
        let list = peers.get(peer_id)?;
        if list.is_empty() {
            return None;
        }
        let index = pick_index(&mut OsRng, list.len());
        list.get(index).cloned()
    }

    /// Close every registered connection. Sessions unregister themselves as
    /// their read loops observe the cancellation.
    pub fn close_all(&self, reason: &'static str) -> usize {
        let conns: Vec<Arc<PeerConnection>> = self.peers.read().values().flatten().cloned().collect();
        for conn in &conns {
            conn.close(reason);
        }
        conns.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn connection_count(&self) -> usize {
        self.peers.read().values().map(Vec::len).sum()
    }

    pub fn connections_for(&self, peer_id: &str) -> usize {
        self.peers.read().get(peer_id).map(Vec::len).unwrap_or(0)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let peers = self.peers.read();
        let mut snapshot: Vec<PeerSnapshot> = peers
            .iter()
            .map(|(peer_id, list)| PeerSnapshot {
                peer_id: peer_id.clone(),
                connections: list.len(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        snapshot
    }
}

/// Uniform index in `0..len` drawn from `source`. When the strong source
/// fails the thread-local PRNG is used instead: a call should still be routed.
fn pick_index<R: RngCore>(source: &mut R, len: usize) -> usize {
    debug_assert!(len > 0);
    let mut buf = [0u8; 8];
    match source.try_fill_bytes(&mut buf) {
        Ok(()) => (u64::from_le_bytes(buf) % len as u64) as usize,
        Err(err) => {
            warn!(error = %err, "secure random source failed; falling back to thread rng");
            rand::thread_rng().gen_range(0..len)
        }
    }
}
