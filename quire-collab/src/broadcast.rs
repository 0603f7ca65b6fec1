//! Per-room fan-out of encoded protocol messages.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! attached channel gets an independent receiver that buffers up to
//! `capacity` messages; a receiver that falls further behind is told how
//! many messages it lost and must resynchronize.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Messages sent with no receiver, plus messages lagging receivers lost
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic counters so that `broadcast` never takes a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A channel attached to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: Uuid,
    /// Transport identifier, for logs
    pub channel_id: String,
    /// Whether updates from this peer may be applied to the document
    pub can_write: bool,
}

impl Peer {
    pub fn new(channel_id: impl Into<String>, can_write: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id: channel_id.into(),
            can_write,
        }
    }
}

/// The broadcast group of a single room. Every message reaches every
/// attached peer, including the one that caused it.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, Peer>>,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Attach a peer; the receiver sees every message broadcast from now on.
    pub async fn add_peer(&self, peer: Peer) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        let rx = self.sender.subscribe();
        peers.insert(peer.id, peer);
        rx
    }

    /// Detach a peer. Returns how many peers remain.
    pub async fn remove_peer(&self, peer_id: &Uuid) -> usize {
        let mut peers = self.peers.write().await;
        peers.remove(peer_id);
        peers.len()
    }

    /// Send pre-encoded bytes to every receiver. Returns the receiver count.
    pub fn broadcast(&self, encoded: Vec<u8>) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(encoded)) {
            Ok(count) => count,
            Err(_) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let alice = Peer::new("alice", true);
        let id = alice.id;

        let _rx = group.add_peer(alice).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&id).await);

        assert_eq!(group.remove_peer(&id).await, 0);
        assert!(!group.has_peer(&id).await);
    }

    #[tokio::test]
    async fn test_fan_out_includes_everyone() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.add_peer(Peer::new("a", true)).await;
        let mut rx2 = group.add_peer(Peer::new("b", false)).await;

        assert_eq!(group.broadcast(vec![1, 2, 3]), 2);
        assert_eq!(*rx1.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*rx2.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stats_count_unheard_messages() {
        let group = BroadcastGroup::new(16);
        group.broadcast(vec![0]);
        let _rx = group.add_peer(Peer::new("a", true)).await;
        group.broadcast(vec![1]);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_slow_receiver_lags() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(Peer::new("slow", true)).await;
        for i in 0..5u8 {
            group.broadcast(vec![i]);
        }
        match rx.recv().await {
            Err(RecvError::Lagged(n)) => {
                group.record_lag(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().await.messages_dropped, 3);
    }
}
