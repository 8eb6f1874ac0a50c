//! Fan-out to every peer in a relay room.
//!
//! One tokio broadcast channel per room; each peer holds its own receiver and
//! skips frames it originated. A peer that falls `capacity` frames behind
//! loses the oldest ones and is expected to re-handshake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// A frame relayed to the other peers of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayPayload {
    Binary(Vec<u8>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    /// Peer that produced the frame; it is not echoed back to them.
    pub origin: Uuid,
    pub payload: RelayPayload,
}

impl RelayFrame {
    pub fn binary(origin: Uuid, bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            origin,
            payload: RelayPayload::Binary(bytes),
        })
    }

    pub fn text(origin: Uuid, text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            origin,
            payload: RelayPayload::Text(text.into()),
        })
    }

    /// Frames from the relay itself use the nil id and reach everyone.
    pub fn from_relay(payload: RelayPayload) -> Arc<Self> {
        Arc::new(Self {
            origin: Uuid::nil(),
            payload,
        })
    }

    pub fn is_for(&self, peer: Uuid) -> bool {
        self.origin != peer
    }
}

/// A connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    /// `host`, `guest`, or `client` for plain multi-device sync.
    pub role: String,
}

impl PeerInfo {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            role: role.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters kept outside the peer lock so sends never wait on it.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RelayFrame>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and hand back its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<RelayFrame>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Send to every receiver; filtering the origin is the receiver's job.
    /// Returns how many receivers got it.
    pub fn broadcast(&self, frame: Arc<RelayFrame>) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(frame) {
            Ok(count) => count,
            Err(_) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Record frames a lagging receiver lost.
    pub fn record_lag(&self, skipped: u64) {
        self.stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
