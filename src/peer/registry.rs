//! Peer registry: tracks known peers and their latest progress
//!
//! Populated from the progress records read out of the directory.
//! Entries carry a liveness timestamp and are pruned once stale.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::ProgressRecord;
use crate::dht::PeerId;

// ─────────────────────────────────────────────────────────────────
// Peer Info
// ─────────────────────────────────────────────────────────────────

/// Information about a known peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer identifier
    pub peer_id: PeerId,

    /// Address the peer accepts requests on
    pub addr: SocketAddr,

    /// Latest progress record seen
    pub progress: ProgressRecord,

    /// Last time a fresh record from this peer was seen
    pub last_seen: Instant,
}

// ─────────────────────────────────────────────────────────────────
// Peer Registry
// ─────────────────────────────────────────────────────────────────

/// Thread-safe registry of known peers
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
}

impl PeerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Record a progress report
    ///
    /// Older reports than the one held are ignored. Returns true when the
    /// peer was not known before.
    pub fn upsert(&self, record: ProgressRecord) -> bool {
        let mut peers = self.peers.write();
        match peers.get_mut(&record.peer_id) {
            Some(existing) => {
                if record.timestamp > existing.progress.timestamp {
                    existing.addr = record.addr;
                    existing.progress = record;
                    existing.last_seen = Instant::now();
                }
                false
            }
            None => {
                peers.insert(
                    record.peer_id,
                    PeerInfo {
                        peer_id: record.peer_id,
                        addr: record.addr,
                        progress: record,
                        last_seen: Instant::now(),
                    },
                );
                true
            }
        }
    }

    /// Remove a peer
    pub fn remove(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.write().remove(peer_id)
    }

    /// Get a clone of a peer's info
    pub fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Touch a peer's last_seen timestamp
    pub fn touch(&self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.last_seen = Instant::now();
        }
    }

    /// Get all known peers
    pub fn all_peers(&self) -> Vec<PeerInfo> {
        self.peers.read().values().cloned().collect()
    }

    /// Latest progress of every known peer
    pub fn records(&self) -> Vec<ProgressRecord> {
        self.peers
            .read()
            .values()
            .map(|p| p.progress.clone())
            .collect()
    }

    /// Get count of known peers
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Remove peers that haven't been seen within the timeout
    /// Returns the identifiers of removed peers
    pub fn prune_stale(&self, timeout: Duration) -> Vec<PeerId> {
        let mut peers = self.peers.write();
        let stale: Vec<PeerId> = peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            peers.remove(id);
        }

        stale
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
