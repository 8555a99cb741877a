//! Kademlia-style routing table
//!
//! One bucket per bit of the identifier space. A bucket holds at most `k`
//! contacts, ordered from least to most recently seen. Contacts that keep
//! failing are evicted after `max_failures` consecutive failures.

use std::time::Instant;

use super::id::{Contact, NodeId, PeerId, ID_BITS};

/// Routing entry with failure bookkeeping
#[derive(Debug, Clone)]
struct Entry {
    contact: Contact,
    failures: u32,
    last_seen: Instant,
}

/// Result of offering a contact to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New contact stored
    Added,
    /// Existing contact refreshed
    Refreshed,
    /// Bucket was full; a failing contact made room
    Replaced(Contact),
    /// Bucket was full of healthy contacts
    Rejected,
    /// The local node is never stored
    Ignored,
}

/// XOR-distance routing table
pub struct RoutingTable {
    local: NodeId,
    buckets: Vec<Vec<Entry>>,
    bucket_size: usize,
    max_failures: u32,
}

impl RoutingTable {
    /// Create an empty table for `local`
    pub fn new(local: NodeId, bucket_size: usize, max_failures: u32) -> Self {
        Self {
            local,
            buckets: vec![Vec::new(); ID_BITS],
            bucket_size: bucket_size.max(1),
            max_failures: max_failures.max(1),
        }
    }

    /// Offer a contact seen in a successful exchange
    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        let index = match self.local.bucket_index(&contact.peer_id) {
            Some(index) => index,
            None => return InsertOutcome::Ignored,
        };
        let bucket_size = self.bucket_size;
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.iter().position(|e| e.contact.peer_id == contact.peer_id) {
            let mut entry = bucket.remove(pos);
            entry.contact = contact;
            entry.failures = 0;
            entry.last_seen = Instant::now();
            bucket.push(entry);
            return InsertOutcome::Refreshed;
        }

        let fresh = Entry {
            contact,
            failures: 0,
            last_seen: Instant::now(),
        };

        if bucket.len() < bucket_size {
            bucket.push(fresh);
            return InsertOutcome::Added;
        }

        // Full bucket: displace the most-failing entry, if any is failing
        let worst = bucket
            .iter()
            .enumerate()
            .filter(|(_, e)| e.failures > 0)
            .max_by_key(|(_, e)| e.failures)
            .map(|(pos, _)| pos);

        match worst {
            Some(pos) => {
                let evicted = bucket.remove(pos);
                bucket.push(fresh);
                InsertOutcome::Replaced(evicted.contact)
            }
            None => InsertOutcome::Rejected,
        }
    }

    /// Refresh a contact after a successful exchange
    pub fn record_success(&mut self, contact: Contact) -> InsertOutcome {
        self.insert(contact)
    }

    /// Count a failed exchange; returns true if the contact was evicted
    pub fn record_failure(&mut self, peer_id: &PeerId) -> bool {
        let max_failures = self.max_failures;
        let Some(bucket) = self.bucket_for_mut(peer_id) else {
            return false;
        };

        let Some(pos) = bucket.iter().position(|e| e.contact.peer_id == *peer_id) else {
            return false;
        };

        bucket[pos].failures += 1;
        if bucket[pos].failures >= max_failures {
            bucket.remove(pos);
            true
        } else {
            false
        }
    }

    /// Drop a contact
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Contact> {
        let bucket = self.bucket_for_mut(peer_id)?;
        let pos = bucket.iter().position(|e| e.contact.peer_id == *peer_id)?;
        Some(bucket.remove(pos).contact)
    }

    /// Look up a contact by identifier
    pub fn get(&self, peer_id: &PeerId) -> Option<Contact> {
        let index = self.local.bucket_index(peer_id)?;
        self.buckets[index]
            .iter()
            .find(|e| e.contact.peer_id == *peer_id)
            .map(|e| e.contact)
    }

    /// Consecutive failures recorded for a contact
    pub fn failures(&self, peer_id: &PeerId) -> Option<u32> {
        let index = self.local.bucket_index(peer_id)?;
        self.buckets[index]
            .iter()
            .find(|e| e.contact.peer_id == *peer_id)
            .map(|e| e.failures)
    }

    /// Up to `count` contacts closest to `target`, nearest first
    pub fn nearest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter().map(|e| e.contact))
            .collect();
        all.sort_by_key(|c| c.peer_id.distance(target));
        all.truncate(count);
        all
    }

    /// Every known contact
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.iter().map(|e| e.contact))
            .collect()
    }

    /// Indices of buckets that hold at least one contact
    pub fn occupied_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Total number of contacts
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    fn bucket_for_mut(&mut self, peer_id: &PeerId) -> Option<&mut Vec<Entry>> {
        let index = self.local.bucket_index(peer_id)?;
        self.buckets.get_mut(index)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::id::ID_BYTES;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn zero() -> NodeId {
        NodeId::from_bytes([0u8; ID_BYTES])
    }

    /// Contacts that all land in the top bucket relative to zero
    fn top_bucket_contact(n: u8) -> Contact {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = 0x80;
        bytes[ID_BYTES - 1] = n;
        Contact::new(NodeId::from_bytes(bytes), addr(4000 + n as u16))
    }

    #[test]
    fn test_insert_and_refresh() {
        let mut table = RoutingTable::new(zero(), 2, 3);
        let c = top_bucket_contact(1);

        assert_eq!(table.insert(c), InsertOutcome::Added);
        assert_eq!(table.insert(c), InsertOutcome::Refreshed);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&c.peer_id), Some(c));
    }

    #[test]
    fn test_self_is_ignored() {
        let me = NodeId::random();
        let mut table = RoutingTable::new(me, 20, 3);
        assert_eq!(table.insert(Contact::new(me, addr(1))), InsertOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn test_full_bucket_rejects_when_healthy() {
        let mut table = RoutingTable::new(zero(), 2, 3);
        table.insert(top_bucket_contact(1));
        table.insert(top_bucket_contact(2));

        assert_eq!(table.insert(top_bucket_contact(3)), InsertOutcome::Rejected);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_full_bucket_replaces_most_failing() {
        let mut table = RoutingTable::new(zero(), 2, 5);
        let a = top_bucket_contact(1);
        let b = top_bucket_contact(2);
        table.insert(a);
        table.insert(b);

        table.record_failure(&a.peer_id);
        table.record_failure(&b.peer_id);
        table.record_failure(&b.peer_id);

        let c = top_bucket_contact(3);
        assert_eq!(table.insert(c), InsertOutcome::Replaced(b));
        assert!(table.get(&b.peer_id).is_none());
        assert!(table.get(&c.peer_id).is_some());
    }

    #[test]
    fn test_eviction_after_max_failures() {
        let mut table = RoutingTable::new(zero(), 20, 3);
        let c = top_bucket_contact(1);
        table.insert(c);

        assert!(!table.record_failure(&c.peer_id));
        assert!(!table.record_failure(&c.peer_id));
        assert_eq!(table.failures(&c.peer_id), Some(2));
        assert!(table.record_failure(&c.peer_id));
        assert!(table.get(&c.peer_id).is_none());
    }

    #[test]
    fn test_success_resets_failures() {
        let mut table = RoutingTable::new(zero(), 20, 3);
        let c = top_bucket_contact(1);
        table.insert(c);

        table.record_failure(&c.peer_id);
        table.record_failure(&c.peer_id);
        table.record_success(c);
        assert_eq!(table.failures(&c.peer_id), Some(0));
        assert!(!table.record_failure(&c.peer_id));
    }

    #[test]
    fn test_nearest_orders_by_distance() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20, 3);
        for i in 0..50u16 {
            table.insert(Contact::new(NodeId::random(), addr(5000 + i)));
        }

        let target = NodeId::random();
        let nearest = table.nearest(&target, 8);
        assert_eq!(nearest.len(), 8.min(table.len()));
        for pair in nearest.windows(2) {
            assert!(pair[0].peer_id.distance(&target) <= pair[1].peer_id.distance(&target));
        }

        // Nothing left out is closer than the furthest returned contact
        let furthest = nearest.last().unwrap().peer_id.distance(&target);
        for c in table.contacts() {
            if !nearest.contains(&c) {
                assert!(c.peer_id.distance(&target) >= furthest);
            }
        }
    }
}
