//! Directory service node
//!
//! Serves the local shard to other peers and runs iterative lookups:
//! - `store` replicates a subkey to the `k` peers closest to the key
//! - `get` queries the same neighbourhood and merges the newest value per subkey
//! - `refresh` keeps the routing table populated and the shard clean
//!
//! Reads never fail: an unreachable directory looks like an empty one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::id::{BootstrapPeer, Contact, DhtKey, Distance, NodeId, PeerId};
use super::routing::{InsertOutcome, RoutingTable};
use super::storage::{LocalStorage, StoredValue};
use crate::config::DhtSettings;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::{PeerMessage, WireEntry};
use crate::transport::{RequestHandler, Transport};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Directory node configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket capacity and replication factor
    pub bucket_size: usize,

    /// Parallel requests per lookup round
    pub alpha: usize,

    /// Consecutive failures before eviction
    pub max_failures: u32,

    /// Timeout for each request
    pub request_timeout: Duration,

    /// Interval between maintenance passes
    pub refresh_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bucket_size: 20,
            alpha: 3,
            max_failures: 3,
            request_timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(60),
        }
    }
}

impl DhtConfig {
    /// Build from file settings plus the peer request timeout
    pub fn from_settings(settings: &DhtSettings, request_timeout: Duration) -> Self {
        Self {
            bucket_size: settings.bucket_size,
            alpha: settings.alpha,
            max_failures: settings.max_failures,
            request_timeout,
            refresh_interval: Duration::from_millis(settings.refresh_interval_ms),
        }
    }
}

/// A decoded directory record
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    /// Writer-owned subkey
    pub subkey: String,

    /// Decoded value
    pub value: T,

    /// When the entry stops being served
    pub expiration: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────
// Node
// ─────────────────────────────────────────────────────────────────

/// One participant of the directory service
pub struct DhtNode {
    config: DhtConfig,
    transport: Arc<dyn Transport>,
    local: Contact,
    routing: RwLock<RoutingTable>,
    storage: RwLock<LocalStorage>,
    bootstrap_peers: RwLock<Vec<BootstrapPeer>>,
}

impl DhtNode {
    /// Create a node on top of a transport
    pub fn new(transport: Arc<dyn Transport>, config: DhtConfig) -> Arc<Self> {
        let local = transport.local_contact();
        let routing = RoutingTable::new(local.peer_id, config.bucket_size, config.max_failures);

        Arc::new(Self {
            config,
            transport,
            local,
            routing: RwLock::new(routing),
            storage: RwLock::new(LocalStorage::new()),
            bootstrap_peers: RwLock::new(Vec::new()),
        })
    }

    /// This node's identifier
    pub fn peer_id(&self) -> PeerId {
        self.local.peer_id
    }

    /// This node's advertised contact
    pub fn local_contact(&self) -> Contact {
        self.local
    }

    /// Transport the node talks through
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Number of contacts in the routing table
    pub fn peer_count(&self) -> usize {
        self.routing.read().len()
    }

    /// Known contacts
    pub fn contacts(&self) -> Vec<Contact> {
        self.routing.read().contacts()
    }

    // ─────────────────────────────────────────────────────────────
    // Joining
    // ─────────────────────────────────────────────────────────────

    /// Join the directory through the given peers
    ///
    /// Returns the routing table size afterwards. An empty list makes this
    /// node a seed; unreachable bootstrap peers are logged, never fatal.
    pub async fn bootstrap(&self, initial: &[BootstrapPeer]) -> usize {
        *self.bootstrap_peers.write() = initial.to_vec();

        if initial.is_empty() {
            info!(peer_id = %self.local.peer_id.short(), "No initial peers, starting as seed");
            return 0;
        }

        let pings = initial.iter().map(|peer| self.ping_bootstrap(*peer));
        let reached = join_all(pings).await.into_iter().filter(|ok| *ok).count();

        if reached == 0 {
            warn!(
                attempted = initial.len(),
                "Could not reach any initial peer; will retry during maintenance"
            );
            return self.peer_count();
        }

        // Populate buckets near our own identifier
        self.lookup(self.local.peer_id).await;

        let known = self.peer_count();
        info!(reached = reached, known_peers = known, "Joined directory");
        known
    }

    /// Ping a bootstrap address and record the responder
    async fn ping_bootstrap(&self, peer: BootstrapPeer) -> bool {
        let nonce = rand::random::<u64>();
        match self
            .transport
            .call(peer.addr, PeerMessage::Ping { nonce }, self.config.request_timeout)
            .await
        {
            Ok((responder, PeerMessage::Pong { nonce: echoed })) if echoed == nonce => {
                if let Some(expected) = peer.peer_id {
                    if expected != responder.peer_id {
                        warn!(
                            addr = %peer.addr,
                            expected = %expected.short(),
                            actual = %responder.peer_id.short(),
                            "Initial peer answered with an unexpected identity"
                        );
                        return false;
                    }
                }
                self.routing
                    .write()
                    .record_success(Contact::new(responder.peer_id, peer.addr));
                true
            }
            Ok((_, other)) => {
                debug!(addr = %peer.addr, reply = other.type_name(), "Bad ping reply");
                false
            }
            Err(e) => {
                debug!(addr = %peer.addr, error = %e, "Initial peer unreachable");
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────

    /// Send a request to a contact, updating its routing entry
    async fn rpc(&self, contact: Contact, message: PeerMessage) -> Result<PeerMessage> {
        match self
            .transport
            .call_peer(&contact, message, self.config.request_timeout)
            .await
        {
            Ok(reply) => {
                self.routing.write().record_success(contact);
                Ok(reply)
            }
            Err(e) => {
                if self.routing.write().record_failure(&contact.peer_id) {
                    debug!(peer = %contact, "Evicted unresponsive contact");
                }
                Err(e)
            }
        }
    }

    /// Iterative lookup of the contacts closest to `target`
    ///
    /// Returns up to `k` responsive contacts, nearest first. Local node excluded.
    pub async fn lookup(&self, target: NodeId) -> Vec<Contact> {
        self.iterate(target, false).await.0
    }

    /// Core lookup loop, optionally collecting values along the way
    async fn iterate(
        &self,
        target: NodeId,
        find_value: bool,
    ) -> (Vec<Contact>, HashMap<String, StoredValue>) {
        let k = self.config.bucket_size;
        let alpha = self.config.alpha.max(1);
        let now = Utc::now();

        let mut shortlist: BTreeMap<Distance, Contact> = self
            .routing
            .read()
            .nearest(&target, k)
            .into_iter()
            .map(|c| (c.peer_id.distance(&target), c))
            .collect();
        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut responded: HashSet<PeerId> = HashSet::new();
        let mut found: HashMap<String, StoredValue> = HashMap::new();

        loop {
            let batch: Vec<Contact> = shortlist
                .values()
                .take(k)
                .filter(|c| !queried.contains(&c.peer_id))
                .take(alpha)
                .copied()
                .collect();
            if batch.is_empty() {
                break;
            }
            queried.extend(batch.iter().map(|c| c.peer_id));

            let requests = batch.iter().map(|contact| {
                let message = if find_value {
                    PeerMessage::FindValue { key: target }
                } else {
                    PeerMessage::FindNode { target }
                };
                self.rpc(*contact, message)
            });
            let replies = join_all(requests).await;

            for (contact, reply) in batch.into_iter().zip(replies) {
                let contacts = match reply {
                    Ok(PeerMessage::Nodes { contacts }) => contacts,
                    Ok(PeerMessage::Value { entries, contacts }) => {
                        merge_entries(&mut found, entries, now);
                        contacts
                    }
                    Ok(other) => {
                        debug!(peer = %contact, reply = other.type_name(), "Unexpected lookup reply");
                        shortlist.remove(&contact.peer_id.distance(&target));
                        continue;
                    }
                    Err(e) => {
                        trace!(peer = %contact, error = %e, "Lookup request failed");
                        shortlist.remove(&contact.peer_id.distance(&target));
                        continue;
                    }
                };

                responded.insert(contact.peer_id);
                for discovered in contacts {
                    if discovered.peer_id != self.local.peer_id {
                        shortlist
                            .entry(discovered.peer_id.distance(&target))
                            .or_insert(discovered);
                    }
                }
            }
        }

        let closest = shortlist
            .into_values()
            .filter(|c| responded.contains(&c.peer_id))
            .take(k)
            .collect();
        (closest, found)
    }

    // ─────────────────────────────────────────────────────────────
    // Store / Get
    // ─────────────────────────────────────────────────────────────

    /// Store `value` under `name`/`subkey` for `ttl`
    ///
    /// Replicates to the `k` closest nodes, this one included when it is
    /// among them. Returns the number of replicas that accepted the write.
    pub async fn store(
        &self,
        name: &str,
        subkey: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<usize> {
        let key = DhtKey::from_name(name);
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Internal(format!("invalid ttl: {}", e)))?;
        let expiration = Utc::now() + ttl;
        let had_peers = self.peer_count() > 0;

        let remote = self.lookup(key).await;
        if had_peers && remote.is_empty() {
            // Keep our own copy so we can still serve it, but we are cut off
            self.storage
                .write()
                .store(key, subkey.to_string(), value, expiration);
            return Err(Error::directory_unavailable(name, "no replica reachable"));
        }

        let k = self.config.bucket_size;
        let local_distance = self.local.peer_id.distance(&key);
        let closer = remote
            .iter()
            .filter(|c| c.peer_id.distance(&key) < local_distance)
            .count();
        let store_locally = closer < k;
        let remote: Vec<Contact> = remote.into_iter().take(if store_locally { k - 1 } else { k }).collect();

        let mut acks = 0;
        if store_locally {
            let outcome = self
                .storage
                .write()
                .store(key, subkey.to_string(), value.clone(), expiration);
            if outcome.is_accepted() {
                acks += 1;
            }
        }

        let requests = remote.iter().map(|contact| {
            self.rpc(
                *contact,
                PeerMessage::Store {
                    key,
                    subkey: subkey.to_string(),
                    value: value.clone(),
                    expiration,
                },
            )
        });
        for (contact, reply) in remote.iter().zip(join_all(requests).await) {
            match reply {
                Ok(PeerMessage::StoreAck { stored: true }) => acks += 1,
                Ok(PeerMessage::StoreAck { stored: false }) => {
                    debug!(peer = %contact, key = name, subkey = subkey, "Replica kept a newer value");
                }
                Ok(other) => {
                    debug!(peer = %contact, reply = other.type_name(), "Unexpected store reply");
                }
                Err(e) => trace!(peer = %contact, error = %e, "Store request failed"),
            }
        }

        if acks == 0 {
            return Err(Error::directory_unavailable(name, "no replica acknowledged the write"));
        }

        trace!(key = name, subkey = subkey, replicas = acks, "Stored directory entry");
        Ok(acks)
    }

    /// All live entries under `name`, newest value per subkey
    ///
    /// Never fails; returns an empty map when nothing is reachable.
    pub async fn get(&self, name: &str) -> HashMap<String, StoredValue> {
        let key = DhtKey::from_name(name);
        let (_, mut found) = self.iterate(key, true).await;

        let now = Utc::now();
        for (subkey, local) in self.storage.read().get_at(&key, now) {
            merge_one(&mut found, subkey, local);
        }
        found.retain(|_, v| v.expiration > now);
        found
    }

    /// Serialize `value` as JSON and store it
    pub async fn store_json<T: Serialize>(
        &self,
        name: &str,
        subkey: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<usize> {
        let bytes = serde_json::to_vec(value)?;
        self.store(name, subkey, bytes, ttl).await
    }

    /// Fetch and decode JSON entries, skipping ones that fail to decode
    pub async fn get_json<T: DeserializeOwned>(&self, name: &str) -> Vec<Record<T>> {
        let mut records: Vec<Record<T>> = self
            .get(name)
            .await
            .into_iter()
            .filter_map(|(subkey, stored)| match serde_json::from_slice(&stored.value) {
                Ok(value) => Some(Record {
                    subkey,
                    value,
                    expiration: stored.expiration,
                }),
                Err(e) => {
                    debug!(key = name, subkey = %subkey, error = %e, "Ignoring undecodable entry");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| a.subkey.cmp(&b.subkey));
        records
    }

    // ─────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────

    /// One maintenance pass
    pub async fn refresh(&self) {
        let purged = self.storage.write().purge_expired();
        if purged > 0 {
            debug!(purged = purged, "Purged expired directory entries");
        }

        if self.peer_count() == 0 {
            let initial = self.bootstrap_peers.read().clone();
            if !initial.is_empty() {
                debug!("Routing table empty, re-bootstrapping");
                self.bootstrap(&initial).await;
            }
            return;
        }

        let bucket = self.routing.read().occupied_buckets().choose(&mut rand::thread_rng()).copied();
        if let Some(index) = bucket {
            let target = self.local.peer_id.random_in_bucket(index);
            let found = self.lookup(target).await;
            trace!(bucket = index, found = found.len(), "Refreshed bucket");
        }
    }

    /// Run `refresh` periodically until shutdown
    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.refresh_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => node.refresh().await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Directory maintenance stopped");
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────

    /// Serve one directory request
    pub fn handle_request(&self, sender: Contact, message: PeerMessage) -> PeerMessage {
        if sender.peer_id != self.local.peer_id {
            if let InsertOutcome::Added = self.routing.write().insert(sender) {
                trace!(peer = %sender, "Learned contact from inbound request");
            }
        }

        let k = self.config.bucket_size;
        match message {
            PeerMessage::Ping { nonce } => PeerMessage::Pong { nonce },
            PeerMessage::Store {
                key,
                subkey,
                value,
                expiration,
            } => {
                let outcome = self.storage.write().store(key, subkey, value, expiration);
                PeerMessage::StoreAck {
                    stored: outcome.is_accepted(),
                }
            }
            PeerMessage::FindNode { target } => PeerMessage::Nodes {
                contacts: self.nearest_excluding(&target, &sender.peer_id, k),
            },
            PeerMessage::FindValue { key } => {
                let entries = self
                    .storage
                    .read()
                    .get(&key)
                    .into_iter()
                    .map(|(subkey, v)| WireEntry {
                        subkey,
                        value: v.value,
                        expiration: v.expiration,
                    })
                    .collect();
                PeerMessage::Value {
                    entries,
                    contacts: self.nearest_excluding(&key, &sender.peer_id, k),
                }
            }
            other => PeerMessage::Error {
                code: ErrorCode::ProtocolUnexpected.as_str(),
                message: format!("{} is not a directory request", other.type_name()),
            },
        }
    }

    fn nearest_excluding(&self, target: &NodeId, exclude: &PeerId, count: usize) -> Vec<Contact> {
        let mut contacts = self.routing.read().nearest(target, count + 1);
        contacts.retain(|c| c.peer_id != *exclude);
        contacts.truncate(count);
        contacts
    }
}

#[async_trait::async_trait]
impl RequestHandler for DhtNode {
    async fn handle(&self, sender: Contact, message: PeerMessage) -> PeerMessage {
        self.handle_request(sender, message)
    }
}

/// Merge wire entries, keeping the latest expiration per subkey
fn merge_entries(found: &mut HashMap<String, StoredValue>, entries: Vec<WireEntry>, now: DateTime<Utc>) {
    for entry in entries {
        if entry.expiration <= now {
            continue;
        }
        merge_one(
            found,
            entry.subkey,
            StoredValue {
                value: entry.value,
                expiration: entry.expiration,
            },
        );
    }
}

fn merge_one(found: &mut HashMap<String, StoredValue>, subkey: String, candidate: StoredValue) {
    let newer = found
        .get(&subkey)
        .map_or(true, |existing| existing.expiration < candidate.expiration);
    if newer {
        found.insert(subkey, candidate);
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;

    fn test_config() -> DhtConfig {
        DhtConfig {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    /// Spin up `n` nodes; every node after the first bootstraps from the first
    async fn swarm(n: usize) -> (Arc<MemoryNetwork>, Vec<Arc<DhtNode>>) {
        let net = MemoryNetwork::new();
        let mut nodes = Vec::new();
        for _ in 0..n {
            let transport = net.transport(PeerId::random());
            let node = DhtNode::new(transport.clone(), test_config());
            transport.serve(node.clone()).unwrap();
            nodes.push(node);
        }

        let seed = BootstrapPeer::from(nodes[0].local_contact());
        for node in nodes.iter().skip(1) {
            node.bootstrap(&[seed]).await;
        }
        (net, nodes)
    }

    #[tokio::test]
    async fn test_bootstrap_populates_routing() {
        let (_net, nodes) = swarm(5).await;
        assert_eq!(nodes[0].peer_count(), 4);
        for node in &nodes[1..] {
            assert!(node.peer_count() >= 1);
        }
    }

    #[tokio::test]
    async fn test_store_then_get_from_other_peer() {
        let (_net, nodes) = swarm(4).await;

        let acks = nodes[1]
            .store("run_progress", "writer", b"hello".to_vec(), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(acks >= 1);

        let got = nodes[3].get("run_progress").await;
        assert_eq!(got["writer"].value, b"hello");
    }

    #[tokio::test]
    async fn test_subkeys_merge_across_writers() {
        let (_net, nodes) = swarm(3).await;
        for (i, node) in nodes.iter().enumerate() {
            node.store("run_progress", &format!("peer{}", i), vec![i as u8], Duration::from_secs(30))
                .await
                .unwrap();
        }

        let got = nodes[0].get("run_progress").await;
        assert_eq!(got.len(), 3);
    }

    #[tokio::test]
    async fn test_newest_value_per_subkey_wins() {
        let (_net, nodes) = swarm(3).await;
        nodes[1]
            .store("k", "me", b"old".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        nodes[1]
            .store("k", "me", b"new".to_vec(), Duration::from_secs(20))
            .await
            .unwrap();

        assert_eq!(nodes[2].get("k").await["me"].value, b"new");
    }

    #[tokio::test]
    async fn test_expired_entries_never_returned() {
        let (_net, nodes) = swarm(3).await;
        nodes[0]
            .store("short", "a", b"x".to_vec(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(nodes[1].get("short").await.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        for node in &nodes {
            assert!(node.get("short").await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_get_unreachable_returns_empty() {
        let (net, nodes) = swarm(2).await;
        net.kill(&nodes[0].peer_id());
        assert!(nodes[1].get("anything").await.is_empty());
    }

    #[tokio::test]
    async fn test_store_cut_off_is_directory_unavailable() {
        let (net, nodes) = swarm(2).await;
        net.kill(&nodes[0].peer_id());

        let err = nodes[1]
            .store("k", "a", b"x".to_vec(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DirectoryUnavailable);
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_seed_alone_stores_locally() {
        let (_net, nodes) = swarm(1).await;
        let acks = nodes[0]
            .store("k", "a", b"x".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(acks, 1);
        assert_eq!(nodes[0].get("k").await["a"].value, b"x");
    }

    #[tokio::test]
    async fn test_dead_contacts_evicted() {
        let (net, nodes) = swarm(3).await;
        let victim = nodes[2].peer_id();
        net.kill(&victim);

        for _ in 0..3 {
            nodes[0].lookup(NodeId::random()).await;
        }
        assert!(nodes[0].contacts().iter().all(|c| c.peer_id != victim));
    }

    #[tokio::test]
    async fn test_json_helpers_skip_garbage() {
        let (_net, nodes) = swarm(2).await;
        nodes[0]
            .store_json("typed", "good", &42u32, Duration::from_secs(5))
            .await
            .unwrap();
        nodes[0]
            .store("typed", "bad", b"not json".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();

        let records: Vec<Record<u32>> = nodes[1].get_json("typed").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subkey, "good");
        assert_eq!(records[0].value, 42);
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_wrong_identity() {
        let net = MemoryNetwork::new();
        let a_transport = net.transport(PeerId::random());
        let a = DhtNode::new(a_transport.clone(), test_config());
        a_transport.serve(a.clone()).unwrap();

        let b_transport = net.transport(PeerId::random());
        let b = DhtNode::new(b_transport, test_config());

        let wrong = BootstrapPeer {
            peer_id: Some(PeerId::random()),
            addr: a.local_contact().addr,
        };
        assert_eq!(b.bootstrap(&[wrong]).await, 0);
    }

    #[tokio::test]
    async fn test_refresh_rebootstraps_empty_table() {
        let net = MemoryNetwork::new();
        let a_transport = net.transport(PeerId::random());
        let a = DhtNode::new(a_transport.clone(), test_config());
        a_transport.serve(a.clone()).unwrap();

        let b_transport = net.transport(PeerId::random());
        let b = DhtNode::new(b_transport.clone(), test_config());
        b_transport.serve(b.clone()).unwrap();

        net.kill(&a.peer_id());
        assert_eq!(b.bootstrap(&[BootstrapPeer::from(a.local_contact())]).await, 0);

        net.revive(&a.peer_id());
        b.refresh().await;
        assert_eq!(b.peer_count(), 1);
    }

    #[test]
    fn test_non_directory_request_rejected() {
        let net = MemoryNetwork::new();
        let node = DhtNode::new(net.transport(PeerId::random()), test_config());
        let sender = Contact::new(PeerId::random(), "127.0.0.1:1".parse().unwrap());
        let reply = node.handle_request(sender, PeerMessage::ack());
        match reply {
            PeerMessage::Error { code, .. } => {
                assert_eq!(code, ErrorCode::ProtocolUnexpected.as_str())
            }
            other => panic!("expected an error reply, got {}", other.type_name()),
        }
    }
}
