//! Liveness tracker
//!
//! Background duty cycle that:
//! - Re-publishes this peer's progress record before it expires
//! - Reads everyone's records and refreshes the peer registry
//! - Backs off while the directory is unreachable
//!
//! `report` only swaps the pending record and wakes the task, so the
//! training loop never waits on the directory.

use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{progress_key, GlobalProgress, PeerRegistry, ProgressRecord};
use crate::config::SwarmConfig;
use crate::dht::{Contact, DhtNode, PeerId};
use crate::error::Result;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Liveness tracker configuration
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Experiment namespace
    pub run_id: String,

    /// Interval between publications and reads
    pub publish_interval: Duration,

    /// Lifetime of a published record
    pub record_ttl: Duration,

    /// Forget peers not heard from within this window
    pub stale_timeout: Duration,

    /// First retry delay after a failed publication
    pub initial_backoff: Duration,

    /// Largest retry delay
    pub max_backoff: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            run_id: "swarm".to_string(),
            publish_interval: Duration::from_secs(5),
            record_ttl: Duration::from_secs(600),
            stale_timeout: Duration::from_secs(120),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl TrackerConfig {
    /// Build from the trainer configuration
    pub fn from_config(config: &SwarmConfig) -> Self {
        let publish_interval = Duration::from_millis(config.training.publish_interval_ms);
        Self {
            run_id: config.averaging.run_id.clone(),
            publish_interval,
            record_ttl: Duration::from_secs(config.training.statistics_expiration_secs),
            stale_timeout: Duration::from_millis(config.training.stale_peer_timeout_ms),
            max_backoff: publish_interval.max(Duration::from_secs(30)),
            ..Default::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tracker
// ─────────────────────────────────────────────────────────────────

/// Publishes local progress and tracks everyone else's
pub struct LivenessTracker {
    config: TrackerConfig,
    dht: Arc<DhtNode>,
    registry: Arc<PeerRegistry>,
    pending: RwLock<Option<ProgressRecord>>,
    reported: Notify,
}

impl LivenessTracker {
    /// Create a tracker over a directory node
    pub fn new(config: TrackerConfig, dht: Arc<DhtNode>) -> Arc<Self> {
        Arc::new(Self {
            config,
            dht,
            registry: Arc::new(PeerRegistry::new()),
            pending: RwLock::new(None),
            reported: Notify::new(),
        })
    }

    /// Registry of other peers
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// This peer's identifier
    pub fn peer_id(&self) -> PeerId {
        self.dht.peer_id()
    }

    /// Contact this peer advertises
    pub fn local_contact(&self) -> Contact {
        self.dht.local_contact()
    }

    /// Queue a record for publication; never blocks
    pub fn report(&self, record: ProgressRecord) {
        *self.pending.write() = Some(record);
        self.reported.notify_one();
    }

    /// Latest record handed to `report`
    pub fn local_record(&self) -> Option<ProgressRecord> {
        self.pending.read().clone()
    }

    /// Known peers with their progress, this peer excluded
    pub fn snapshot(&self) -> Vec<(PeerId, ProgressRecord)> {
        let mut peers: Vec<(PeerId, ProgressRecord)> = self
            .registry
            .records()
            .into_iter()
            .map(|r| (r.peer_id, r))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }

    /// Collaboration-wide estimate including this peer's pending record
    pub fn global_progress(&self, target_batch_size: u64) -> GlobalProgress {
        let mut records = self.registry.records();
        if let Some(local) = self.local_record() {
            records.push(local);
        }
        GlobalProgress::estimate(&records, target_batch_size, Utc::now())
    }

    /// Publish the pending record
    ///
    /// Returns false when nothing has been reported yet.
    pub async fn publish(&self) -> Result<bool> {
        let Some(record) = self.local_record() else {
            return Ok(false);
        };

        let key = progress_key(&self.config.run_id);
        let replicas = self
            .dht
            .store_json(&key, &record.peer_id.to_hex(), &record, self.config.record_ttl)
            .await?;

        debug!(
            step = record.local_step,
            samples = record.samples_accumulated,
            replicas = replicas,
            "Published progress"
        );
        Ok(true)
    }

    /// Read every peer's record now and update the registry
    pub async fn refresh_now(&self) -> Vec<ProgressRecord> {
        let key = progress_key(&self.config.run_id);
        let own = self.dht.peer_id();

        let mut valid = Vec::new();
        for entry in self.dht.get_json::<ProgressRecord>(&key).await {
            if entry.subkey != entry.value.peer_id.to_hex() {
                debug!(
                    subkey = %entry.subkey,
                    claimed = %entry.value.peer_id.short(),
                    "Ignoring progress record written under another peer's subkey"
                );
                continue;
            }
            if entry.value.peer_id == own {
                continue;
            }
            if self.registry.upsert(entry.value.clone()) {
                info!(
                    peer = %entry.value.peer_id.short(),
                    step = entry.value.local_step,
                    "Discovered peer"
                );
            }
            valid.push(entry.value);
        }

        for gone in self.registry.prune_stale(self.config.stale_timeout) {
            info!(peer = %gone.short(), "Peer went silent, forgetting it");
        }

        valid
    }

    /// Start the background duty cycle
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move { tracker.run(shutdown).await })
    }

    /// When a freshly reported record may go out
    ///
    /// A new step is published at once; anything else waits out the
    /// publish interval since the last publication.
    fn earliest_publish(&self, last_published: Option<(Instant, u64)>) -> Instant {
        let now = Instant::now();
        match (last_published, self.local_record()) {
            (Some((at, step)), Some(record)) if record.local_step == step => {
                (at + self.config.publish_interval).max(now)
            }
            _ => now,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            max_elapsed_time: None, // Retry forever
            ..Default::default()
        };
        let mut failing = false;
        let mut next_publish = Instant::now();
        let mut last_published: Option<(Instant, u64)> = None;

        let mut fetch = tokio::time::interval(self.config.publish_interval);
        fetch.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_publish) => {
                    let step = self.local_record().map(|r| r.local_step);
                    next_publish = match self.publish().await {
                        Ok(published) => {
                            if let (true, Some(step)) = (published, step) {
                                last_published = Some((Instant::now(), step));
                            }
                            if failing {
                                info!("Progress publication recovered");
                            }
                            failing = false;
                            backoff.reset();
                            Instant::now() + self.config.publish_interval
                        }
                        Err(e) => {
                            let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                            if !failing {
                                warn!(error = %e, retry_ms = delay.as_millis() as u64, "Progress publication failed");
                            } else {
                                debug!(error = %e, retry_ms = delay.as_millis() as u64, "Progress publication still failing");
                            }
                            failing = true;
                            Instant::now() + delay
                        }
                    };
                }
                _ = self.reported.notified() => {
                    if !failing {
                        next_publish = next_publish.min(self.earliest_publish(last_published));
                    }
                }
                _ = fetch.tick() => {
                    self.refresh_now().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        debug!("Liveness tracker stopped");
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
