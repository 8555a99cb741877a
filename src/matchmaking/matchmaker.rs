//! Matchmaker
//!
//! Forms one group per epoch within the matchmaking deadline `T`:
//! - t0: announce intent (address, weight, capacity, tensor size)
//! - t0 + T/3: read intents, split the sorted candidates into groups
//! - Leader: propose, collect confirmations, finalize on full house or deadline
//! - Follower: confirm the lowest-leader proposal naming it, then wait for
//!   the descriptor until the deadline plus a grace period
//!
//! A peer left without a group averages alone when the minimum group size
//! allows it, otherwise the epoch yields `NoGroupFormed`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{confirm_key, group_key, intent_key, proposal_key, GroupDescriptor, GroupMember};
use crate::config::AveragingSettings;
use crate::dht::{DhtNode, PeerId};
use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Matchmaker configuration
#[derive(Debug, Clone)]
pub struct MatchmakerConfig {
    /// Experiment namespace
    pub run_id: String,

    /// Preferred group size
    pub target_group_size: usize,

    /// Smallest group allowed to proceed
    pub min_group_size: usize,

    /// Deadline for finalizing a group
    pub matchmaking_time: Duration,

    /// Extra time followers wait for the leader's descriptor
    pub grace: Duration,

    /// Lifetime of matchmaking entries in the directory
    pub entry_ttl: Duration,

    /// Maximum elements per tensor part
    pub max_part_size: usize,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            run_id: "swarm".to_string(),
            target_group_size: 16,
            min_group_size: 1,
            matchmaking_time: Duration::from_secs(5),
            grace: Duration::from_millis(2500),
            entry_ttl: Duration::from_secs(30),
            max_part_size: 1 << 16,
        }
    }
}

impl MatchmakerConfig {
    /// Build from averaging settings
    pub fn from_settings(settings: &AveragingSettings) -> Self {
        let matchmaking_time = settings.matchmaking_time();
        Self {
            run_id: settings.run_id.clone(),
            target_group_size: settings.target_group_size.max(1),
            min_group_size: settings.min_group_size.max(1),
            matchmaking_time,
            grace: matchmaking_time / 2,
            entry_ttl: (matchmaking_time * 4).max(Duration::from_secs(10)),
            max_part_size: settings.max_part_size,
        }
    }

    fn poll_interval(&self) -> Duration {
        (self.matchmaking_time / 20).max(Duration::from_millis(10))
    }
}

// ─────────────────────────────────────────────────────────────────
// Directory records
// ─────────────────────────────────────────────────────────────────

/// "Looking for a group" announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupIntent {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub weight: f64,
    pub capacity: f64,

    /// Flat tensor length; only peers with equal lengths are grouped
    pub total_elements: usize,

    pub announced_at: DateTime<Utc>,
}

impl GroupIntent {
    fn is_sane(&self) -> bool {
        self.weight.is_finite() && self.weight >= 0.0 && self.capacity.is_finite() && self.capacity >= 0.0
    }

    fn member(&self) -> GroupMember {
        GroupMember {
            peer_id: self.peer_id,
            addr: self.addr,
            weight: self.weight,
            capacity: self.capacity,
        }
    }
}

/// A leader's invitation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub leader: PeerId,
    pub group_id: Uuid,
    pub invited: Vec<PeerId>,
    pub proposed_at: DateTime<Utc>,
}

/// A follower's acceptance of a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub peer_id: PeerId,
    pub leader: PeerId,
    pub group_id: Uuid,
    pub confirmed_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────
// Pure rules
// ─────────────────────────────────────────────────────────────────

/// Split candidates (sorted by identifier) into groups of near-equal size
///
/// Uses the fewest groups that respect `target_group_size`.
pub fn plan_groups(mut candidates: Vec<GroupIntent>, target_group_size: usize) -> Vec<Vec<GroupIntent>> {
    candidates.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    candidates.dedup_by(|a, b| a.peer_id == b.peer_id);
    if candidates.is_empty() {
        return Vec::new();
    }

    let groups = candidates.len().div_ceil(target_group_size.max(1));
    let base = candidates.len() / groups;
    let extra = candidates.len() % groups;

    let mut rest = candidates.into_iter();
    (0..groups)
        .map(|i| {
            let size = if i < extra { base + 1 } else { base };
            rest.by_ref().take(size).collect()
        })
        .collect()
}

/// Leader plus every invitee that confirmed this proposal by the deadline
pub fn finalize_members(
    leader: PeerId,
    group_id: Uuid,
    invited: &[PeerId],
    confirmations: &[Confirmation],
    deadline: DateTime<Utc>,
) -> Vec<PeerId> {
    let mut members: Vec<PeerId> = invited
        .iter()
        .filter(|peer| {
            **peer == leader
                || confirmations.iter().any(|c| {
                    c.peer_id == **peer
                        && c.leader == leader
                        && c.group_id == group_id
                        && c.confirmed_at <= deadline
                })
        })
        .copied()
        .collect();
    if !members.contains(&leader) {
        members.push(leader);
    }
    members.sort();
    members
}

// ─────────────────────────────────────────────────────────────────
// Matchmaker
// ─────────────────────────────────────────────────────────────────

/// One matchmaking attempt
struct Attempt {
    epoch: u64,

    /// Records older than this belong to an earlier attempt at the epoch
    not_before: DateTime<Utc>,
    intent: GroupIntent,
    chunk: Vec<GroupIntent>,
    deadline: Instant,
    wall_deadline: DateTime<Utc>,
}

/// Negotiates averaging groups through the directory
pub struct Matchmaker {
    config: MatchmakerConfig,
    dht: Arc<DhtNode>,
}

impl Matchmaker {
    /// Create a matchmaker over a directory node
    pub fn new(config: MatchmakerConfig, dht: Arc<DhtNode>) -> Self {
        Self { config, dht }
    }

    pub fn config(&self) -> &MatchmakerConfig {
        &self.config
    }

    /// Form this peer's group for `epoch`
    pub async fn form_group(
        &self,
        epoch: u64,
        weight: f64,
        capacity: f64,
        total_elements: usize,
    ) -> Result<GroupDescriptor> {
        let started = Instant::now();
        let window = chrono::Duration::from_std(self.config.matchmaking_time)
            .map_err(|e| Error::Internal(format!("invalid matchmaking time: {}", e)))?;
        let wall_start = Utc::now();
        let wall_deadline = wall_start + window;
        let not_before = wall_start - window;

        let local = self.dht.local_contact();
        let intent = GroupIntent {
            peer_id: local.peer_id,
            addr: local.addr,
            weight,
            capacity,
            total_elements,
            announced_at: wall_start,
        };

        let key = intent_key(&self.config.run_id, epoch);
        if let Err(e) = self
            .dht
            .store_json(&key, &local.peer_id.to_hex(), &intent, self.config.entry_ttl)
            .await
        {
            debug!(epoch = epoch, error = %e, "Could not announce matchmaking intent");
        }

        tokio::time::sleep_until(started + self.config.matchmaking_time / 3).await;

        let candidates = self.read_intents(epoch, &intent, not_before).await;
        let chunk = plan_groups(candidates.clone(), self.config.target_group_size)
            .into_iter()
            .find(|chunk| chunk.iter().any(|c| c.peer_id == local.peer_id))
            .unwrap_or_else(|| vec![intent.clone()]);
        let leader = chunk.first().map(|c| c.peer_id).unwrap_or(local.peer_id);

        debug!(
            epoch = epoch,
            candidates = candidates.len(),
            chunk = chunk.len(),
            leader = %leader.short(),
            "Matchmaking candidates read"
        );

        let attempt = Attempt {
            epoch,
            not_before,
            intent,
            chunk,
            deadline: started + self.config.matchmaking_time,
            wall_deadline,
        };

        if attempt.chunk.len() == 1 {
            return self.fallback(&attempt, "no other peer is looking for a group");
        }
        if leader == local.peer_id {
            self.lead(&attempt).await
        } else {
            self.follow(&attempt).await
        }
    }

    async fn lead(&self, attempt: &Attempt) -> Result<GroupDescriptor> {
        let me = attempt.intent.peer_id;

        // A lower leader already counted us in
        if let Some(proposal) = self.lowest_proposal_for(attempt, &me).await {
            if proposal.leader < me {
                debug!(epoch = attempt.epoch, leader = %proposal.leader.short(), "Yielding to a lower leader");
                return self.join(attempt, proposal).await;
            }
        }

        let group_id = Uuid::new_v4();
        let invited: Vec<PeerId> = attempt.chunk.iter().map(|c| c.peer_id).collect();
        let proposal = Proposal {
            leader: me,
            group_id,
            invited: invited.clone(),
            proposed_at: Utc::now(),
        };

        let key = proposal_key(&self.config.run_id, attempt.epoch);
        if let Err(e) = self
            .dht
            .store_json(&key, &me.to_hex(), &proposal, self.config.entry_ttl)
            .await
        {
            return self.fallback(attempt, format!("could not publish proposal: {}", e));
        }

        let confirmed = loop {
            let at_deadline = Instant::now() >= attempt.deadline;
            let confirmations = self.read_confirmations(attempt.epoch, &me).await;
            let confirmed = finalize_members(me, group_id, &invited, &confirmations, attempt.wall_deadline);
            if confirmed.len() == invited.len() || at_deadline {
                break confirmed;
            }
            let next = (Instant::now() + self.config.poll_interval()).min(attempt.deadline);
            tokio::time::sleep_until(next).await;
        };

        if confirmed.len() < self.config.min_group_size {
            return Err(Error::no_group(
                attempt.epoch,
                format!(
                    "only {} of {} invited peers confirmed, need {}",
                    confirmed.len(),
                    invited.len(),
                    self.config.min_group_size
                ),
            ));
        }

        let members: Vec<GroupMember> = attempt
            .chunk
            .iter()
            .filter(|c| confirmed.contains(&c.peer_id))
            .map(GroupIntent::member)
            .collect();
        let descriptor = GroupDescriptor::new(
            group_id,
            attempt.epoch,
            me,
            members,
            attempt.intent.total_elements,
            self.config.max_part_size,
        )?;

        let key = group_key(&self.config.run_id, attempt.epoch, &me);
        if let Err(e) = self
            .dht
            .store_json(&key, &me.to_hex(), &descriptor, self.config.entry_ttl)
            .await
        {
            warn!(epoch = attempt.epoch, error = %e, "Could not publish group descriptor");
        }

        info!(
            epoch = attempt.epoch,
            group = %group_id,
            size = descriptor.size(),
            invited = invited.len(),
            "Group finalized"
        );
        Ok(descriptor)
    }

    async fn follow(&self, attempt: &Attempt) -> Result<GroupDescriptor> {
        let me = attempt.intent.peer_id;

        let proposal = loop {
            if let Some(proposal) = self.lowest_proposal_for(attempt, &me).await {
                break Some(proposal);
            }
            if Instant::now() >= attempt.deadline {
                break None;
            }
            let next = (Instant::now() + self.config.poll_interval()).min(attempt.deadline);
            tokio::time::sleep_until(next).await;
        };

        match proposal {
            Some(proposal) => self.join(attempt, proposal).await,
            None => self.fallback(attempt, "no leader proposed a group"),
        }
    }

    /// Confirm `proposal` and wait for the leader's descriptor
    async fn join(&self, attempt: &Attempt, proposal: Proposal) -> Result<GroupDescriptor> {
        let me = attempt.intent.peer_id;
        let now = Utc::now();
        if now > attempt.wall_deadline {
            return self.fallback(attempt, "proposal arrived after the deadline");
        }

        let confirmation = Confirmation {
            peer_id: me,
            leader: proposal.leader,
            group_id: proposal.group_id,
            confirmed_at: now,
        };
        let key = confirm_key(&self.config.run_id, attempt.epoch, &proposal.leader);
        if let Err(e) = self
            .dht
            .store_json(&key, &me.to_hex(), &confirmation, self.config.entry_ttl)
            .await
        {
            return self.fallback(attempt, format!("could not confirm: {}", e));
        }

        let give_up = attempt.deadline + self.config.grace;
        loop {
            if let Some(descriptor) = self.read_descriptor(attempt.epoch, &proposal).await {
                if descriptor.contains(&me) {
                    info!(
                        epoch = attempt.epoch,
                        group = %descriptor.group_id(),
                        leader = %proposal.leader.short(),
                        size = descriptor.size(),
                        "Joined group"
                    );
                    return Ok(descriptor);
                }
                return self.fallback(attempt, "leader finalized the group without this peer");
            }
            if Instant::now() >= give_up {
                return self.fallback(attempt, "leader never published the group");
            }
            let next = (Instant::now() + self.config.poll_interval()).min(give_up);
            tokio::time::sleep_until(next).await;
        }
    }

    /// Average alone when allowed, otherwise report that no group formed
    fn fallback(&self, attempt: &Attempt, reason: impl Into<String>) -> Result<GroupDescriptor> {
        let reason = reason.into();
        if self.config.min_group_size > 1 {
            return Err(Error::no_group(attempt.epoch, reason));
        }
        debug!(epoch = attempt.epoch, reason = %reason, "Averaging alone this epoch");
        GroupDescriptor::solo(
            attempt.epoch,
            attempt.intent.member(),
            attempt.intent.total_elements,
            self.config.max_part_size,
        )
    }

    // ─────────────────────────────────────────────────────────────
    // Directory reads
    // ─────────────────────────────────────────────────────────────

    async fn read_intents(&self, epoch: u64, own: &GroupIntent, not_before: DateTime<Utc>) -> Vec<GroupIntent> {
        let key = intent_key(&self.config.run_id, epoch);
        let mut intents: Vec<GroupIntent> = self
            .dht
            .get_json::<GroupIntent>(&key)
            .await
            .into_iter()
            .filter(|r| r.subkey == r.value.peer_id.to_hex())
            .map(|r| r.value)
            .filter(|i| i.peer_id != own.peer_id)
            .filter(|i| i.announced_at >= not_before)
            .filter(|i| i.total_elements == own.total_elements && i.is_sane())
            .collect();
        intents.push(own.clone());
        intents.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        intents
    }

    async fn lowest_proposal_for(&self, attempt: &Attempt, peer: &PeerId) -> Option<Proposal> {
        let key = proposal_key(&self.config.run_id, attempt.epoch);
        self.dht
            .get_json::<Proposal>(&key)
            .await
            .into_iter()
            .filter(|r| r.subkey == r.value.leader.to_hex())
            .map(|r| r.value)
            .filter(|p| p.invited.contains(peer) && p.proposed_at >= attempt.not_before)
            .min_by(|a, b| a.leader.cmp(&b.leader))
    }

    async fn read_confirmations(&self, epoch: u64, leader: &PeerId) -> Vec<Confirmation> {
        let key = confirm_key(&self.config.run_id, epoch, leader);
        self.dht
            .get_json::<Confirmation>(&key)
            .await
            .into_iter()
            .filter(|r| r.subkey == r.value.peer_id.to_hex())
            .map(|r| r.value)
            .collect()
    }

    async fn read_descriptor(&self, epoch: u64, proposal: &Proposal) -> Option<GroupDescriptor> {
        let key = group_key(&self.config.run_id, epoch, &proposal.leader);
        self.dht
            .get_json::<GroupDescriptor>(&key)
            .await
            .into_iter()
            .filter(|r| r.subkey == proposal.leader.to_hex())
            .map(|r| r.value)
            .find(|d| {
                d.group_id() == proposal.group_id
                    && d.leader() == proposal.leader
                    && d.epoch() == epoch
                    && d.validate().is_ok()
            })
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
