//! All-reduce engine
//!
//! Runs one averaging round over a finalized group as reduce-scatter
//! followed by all-gather. Phase deadlines are measured from the start of
//! the round in multiples of the exchange timeout `T`:
//! - Scatter: each member sends every part slice to the part owner
//! - Collect (t0 + T): owners wait for a slice from every member
//! - Report (t0 + 2T): owners broadcast which members they fully received
//! - Reassign (t0 + 3T): parts of silent owners move to live owners
//! - Gather (t0 + 4T): owners reduce over the live set and send results back
//! - Confirm (t0 + 5T): members broadcast whose reduced parts they lack
//! - Recover (t0 + 6T, 7T): if an owner failed to deliver, survivors drop
//!   it, move its parts and reduce every part again over the survivors
//!
//! The caller's buffer is only ever read. A failed round returns an error
//! and the caller keeps its pre-round tensors as they were.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::reducer::{reduce_part, PartContribution};
use crate::config::AveragingSettings;
use crate::dht::{Contact, PeerId};
use crate::error::{Error, ErrorCode, Result};
use crate::matchmaking::{GroupDescriptor, PartAssignment};
use crate::protocol::{PeerMessage, TensorPayload};
use crate::transport::{RequestHandler, Transport};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// All-reduce engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Length of each exchange phase
    pub exchange_timeout: Duration,

    /// Fewest live members a round may finish with
    pub min_live: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(5),
            min_live: 1,
        }
    }
}

impl EngineConfig {
    /// Build from averaging settings
    pub fn from_settings(settings: &AveragingSettings) -> Self {
        Self {
            exchange_timeout: settings.allreduce_timeout(),
            min_live: settings.min_group_size.max(1),
        }
    }
}

/// Result of a completed round
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    pub group_id: Uuid,

    /// Group average, same length as the local input
    pub averaged: Vec<f32>,

    /// Members whose tensors are in the average, sorted by identifier
    pub contributors: Vec<PeerId>,

    /// Members excluded from this round
    pub dropped: Vec<PeerId>,
}

// ─────────────────────────────────────────────────────────────────
// Mailboxes
// ─────────────────────────────────────────────────────────────────

/// Reduced part as received from its owner
#[derive(Debug, Clone)]
struct ReducedPart {
    owner: PeerId,
    contributors: Vec<PeerId>,
    data: Vec<f32>,
}

#[derive(Default)]
struct MailboxState {
    contributions: HashMap<usize, HashMap<PeerId, PartContribution>>,
    reports: HashMap<PeerId, Vec<PeerId>>,
    averaged: HashMap<usize, ReducedPart>,
    gather_reports: HashMap<PeerId, Vec<PeerId>>,
}

impl MailboxState {
    fn has_contribution(&self, part: usize, peer: &PeerId) -> bool {
        self.contributions
            .get(&part)
            .is_some_and(|from| from.contains_key(peer))
    }
}

/// Inbound messages of one group, possibly arriving before the round starts
struct Mailbox {
    state: Mutex<MailboxState>,
    notify: Notify,
    created: Instant,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState::default()),
            notify: Notify::new(),
            created: Instant::now(),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut MailboxState)) {
        apply(&mut self.state.lock());
        self.notify.notify_waiters();
    }

    /// Wait until `ready` holds or the deadline passes; returns the final check
    async fn wait_until<F>(&self, deadline: Instant, ready: F) -> bool
    where
        F: Fn(&MailboxState) -> bool,
    {
        loop {
            let notified = self.notify.notified();
            let done = ready(&*self.state.lock());
            if done {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let done = ready(&*self.state.lock());
                return done;
            }
        }
    }
}

/// Per-round context shared by the phases
struct Round<'a> {
    group: &'a GroupDescriptor,
    mailbox: &'a Mailbox,
    local: &'a [f32],
    weight: f64,
    started: Instant,
}

impl Round<'_> {
    fn group_id(&self) -> Uuid {
        self.group.group_id()
    }

    /// End of phase `n` (1-based)
    fn deadline(&self, phase: u32, timeout: Duration) -> Instant {
        self.started + timeout * phase
    }

    fn abort(&self, reason: impl Into<String>) -> Error {
        Error::round_aborted(self.group_id(), reason)
    }
}

// ─────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────

/// Runs averaging rounds and serves the part-transfer protocol
pub struct AllReduceEngine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    local: Contact,
    mailboxes: RwLock<HashMap<Uuid, Arc<Mailbox>>>,
}

impl AllReduceEngine {
    /// Create an engine over a transport
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Arc<Self> {
        let local = transport.local_contact();
        Arc::new(Self {
            config,
            transport,
            local,
            mailboxes: RwLock::new(HashMap::new()),
        })
    }

    /// This peer's identifier
    pub fn peer_id(&self) -> PeerId {
        self.local.peer_id
    }

    /// Configured phase timeout
    pub fn exchange_timeout(&self) -> Duration {
        self.config.exchange_timeout
    }

    /// Average `local` with the rest of the group
    pub async fn run(&self, group: &GroupDescriptor, local: &[f32]) -> Result<RoundOutcome> {
        let me = self.local.peer_id;
        let group_id = group.group_id();

        let member = group
            .member(&me)
            .ok_or_else(|| Error::round_aborted(group_id, "this peer is not a group member"))?;
        if local.len() != group.total_elements() {
            return Err(Error::round_aborted(
                group_id,
                format!(
                    "local buffer has {} elements, group expects {}",
                    local.len(),
                    group.total_elements()
                ),
            ));
        }

        if group.size() == 1 {
            debug!(group = %group_id, "Averaging alone, nothing to exchange");
            return Ok(RoundOutcome {
                group_id,
                averaged: local.to_vec(),
                contributors: vec![me],
                dropped: Vec::new(),
            });
        }

        self.purge_stale();
        let mailbox = self.mailbox(group_id);
        let round = Round {
            group,
            mailbox: &mailbox,
            local,
            weight: member.weight,
            started: Instant::now(),
        };

        let result = self.exchange(&round).await;
        self.mailboxes.write().remove(&group_id);

        match &result {
            Ok(outcome) => info!(
                group = %group_id,
                contributors = outcome.contributors.len(),
                dropped = outcome.dropped.len(),
                elapsed_ms = round.started.elapsed().as_millis() as u64,
                "Averaging round complete"
            ),
            Err(e) => warn!(group = %group_id, error = %e, "Averaging round failed"),
        }
        result
    }

    async fn exchange(&self, round: &Round<'_>) -> Result<RoundOutcome> {
        let me = self.local.peer_id;
        let group = round.group;
        let timeout = self.config.exchange_timeout;
        let members = group.peer_ids();

        // Scatter
        let sends = group
            .parts()
            .iter()
            .map(|part| self.contribute(round, part, part.owner, round.deadline(1, timeout)));
        let unreachable = join_all(sends).await.into_iter().filter(|r| r.is_err()).count();
        if unreachable > 0 {
            debug!(group = %round.group_id(), failed = unreachable, "Some part owners unreachable");
        }

        // Collect
        let owned: Vec<usize> = group.parts_owned_by(&me).iter().map(|p| p.index).collect();
        round
            .mailbox
            .wait_until(round.deadline(1, timeout), |state| {
                owned
                    .iter()
                    .all(|p| members.iter().all(|m| state.has_contribution(*p, m)))
            })
            .await;

        // Report
        let reporters = group.eligible_owners();
        if reporters.contains(&me) {
            let received_from: Vec<PeerId> = {
                let state = round.mailbox.state.lock();
                members
                    .iter()
                    .filter(|m| owned.iter().all(|p| state.has_contribution(*p, m)))
                    .copied()
                    .collect()
            };
            round.mailbox.update(|state| {
                state.reports.insert(me, received_from.clone());
            });

            let report = PeerMessage::ReducerReport {
                group_id: round.group_id(),
                received_from,
            };
            self.broadcast(round, &members, report, round.deadline(2, timeout))
                .await;
        }
        round
            .mailbox
            .wait_until(round.deadline(2, timeout), |state| {
                reporters.iter().all(|r| state.reports.contains_key(r))
            })
            .await;

        // Agree on the live set
        let reports = round.mailbox.state.lock().reports.clone();
        let responded: Vec<PeerId> = reporters
            .iter()
            .filter(|r| reports.contains_key(r))
            .copied()
            .collect();
        if responded.is_empty() {
            return Err(round.abort("no part owner reported"));
        }

        let live = live_set(&members, &reporters, &reports);
        let dropped: Vec<PeerId> = members.iter().filter(|m| !live.contains(m)).copied().collect();
        for peer in &dropped {
            let dropout = Error::PeerDroppedMidRound {
                peer_id: peer.short(),
                group_id: round.group_id().to_string(),
            };
            warn!(code = %dropout.code(), "{}", dropout);
        }

        if !live.contains(&me) {
            return Err(round.abort("this peer was excluded from the live set"));
        }
        if live.len() < self.config.min_live {
            return Err(round.abort(format!(
                "only {} of {} members live, need {}",
                live.len(),
                members.len(),
                self.config.min_live
            )));
        }

        // Reassign
        let live_owners: Vec<PeerId> = responded.iter().filter(|r| live.contains(r)).copied().collect();
        let owners = reassign_parts(group.parts(), &live, &live_owners)
            .ok_or_else(|| round.abort("no live peer can take over orphaned parts"))?;
        self.resend_moved(round, &initial_owners(group), &owners, round.deadline(3, timeout))
            .await;

        // Reduce and gather
        self.reduce_and_share(round, &owners, &live, round.deadline(3, timeout), round.deadline(4, timeout))
            .await?;

        // Confirm every member received every part
        let missing = missing_owners(round, &owners, &live);
        if !missing.is_empty() {
            debug!(
                group = %round.group_id(),
                owners = missing.len(),
                "Averaged parts missing after gather"
            );
        }
        round.mailbox.update(|state| {
            state.gather_reports.insert(me, missing.clone());
        });
        let report = PeerMessage::GatherReport {
            group_id: round.group_id(),
            missing,
        };
        self.broadcast(round, &live, report, round.deadline(5, timeout))
            .await;
        round
            .mailbox
            .wait_until(round.deadline(5, timeout), |state| {
                live.iter().all(|m| state.gather_reports.contains_key(m))
            })
            .await;

        let gather_reports = round.mailbox.state.lock().gather_reports.clone();
        let failed = failed_after_gather(&live, &gather_reports);
        if failed.is_empty() {
            let averaged = assemble(round, &owners, &live)?;
            return Ok(RoundOutcome {
                group_id: round.group_id(),
                averaged,
                contributors: live,
                dropped,
            });
        }

        // Recover: drop owners that never delivered and reduce again
        for peer in &failed {
            let dropout = Error::PeerDroppedMidRound {
                peer_id: peer.short(),
                group_id: round.group_id().to_string(),
            };
            warn!(code = %dropout.code(), "{} after agreeing on the live set", dropout);
        }
        let survivors: Vec<PeerId> = live.iter().filter(|m| !failed.contains(m)).copied().collect();
        if !survivors.contains(&me) {
            return Err(round.abort("this peer's averaged parts did not reach the group"));
        }
        if survivors.len() < self.config.min_live {
            return Err(round.abort(format!(
                "only {} of {} members survived the gather, need {}",
                survivors.len(),
                members.len(),
                self.config.min_live
            )));
        }

        let surviving_owners: Vec<PeerId> = live_owners
            .iter()
            .filter(|o| survivors.contains(o))
            .copied()
            .collect();
        let recovery_owners = reassign_parts(group.parts(), &survivors, &surviving_owners)
            .ok_or_else(|| round.abort("no surviving peer can take over orphaned parts"))?;
        self.resend_moved(round, &owners, &recovery_owners, round.deadline(6, timeout))
            .await;
        self.reduce_and_share(
            round,
            &recovery_owners,
            &survivors,
            round.deadline(6, timeout),
            round.deadline(7, timeout),
        )
        .await?;

        let averaged = assemble(round, &recovery_owners, &survivors)?;
        let mut dropped = dropped;
        dropped.extend(failed);
        dropped.sort();
        Ok(RoundOutcome {
            group_id: round.group_id(),
            averaged,
            contributors: survivors,
            dropped,
        })
    }

    /// Resend this peer's slices of parts whose owner changed
    async fn resend_moved(&self, round: &Round<'_>, before: &[PeerId], after: &[PeerId], deadline: Instant) {
        let resends = round
            .group
            .parts()
            .iter()
            .filter(|part| after[part.index] != before[part.index])
            .map(|part| self.contribute(round, part, after[part.index], deadline));
        for result in join_all(resends).await {
            if let Err(e) = result {
                debug!(group = %round.group_id(), error = %e, "Resending orphaned part failed");
            }
        }
    }

    /// Reduce the parts this peer owns over `live`, send them out, and wait
    /// until every part reduced over `live` has arrived
    ///
    /// Contributions stay in the mailbox so a later recovery pass can
    /// reduce the same parts over a smaller set.
    async fn reduce_and_share(
        &self,
        round: &Round<'_>,
        owners: &[PeerId],
        live: &[PeerId],
        collect_deadline: Instant,
        gather_deadline: Instant,
    ) -> Result<()> {
        let me = self.local.peer_id;
        let group = round.group;

        let mine: Vec<&PartAssignment> = group
            .parts()
            .iter()
            .filter(|part| owners[part.index] == me)
            .collect();
        round
            .mailbox
            .wait_until(collect_deadline, |state| {
                mine.iter()
                    .all(|p| live.iter().all(|m| state.has_contribution(p.index, m)))
            })
            .await;

        let mut reduced = Vec::with_capacity(mine.len());
        {
            let state = round.mailbox.state.lock();
            let none = HashMap::new();
            for part in &mine {
                let contributions = state.contributions.get(&part.index).unwrap_or(&none);
                let data = reduce_part(contributions, live, part.len())
                    .map_err(|e| round.abort(format!("cannot reduce part {}: {}", part.index, e)))?;
                reduced.push((part.index, data));
            }
        }

        let others: Vec<PeerId> = live.iter().filter(|p| **p != me).copied().collect();
        let deliveries = reduced.iter().map(|(index, data)| {
            let message = PeerMessage::AveragedPart {
                group_id: round.group_id(),
                part: *index,
                contributors: live.to_vec(),
                data: TensorPayload::from_slice(data),
            };
            self.broadcast(round, &others, message, gather_deadline)
        });
        join_all(deliveries).await;

        round.mailbox.update(|state| {
            for (index, data) in reduced {
                state.averaged.insert(
                    index,
                    ReducedPart {
                        owner: me,
                        contributors: live.to_vec(),
                        data,
                    },
                );
            }
        });

        round
            .mailbox
            .wait_until(gather_deadline, |state| {
                group.parts().iter().all(|part| {
                    state
                        .averaged
                        .get(&part.index)
                        .is_some_and(|r| r.owner == owners[part.index] && r.contributors == live)
                })
            })
            .await;
        Ok(())
    }

    /// Send this peer's slice of `part` to `owner`
    async fn contribute(
        &self,
        round: &Round<'_>,
        part: &PartAssignment,
        owner: PeerId,
        deadline: Instant,
    ) -> Result<()> {
        let slice = &round.local[part.range()];

        if owner == self.local.peer_id {
            round.mailbox.update(|state| {
                state.contributions.entry(part.index).or_default().insert(
                    owner,
                    PartContribution {
                        weight: round.weight,
                        data: slice.to_vec(),
                    },
                );
            });
            return Ok(());
        }

        let contact = round
            .group
            .member(&owner)
            .map(|m| m.contact())
            .ok_or_else(|| Error::Internal(format!("part owner {} is not a member", owner.short())))?;
        let message = PeerMessage::Contribution {
            group_id: round.group_id(),
            part: part.index,
            weight: round.weight,
            data: TensorPayload::from_slice(slice),
        };
        let reply = self
            .transport
            .call_peer(&contact, message, remaining(deadline))
            .await?;
        expect_ack(reply)
    }

    /// Send `message` to every listed member except this peer
    async fn broadcast(&self, round: &Round<'_>, targets: &[PeerId], message: PeerMessage, deadline: Instant) {
        let kind = message.type_name();
        let calls = targets
            .iter()
            .filter(|p| **p != self.local.peer_id)
            .filter_map(|p| round.group.member(p))
            .map(|member| {
                let contact = member.contact();
                let message = message.clone();
                async move {
                    let result = self
                        .transport
                        .call_peer(&contact, message, remaining(deadline))
                        .await
                        .and_then(expect_ack);
                    (contact, result)
                }
            });

        for (contact, result) in join_all(calls).await {
            if let Err(e) = result {
                debug!(peer = %contact, message = kind, error = %e, "Delivery failed");
            }
        }
    }

    fn mailbox(&self, group_id: Uuid) -> Arc<Mailbox> {
        if let Some(mailbox) = self.mailboxes.read().get(&group_id) {
            return Arc::clone(mailbox);
        }
        Arc::clone(
            self.mailboxes
                .write()
                .entry(group_id)
                .or_insert_with(|| Arc::new(Mailbox::new())),
        )
    }

    /// Drop mailboxes of rounds that never started or never finished here
    fn purge_stale(&self) {
        let max_age = self.config.exchange_timeout * 10;
        self.mailboxes
            .write()
            .retain(|_, mailbox| mailbox.created.elapsed() < max_age);
    }

    // ─────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────

    /// Serve one part-transfer request
    pub fn handle_request(&self, sender: Contact, message: PeerMessage) -> PeerMessage {
        match message {
            PeerMessage::Contribution {
                group_id,
                part,
                weight,
                data,
            } => {
                trace!(group = %group_id, part = part, from = %sender.peer_id.short(), "Contribution received");
                self.mailbox(group_id).update(|state| {
                    state.contributions.entry(part).or_default().insert(
                        sender.peer_id,
                        PartContribution {
                            weight,
                            data: data.into_inner(),
                        },
                    );
                });
                PeerMessage::ack()
            }
            PeerMessage::ReducerReport {
                group_id,
                received_from,
            } => {
                self.mailbox(group_id).update(|state| {
                    state.reports.insert(sender.peer_id, received_from);
                });
                PeerMessage::ack()
            }
            PeerMessage::GatherReport { group_id, missing } => {
                self.mailbox(group_id).update(|state| {
                    state.gather_reports.insert(sender.peer_id, missing);
                });
                PeerMessage::ack()
            }
            PeerMessage::AveragedPart {
                group_id,
                part,
                contributors,
                data,
            } => {
                self.mailbox(group_id).update(|state| {
                    state.averaged.insert(
                        part,
                        ReducedPart {
                            owner: sender.peer_id,
                            contributors,
                            data: data.into_inner(),
                        },
                    );
                });
                PeerMessage::ack()
            }
            other => PeerMessage::Error {
                code: ErrorCode::ProtocolUnexpected.as_str(),
                message: format!("{} is not an averaging request", other.type_name()),
            },
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for AllReduceEngine {
    async fn handle(&self, sender: Contact, message: PeerMessage) -> PeerMessage {
        self.handle_request(sender, message)
    }
}

// ─────────────────────────────────────────────────────────────────
// Round helpers
// ─────────────────────────────────────────────────────────────────

fn remaining(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1))
}

fn expect_ack(reply: PeerMessage) -> Result<()> {
    match reply {
        PeerMessage::Ack { accepted: true, .. } => Ok(()),
        PeerMessage::Ack { reason, .. } => Err(Error::unexpected_reply(
            "ACK",
            format!("rejection ({})", reason.unwrap_or_default()),
        )),
        other => Err(Error::unexpected_reply("ACK", other.type_name())),
    }
}

/// Members every report vouches for, minus owners that never reported
fn live_set(
    members: &[PeerId],
    reporters: &[PeerId],
    reports: &HashMap<PeerId, Vec<PeerId>>,
) -> Vec<PeerId> {
    members
        .iter()
        .filter(|m| {
            let silent = reporters.contains(m) && !reports.contains_key(m);
            !silent
                && reporters
                    .iter()
                    .filter_map(|r| reports.get(r))
                    .all(|received| received.contains(m))
        })
        .copied()
        .collect()
}

/// Owner of each part after moving orphans round-robin onto live owners
///
/// Returns `None` when a part is orphaned and nobody can take it.
fn reassign_parts(parts: &[PartAssignment], live: &[PeerId], live_owners: &[PeerId]) -> Option<Vec<PeerId>> {
    let mut owners = Vec::with_capacity(parts.len());
    let mut next = 0;
    for part in parts {
        if live.contains(&part.owner) {
            owners.push(part.owner);
            continue;
        }
        if live_owners.is_empty() {
            return None;
        }
        owners.push(live_owners[next % live_owners.len()]);
        next += 1;
    }
    Some(owners)
}

/// Owner of each part as planned in the group descriptor
fn initial_owners(group: &GroupDescriptor) -> Vec<PeerId> {
    group.parts().iter().map(|part| part.owner).collect()
}

/// Owners whose part, reduced over `live`, has not arrived here
fn missing_owners(round: &Round<'_>, owners: &[PeerId], live: &[PeerId]) -> Vec<PeerId> {
    let state = round.mailbox.state.lock();
    let mut missing: Vec<PeerId> = round
        .group
        .parts()
        .iter()
        .filter(|part| {
            !state
                .averaged
                .get(&part.index)
                .is_some_and(|r| r.owner == owners[part.index] && r.contributors == live)
        })
        .map(|part| owners[part.index])
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

/// Live members that went silent after the gather or whose parts someone lacks
fn failed_after_gather(live: &[PeerId], reports: &HashMap<PeerId, Vec<PeerId>>) -> Vec<PeerId> {
    live.iter()
        .filter(|m| !reports.contains_key(m) || reports.values().any(|missing| missing.contains(m)))
        .copied()
        .collect()
}

/// Stitch received parts into one buffer, checking every part agrees on `live`
fn assemble(round: &Round<'_>, owners: &[PeerId], live: &[PeerId]) -> Result<Vec<f32>> {
    let mut state = round.mailbox.state.lock();
    let mut averaged = vec![0.0f32; round.group.total_elements()];

    for part in round.group.parts() {
        let reduced = state
            .averaged
            .remove(&part.index)
            .ok_or_else(|| round.abort(format!("part {} never arrived", part.index)))?;
        if reduced.owner != owners[part.index] {
            return Err(round.abort(format!(
                "part {} came from {} instead of its owner",
                part.index,
                reduced.owner.short()
            )));
        }
        if reduced.contributors != live {
            return Err(round.abort(format!(
                "part {} was reduced over a different contributor set",
                part.index
            )));
        }
        if reduced.data.len() != part.len() {
            return Err(round.abort(format!(
                "part {} has {} elements, expected {}",
                part.index,
                reduced.data.len(),
                part.len()
            )));
        }
        averaged[part.range()].copy_from_slice(&reduced.data);
    }

    Ok(averaged)
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchmaking::GroupMember;
    use crate::transport::{MemoryNetwork, MemoryTransport};

    const ELEMENTS: usize = 6;

    fn test_config(min_live: usize) -> EngineConfig {
        EngineConfig {
            exchange_timeout: Duration::from_millis(150),
            min_live,
        }
    }

    struct Swarm {
        net: Arc<MemoryNetwork>,
        transports: Vec<Arc<MemoryTransport>>,
        engines: Vec<Arc<AllReduceEngine>>,
    }

    fn swarm(n: usize, min_live: usize) -> Swarm {
        let net = MemoryNetwork::new();
        let mut transports = Vec::new();
        let mut engines = Vec::new();
        for _ in 0..n {
            let transport = net.transport(PeerId::random());
            let engine = AllReduceEngine::new(transport.clone(), test_config(min_live));
            transport.serve(engine.clone()).unwrap();
            transports.push(transport);
            engines.push(engine);
        }
        Swarm {
            net,
            transports,
            engines,
        }
    }

    fn group(swarm: &Swarm, weights: &[f64], capacities: &[f64]) -> GroupDescriptor {
        let members: Vec<GroupMember> = swarm
            .transports
            .iter()
            .zip(weights.iter().zip(capacities))
            .map(|(t, (weight, capacity))| GroupMember {
                peer_id: t.local_contact().peer_id,
                addr: t.local_contact().addr,
                weight: *weight,
                capacity: *capacity,
            })
            .collect();
        let leader = members.iter().map(|m| m.peer_id).min().unwrap();
        GroupDescriptor::new(Uuid::new_v4(), 1, leader, members, ELEMENTS, 2).unwrap()
    }

    fn inputs() -> Vec<Vec<f32>> {
        vec![vec![10.0; ELEMENTS], vec![20.0; ELEMENTS], vec![30.0; ELEMENTS]]
    }

    #[tokio::test]
    async fn test_three_equal_peers_average() {
        let swarm = swarm(3, 1);
        let group = group(&swarm, &[1.0; 3], &[1.0; 3]);
        let inputs = inputs();

        let results = join_all(
            swarm
                .engines
                .iter()
                .zip(&inputs)
                .map(|(engine, input)| engine.run(&group, input)),
        )
        .await;

        for result in results {
            let outcome = result.unwrap();
            assert_eq!(outcome.averaged, vec![20.0; ELEMENTS]);
            assert_eq!(outcome.contributors.len(), 3);
            assert!(outcome.dropped.is_empty());
        }
    }

    #[tokio::test]
    async fn test_weighted_average() {
        let swarm = swarm(3, 1);
        let group = group(&swarm, &[1.0, 1.0, 2.0], &[1.0; 3]);
        let inputs = inputs();

        let results = join_all(
            swarm
                .engines
                .iter()
                .zip(&inputs)
                .map(|(engine, input)| engine.run(&group, input)),
        )
        .await;

        for result in results {
            assert_eq!(result.unwrap().averaged, vec![22.5; ELEMENTS]);
        }
    }

    #[tokio::test]
    async fn test_peer_dead_before_contributing_is_excluded() {
        let swarm = swarm(3, 1);
        let group = group(&swarm, &[1.0; 3], &[1.0; 3]);
        let inputs = inputs();
        let victim = swarm.engines[2].peer_id();
        swarm.net.kill(&victim);

        let results = join_all(
            swarm.engines[..2]
                .iter()
                .zip(&inputs)
                .map(|(engine, input)| engine.run(&group, input)),
        )
        .await;

        for result in results {
            let outcome = result.unwrap();
            assert_eq!(outcome.averaged, vec![15.0; ELEMENTS]);
            assert_eq!(outcome.dropped, vec![victim]);
        }
    }

    #[tokio::test]
    async fn test_peer_killed_after_contributing_is_excluded() {
        let swarm = swarm(3, 1);
        let group = group(&swarm, &[1.0; 3], &[1.0; 3]);
        let inputs = inputs();

        // The victim delivers all of its slices, then crashes
        let victim = &swarm.transports[2];
        let victim_id = victim.local_contact().peer_id;
        for part in group.parts().iter().filter(|p| p.owner != victim_id) {
            let owner = group.member(&part.owner).unwrap().contact();
            let message = PeerMessage::Contribution {
                group_id: group.group_id(),
                part: part.index,
                weight: 1.0,
                data: TensorPayload::from_slice(&inputs[2][part.range()]),
            };
            victim
                .call_peer(&owner, message, Duration::from_millis(100))
                .await
                .unwrap();
        }
        swarm.net.kill(&victim_id);

        let results = join_all(
            swarm.engines[..2]
                .iter()
                .zip(&inputs)
                .map(|(engine, input)| engine.run(&group, input)),
        )
        .await;

        for result in results {
            let outcome = result.unwrap();
            assert_eq!(outcome.averaged, vec![15.0; ELEMENTS]);
            assert!(!outcome.contributors.contains(&victim_id));
        }
    }

    #[tokio::test]
    async fn test_owner_lost_after_reporting_is_recovered() {
        let swarm = swarm(3, 1);
        let group = group(&swarm, &[1.0; 3], &[1.0; 3]);
        let inputs = inputs();
        let ids: Vec<PeerId> = swarm.engines.iter().map(|e| e.peer_id()).collect();
        let victim = &swarm.transports[2];
        let victim_id = ids[2];
        assert!(!group.parts_owned_by(&victim_id).is_empty());

        // The victim contributes, vouches for everyone, then crashes before
        // sending back the parts it reduced
        let victim_script = async {
            for part in group.parts().iter().filter(|p| p.owner != victim_id) {
                let owner = group.member(&part.owner).unwrap().contact();
                let message = PeerMessage::Contribution {
                    group_id: group.group_id(),
                    part: part.index,
                    weight: 1.0,
                    data: TensorPayload::from_slice(&inputs[2][part.range()]),
                };
                victim
                    .call_peer(&owner, message, Duration::from_millis(100))
                    .await
                    .unwrap();
            }

            let owned: Vec<usize> = group.parts_owned_by(&victim_id).iter().map(|p| p.index).collect();
            let mailbox = swarm.engines[2].mailbox(group.group_id());
            let received = mailbox
                .wait_until(Instant::now() + Duration::from_millis(500), |state| {
                    owned
                        .iter()
                        .all(|p| ids[..2].iter().all(|m| state.has_contribution(*p, m)))
                })
                .await;
            assert!(received);

            for survivor in &ids[..2] {
                let contact = group.member(survivor).unwrap().contact();
                let report = PeerMessage::ReducerReport {
                    group_id: group.group_id(),
                    received_from: ids.clone(),
                };
                victim
                    .call_peer(&contact, report, Duration::from_millis(100))
                    .await
                    .unwrap();
            }
            swarm.net.kill(&victim_id);
        };

        let survivors = join_all(
            swarm.engines[..2]
                .iter()
                .zip(&inputs)
                .map(|(engine, input)| engine.run(&group, input)),
        );
        let (results, ()) = tokio::join!(survivors, victim_script);

        for result in results {
            let outcome = result.unwrap();
            assert_eq!(outcome.averaged, vec![15.0; ELEMENTS]);
            assert!(!outcome.contributors.contains(&victim_id));
            assert_eq!(outcome.dropped, vec![victim_id]);
        }
    }

    #[test]
    fn test_failed_after_gather() {
        let mut ids: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        ids.sort();
        let (a, b, c) = (ids[0], ids[1], ids[2]);

        let mut reports = HashMap::new();
        reports.insert(a, vec![]);
        reports.insert(b, vec![]);
        reports.insert(c, vec![]);
        assert!(failed_after_gather(&ids, &reports).is_empty());

        // b lacks c's parts; a never confirmed
        reports.insert(b, vec![c]);
        reports.remove(&a);
        assert_eq!(failed_after_gather(&ids, &reports), vec![a, c]);
    }

    #[tokio::test]
    async fn test_quorum_loss_aborts_and_keeps_input() {
        let swarm = swarm(3, 3);
        let group = group(&swarm, &[1.0; 3], &[1.0; 3]);
        let inputs = inputs();
        let before = inputs.clone();
        swarm.net.kill(&swarm.engines[2].peer_id());

        let results = join_all(
            swarm.engines[..2]
                .iter()
                .zip(&inputs)
                .map(|(engine, input)| engine.run(&group, input)),
        )
        .await;

        for result in results {
            let err = result.unwrap_err();
            assert_eq!(err.code(), ErrorCode::RoundAborted);
            assert!(!err.is_fatal());
        }
        assert_eq!(inputs, before);
    }

    #[tokio::test]
    async fn test_client_mode_member_contributes() {
        let swarm = swarm(3, 1);
        let group = group(&swarm, &[1.0; 3], &[1.0, 1.0, 0.0]);
        let client = swarm.engines[2].peer_id();
        assert!(group.parts_owned_by(&client).is_empty());
        let inputs = inputs();

        let results = join_all(
            swarm
                .engines
                .iter()
                .zip(&inputs)
                .map(|(engine, input)| engine.run(&group, input)),
        )
        .await;

        for result in results {
            let outcome = result.unwrap();
            assert_eq!(outcome.averaged, vec![20.0; ELEMENTS]);
            assert!(outcome.contributors.contains(&client));
        }
    }

    #[tokio::test]
    async fn test_solo_group_returns_input() {
        let swarm = swarm(1, 1);
        let group = group(&swarm, &[1.0], &[1.0]);
        let input = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let outcome = swarm.engines[0].run(&group, &input).await.unwrap();
        assert_eq!(outcome.averaged, input);
        assert_eq!(outcome.contributors, vec![swarm.engines[0].peer_id()]);
    }

    #[tokio::test]
    async fn test_non_member_and_wrong_length_rejected() {
        let outsider = swarm(1, 1);
        let swarm = swarm(3, 1);
        let group = group(&swarm, &[1.0; 3], &[1.0; 3]);

        let err = outsider.engines[0].run(&group, &[0.0; ELEMENTS]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoundAborted);

        let err = swarm.engines[0].run(&group, &[0.0; 2]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoundAborted);
    }

    #[test]
    fn test_live_set_intersects_reports() {
        let peers: Vec<PeerId> = {
            let mut p: Vec<PeerId> = (0..4).map(|_| PeerId::random()).collect();
            p.sort();
            p
        };
        let (a, b, c, d) = (peers[0], peers[1], peers[2], peers[3]);
        let reporters = vec![a, b, c];

        let mut reports = HashMap::new();
        reports.insert(a, vec![a, b, c, d]);
        reports.insert(b, vec![a, b, d]);

        // c never reported, b never heard from c
        assert_eq!(live_set(&peers, &reporters, &reports), vec![a, b, d]);
    }

    #[test]
    fn test_orphans_reassigned_round_robin() {
        let mut ids: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        ids.sort();
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        let part = |index, owner| PartAssignment {
            index,
            owner,
            start: index,
            end: index + 1,
        };
        let parts = vec![part(0, a), part(1, c), part(2, c), part(3, c), part(4, b)];

        let owners = reassign_parts(&parts, &[a, b], &[a, b]).unwrap();
        assert_eq!(owners, vec![a, a, b, a, b]);

        assert!(reassign_parts(&parts, &[a, b], &[]).is_none());
    }

    #[test]
    fn test_unexpected_request_rejected() {
        let swarm = swarm(1, 1);
        let reply = swarm.engines[0].handle_request(
            swarm.transports[0].local_contact(),
            PeerMessage::Ping { nonce: 1 },
        );
        assert!(matches!(reply, PeerMessage::Error { .. }));
    }
}
