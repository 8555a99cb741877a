//! Coordinator-free group formation
//!
//! Every round, peers looking to average announce themselves in the
//! directory and agree on groups by a deterministic rule: candidates are
//! sorted by identifier, cut into groups, and the lowest identifier of each
//! group leads it. Directory keys (all under the run namespace):
//! - `{run}_matchmaking_{epoch}`: one intent per looking peer
//! - `{run}_proposal_{epoch}`: one proposal per leader
//! - `{run}_confirm_{epoch}_{leader}`: confirmations addressed to a leader
//! - `{run}_group_{epoch}_{leader}`: the finalized group descriptor

pub mod group;
pub mod matchmaker;

pub use group::{GroupDescriptor, GroupMember, PartAssignment};
pub use matchmaker::{
    finalize_members, plan_groups, Confirmation, GroupIntent, Matchmaker, MatchmakerConfig, Proposal,
};

use crate::dht::PeerId;

/// Key holding the intents of one epoch
pub fn intent_key(run_id: &str, epoch: u64) -> String {
    format!("{}_matchmaking_{}", run_id, epoch)
}

/// Key holding the leader proposals of one epoch
pub fn proposal_key(run_id: &str, epoch: u64) -> String {
    format!("{}_proposal_{}", run_id, epoch)
}

/// Key holding confirmations addressed to `leader`
pub fn confirm_key(run_id: &str, epoch: u64, leader: &PeerId) -> String {
    format!("{}_confirm_{}_{}", run_id, epoch, leader.to_hex())
}

/// Key holding the descriptor published by `leader`
pub fn group_key(run_id: &str, epoch: u64, leader: &PeerId) -> String {
    format!("{}_group_{}_{}", run_id, epoch, leader.to_hex())
}
