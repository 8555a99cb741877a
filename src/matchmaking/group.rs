//! Group descriptor: the finalized membership of one averaging round

use std::collections::HashSet;
use std::net::SocketAddr;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::averaging::{load_balance, split_parts};
use crate::dht::{Contact, PeerId};
use crate::error::{Error, Result};

/// One member of an averaging group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub peer_id: PeerId,
    pub addr: SocketAddr,

    /// Weight of this member's tensors in the average
    pub weight: f64,

    /// Capacity used to size this member's share of parts (0 = client mode)
    pub capacity: f64,
}

impl GroupMember {
    /// Contact to reach this member
    pub fn contact(&self) -> Contact {
        Contact::new(self.peer_id, self.addr)
    }
}

/// A contiguous tensor slice and the member that reduces it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartAssignment {
    pub index: usize,
    pub owner: PeerId,
    pub start: usize,
    pub end: usize,
}

impl PartAssignment {
    /// Element range of the part
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the part holds no elements
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Finalized membership and part ownership for one round
///
/// Built once by the group leader and never modified afterwards; every
/// member derives identical part ranges from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    group_id: Uuid,
    epoch: u64,
    leader: PeerId,
    members: Vec<GroupMember>,
    total_elements: usize,
    parts: Vec<PartAssignment>,
}

impl GroupDescriptor {
    /// Build a descriptor, sorting members and assigning parts by capacity
    pub fn new(
        group_id: Uuid,
        epoch: u64,
        leader: PeerId,
        mut members: Vec<GroupMember>,
        total_elements: usize,
        max_part_size: usize,
    ) -> Result<Self> {
        members.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        members.dedup_by(|a, b| a.peer_id == b.peer_id);

        if members.is_empty() {
            return Err(Error::no_group(epoch, "group has no members"));
        }

        let capacities: Vec<f64> = if members.len() == 1 {
            // A lone peer always reduces its own tensors
            vec![1.0]
        } else {
            members.iter().map(|m| m.capacity).collect()
        };
        let spans = load_balance(total_elements, &capacities)
            .ok_or_else(|| Error::no_group(epoch, "no member is able to own tensor parts"))?;

        let parts = split_parts(&spans, max_part_size)
            .into_iter()
            .enumerate()
            .map(|(index, (member, range))| PartAssignment {
                index,
                owner: members[member].peer_id,
                start: range.start,
                end: range.end,
            })
            .collect();

        Ok(Self {
            group_id,
            epoch,
            leader,
            members,
            total_elements,
            parts,
        })
    }

    /// Single-member group averaging only with itself
    pub fn solo(epoch: u64, member: GroupMember, total_elements: usize, max_part_size: usize) -> Result<Self> {
        let leader = member.peer_id;
        Self::new(Uuid::new_v4(), epoch, leader, vec![member], total_elements, max_part_size)
    }

    pub fn group_id(&self) -> Uuid {
        self.group_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn leader(&self) -> PeerId {
        self.leader
    }

    /// Members sorted by identifier
    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    pub fn total_elements(&self) -> usize {
        self.total_elements
    }

    /// Parts in buffer order
    pub fn parts(&self) -> &[PartAssignment] {
        &self.parts
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn member(&self, peer_id: &PeerId) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.peer_id == *peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.member(peer_id).is_some()
    }

    /// Identifiers of all members
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.members.iter().map(|m| m.peer_id).collect()
    }

    /// Parts originally owned by `peer_id`
    pub fn parts_owned_by(&self, peer_id: &PeerId) -> Vec<&PartAssignment> {
        self.parts.iter().filter(|p| p.owner == *peer_id).collect()
    }

    /// Members allowed to own parts, sorted by identifier
    pub fn eligible_owners(&self) -> Vec<PeerId> {
        if self.members.len() == 1 {
            return self.peer_ids();
        }
        self.members
            .iter()
            .filter(|m| m.capacity.is_finite() && m.capacity > 0.0)
            .map(|m| m.peer_id)
            .collect()
    }

    /// Check a descriptor received from another peer
    pub fn validate(&self) -> Result<()> {
        let malformed = |message: String| Error::ProtocolMalformed { message };

        if self.members.is_empty() {
            return Err(malformed("group has no members".into()));
        }
        if self.members.windows(2).any(|w| w[0].peer_id >= w[1].peer_id) {
            return Err(malformed("members are not sorted and unique".into()));
        }
        if !self.contains(&self.leader) {
            return Err(malformed("leader is not a member".into()));
        }

        let members: HashSet<PeerId> = self.peer_ids().into_iter().collect();
        let mut next = 0;
        for (i, part) in self.parts.iter().enumerate() {
            if part.index != i || part.start != next || part.end <= part.start {
                return Err(malformed(format!("part {} does not tile the buffer", i)));
            }
            if !members.contains(&part.owner) {
                return Err(malformed(format!("part {} is owned by a non-member", i)));
            }
            next = part.end;
        }
        if next != self.total_elements {
            return Err(malformed(format!(
                "parts cover {} of {} elements",
                next, self.total_elements
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(capacity: f64) -> GroupMember {
        GroupMember {
            peer_id: PeerId::random(),
            addr: "127.0.0.1:4000".parse().unwrap(),
            weight: 1.0,
            capacity,
        }
    }

    #[test]
    fn test_members_sorted_and_parts_tile() {
        let members = vec![member(1.0), member(2.0), member(1.0)];
        let leader = members.iter().map(|m| m.peer_id).min().unwrap();
        let group = GroupDescriptor::new(Uuid::new_v4(), 3, leader, members, 1000, 100).unwrap();

        assert!(group.members().windows(2).all(|w| w[0].peer_id < w[1].peer_id));
        assert!(group.validate().is_ok());
        assert!(group.parts().iter().all(|p| p.len() <= 100));
        assert_eq!(group.parts().last().unwrap().end, 1000);
    }

    #[test]
    fn test_client_mode_member_owns_nothing() {
        let client = member(0.0);
        let server = member(1.0);
        let group = GroupDescriptor::new(
            Uuid::new_v4(),
            0,
            server.peer_id,
            vec![client.clone(), server.clone()],
            50,
            16,
        )
        .unwrap();

        assert!(group.parts_owned_by(&client.peer_id).is_empty());
        assert_eq!(group.eligible_owners(), vec![server.peer_id]);
    }

    #[test]
    fn test_all_clients_cannot_form_group() {
        let a = member(0.0);
        let b = member(0.0);
        let err = GroupDescriptor::new(Uuid::new_v4(), 2, a.peer_id, vec![a, b], 10, 10).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NoGroupFormed);
    }

    #[test]
    fn test_solo_client_owns_everything() {
        let lone = member(0.0);
        let group = GroupDescriptor::solo(1, lone.clone(), 10, 4).unwrap();
        assert_eq!(group.size(), 1);
        assert_eq!(group.parts_owned_by(&lone.peer_id).len(), 3);
    }

    #[test]
    fn test_identical_inputs_give_identical_parts() {
        let members = vec![member(1.0), member(3.0), member(2.0)];
        let leader = members[0].peer_id;
        let id = Uuid::new_v4();

        let a = GroupDescriptor::new(id, 1, leader, members.clone(), 777, 50).unwrap();
        let mut shuffled = members;
        shuffled.reverse();
        let b = GroupDescriptor::new(id, 1, leader, shuffled, 777, 50).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_validate_rejects_tampering() {
        let members = vec![member(1.0), member(1.0)];
        let leader = members[0].peer_id;
        let mut group = GroupDescriptor::new(Uuid::new_v4(), 0, leader, members, 10, 10).unwrap();
        group.total_elements = 11;
        assert!(group.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_validates() {
        let members = vec![member(1.0), member(1.0), member(0.0)];
        let leader = members[1].peer_id;
        let group = GroupDescriptor::new(Uuid::new_v4(), 9, leader, members, 64, 8).unwrap();
        let json = serde_json::to_string(&group).unwrap();
        let back: GroupDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, group);
        assert!(back.validate().is_ok());
    }
}
