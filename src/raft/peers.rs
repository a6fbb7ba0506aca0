use crate::api::CpMember;
use std::collections::HashSet;
use uuid::Uuid;

/// ClusterTracker knows the voting members of one CP group as seen by the local RaftNode. The
/// member list changes when a MEMBERSHIP_CHANGE entry is appended or truncated, or a snapshot
/// is installed.
pub(crate) struct ClusterTracker {
    me: CpMember,
    members: Vec<CpMember>,
}

impl ClusterTracker {
    pub(crate) fn new(me: CpMember, members: Vec<CpMember>) -> Self {
        ClusterTracker { me, members }
    }

    pub(crate) fn my_id(&self) -> Uuid {
        self.me.uuid()
    }

    pub(crate) fn am_i_voting(&self) -> bool {
        self.contains_member(&self.me.uuid())
    }

    pub(crate) fn contains_member(&self, id: &Uuid) -> bool {
        self.members.iter().any(|m| &m.uuid() == id)
    }

    pub(crate) fn member(&self, id: &Uuid) -> Option<&CpMember> {
        self.members.iter().find(|m| &m.uuid() == id)
    }

    pub(crate) fn members(&self) -> &[CpMember] {
        &self.members
    }

    pub(crate) fn iter_peers(&self) -> impl Iterator<Item = &CpMember> {
        let my_id = self.me.uuid();
        self.members.iter().filter(move |m| m.uuid() != my_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<Uuid> {
        self.iter_peers().map(|m| m.uuid()).collect()
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.members.len()
    }

    /// Replaces the member list, returning true if it changed.
    pub(crate) fn set_members(&mut self, members: Vec<CpMember>) -> bool {
        if self.members == members {
            return false;
        }
        self.members = members;
        true
    }
}
