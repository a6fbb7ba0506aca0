use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// A member eligible to host CP groups. Also how platform members are identified; a platform
/// member becomes a CP member by keeping its identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpMember {
    uuid: Uuid,
    address: SocketAddr,
}

impl CpMember {
    pub fn new(uuid: Uuid, address: SocketAddr) -> Self {
        CpMember { uuid, address }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

/// Identifies one incarnation of a CP group. A group that is destroyed and created again under
/// the same name gets a new seed, so stale ids never reach the new group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CpGroupId {
    name: String,
    seed: u64,
}

impl CpGroupId {
    pub fn new<S: Into<String>>(name: S, seed: u64) -> Self {
        CpGroupId {
            name: name.into(),
            seed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl fmt::Display for CpGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.seed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpGroupStatus {
    Active,
    Destroying,
    Destroyed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpGroup {
    id: CpGroupId,
    members: Vec<CpMember>,
    status: CpGroupStatus,
}

impl CpGroup {
    pub(crate) fn new(id: CpGroupId, members: Vec<CpMember>, status: CpGroupStatus) -> Self {
        CpGroup { id, members, status }
    }

    pub fn id(&self) -> &CpGroupId {
        &self.id
    }

    pub fn members(&self) -> &[CpMember] {
        &self.members
    }

    pub fn status(&self) -> CpGroupStatus {
        self.status
    }

    pub fn contains(&self, member: &Uuid) -> bool {
        self.members.iter().any(|m| &m.uuid() == member)
    }
}

/// A client endpoint's liveness record in one CP group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpSession {
    pub id: u64,
    pub endpoint: Uuid,
    pub creation_time_millis: u64,
    pub expiration_time_millis: u64,
    // Incremented by every heartbeat.
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    MemberAdded(CpMember),
    MemberRemoved(CpMember),
}

impl MembershipEvent {
    pub fn member(&self) -> &CpMember {
        match self {
            MembershipEvent::MemberAdded(m) | MembershipEvent::MemberRemoved(m) => m,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AvailabilityChange {
    /// Some members are unreachable but a majority is still up.
    Decreased,
    /// Fewer than a majority are up. The group cannot commit.
    MajorityLost,
    /// A majority is back after `MajorityLost`, though some members are still unreachable.
    MajorityRegained,
    /// Every member is reachable again.
    Restored,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpGroupAvailabilityEvent {
    pub group_id: CpGroupId,
    pub members: Vec<CpMember>,
    pub unavailable_members: Vec<CpMember>,
    pub change: AvailabilityChange,
}

impl CpGroupAvailabilityEvent {
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn is_majority_available(&self) -> bool {
        self.members.len() - self.unavailable_members.len() >= self.majority()
    }
}
