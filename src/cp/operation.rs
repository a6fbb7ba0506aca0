use crate::api::{CpError, CpGroupId, CpMember};
use serde::{Deserialize, Serialize};

/// Member-to-member operations carried by the transport's `invoke` call.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Operation {
    /// Append a command to a group's log through the local RaftNode.
    Submit { group_id: CpGroupId, command: Vec<u8> },
    ChangeMembership { group_id: CpGroupId, members: Vec<CpMember> },
    CreateRaftNode { group_id: CpGroupId, members: Vec<CpMember> },
    DestroyRaftNode { group_id: CpGroupId },
    /// Stop the local RaftNode of a group this member was removed from.
    LeaveRaftNode { group_id: CpGroupId },
    /// What the receiving member believes the metadata group is.
    DescribeMetadata,
    /// Wipe every local RaftNode and bootstrap again under a new metadata seed.
    Reset { metadata_seed: u64 },
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum InvokeResult {
    Ok(Vec<u8>),
    // Never appended.
    NotLeader { leader: Option<CpMember> },
    // Appended, then leadership was lost. May still commit.
    LeaderChanged { leader: Option<CpMember> },
    MembershipChangeInProgress,
    GroupNotFound,
    GroupDestroyed,
    Failed(CpError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct MetadataGroupInfo {
    pub(crate) group_id: CpGroupId,
    pub(crate) members: Vec<CpMember>,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CpError> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CpError> {
    Ok(bincode::deserialize(bytes)?)
}
