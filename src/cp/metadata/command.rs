use crate::api::{CpError, CpGroup, CpGroupId, CpGroupStatus, CpMember};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Commands replicated through the metadata group's log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum MetadataCommand {
    InitMetadata {
        cp_members: Vec<CpMember>,
        metadata_members: Vec<CpMember>,
        group_size: usize,
    },
    GetState,
    GetOrCreateGroup {
        name: String,
    },
    ForceDestroyGroup {
        name: String,
    },
    CompleteDestroyGroup {
        group_id: CpGroupId,
    },
    AddCpMember {
        member: CpMember,
        max_cp_member_count: usize,
    },
    RemoveCpMember {
        member: Uuid,
    },
    CompleteMembershipChange {
        group_id: CpGroupId,
        members: Vec<CpMember>,
    },
}

/// One group's pending move from one member list to another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct GroupMembershipChange {
    pub(crate) group_id: CpGroupId,
    pub(crate) members_before: Vec<CpMember>,
    pub(crate) members_after: Vec<CpMember>,
}

/// A consistent read of everything the metadata group knows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MetadataState {
    pub(crate) initialized: bool,
    pub(crate) cp_members: Vec<CpMember>,
    // Latest incarnation of every group, the metadata group included.
    pub(crate) groups: Vec<CpGroup>,
    pub(crate) destroyed: Vec<CpGroupId>,
    pub(crate) pending_changes: Vec<GroupMembershipChange>,
}

impl MetadataState {
    pub(crate) fn group_by_name(&self, name: &str) -> Option<&CpGroup> {
        self.groups.iter().find(|g| g.id().name() == name)
    }

    pub(crate) fn active_groups(&self) -> impl Iterator<Item = &CpGroup> {
        self.groups.iter().filter(|g| g.status() == CpGroupStatus::Active)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MetadataValue {
    None,
    State(MetadataState),
    Group(CpGroup),
    Changes(Vec<GroupMembershipChange>),
}

pub(crate) type MetadataResponse = Result<MetadataValue, CpError>;

impl MetadataValue {
    pub(crate) fn into_state(self) -> Result<MetadataState, CpError> {
        match self {
            MetadataValue::State(state) => Ok(state),
            other => Err(CpError::Codec(format!("Expected metadata state, got {:?}", other))),
        }
    }

    pub(crate) fn into_group(self) -> Result<CpGroup, CpError> {
        match self {
            MetadataValue::Group(group) => Ok(group),
            other => Err(CpError::Codec(format!("Expected group, got {:?}", other))),
        }
    }

    pub(crate) fn into_changes(self) -> Result<Vec<GroupMembershipChange>, CpError> {
        match self {
            MetadataValue::Changes(changes) => Ok(changes),
            other => Err(CpError::Codec(format!("Expected membership changes, got {:?}", other))),
        }
    }
}
