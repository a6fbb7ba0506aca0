use crate::api::{CpGroupId, CpMember};
use serde::{Deserialize, Serialize};

/// Every failure a CP Subsystem call can surface. Errors travel between members as part of
/// replicated responses, so they are plain serializable data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CpError {
    // Retried internally. Surfaces only from calls that pin a member.
    #[error("Member is not the leader of {group}. Known leader: {leader:?}")]
    NotLeader { group: CpGroupId, leader: Option<CpMember> },

    #[error("CP group {0} is unavailable. A majority of its members may be down.")]
    GroupUnavailable(CpGroupId),

    #[error("Fence token {presented} is older than {highest}")]
    StaleFenceToken { presented: u64, highest: u64 },

    #[error("Session {session_id} has expired or was closed")]
    SessionExpired { session_id: u64 },

    #[error("CP group {0} does not exist")]
    GroupNotFound(String),

    #[error("CP group {0} has been destroyed")]
    GroupDestroyed(CpGroupId),

    #[error("CP Subsystem is not enabled. CP member count is 0.")]
    CpSubsystemDisabled,

    #[error("CP Subsystem discovery is not completed yet")]
    DiscoveryIncomplete,

    // The command may or may not have been applied.
    #[error("Outcome is indeterminate: {0}")]
    Indeterminate(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Operation timed out: {0}")]
    OperationTimeout(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Codec failure: {0}")]
    Codec(String),
}

impl From<bincode::Error> for CpError {
    fn from(e: bincode::Error) -> Self {
        CpError::Codec(e.to_string())
    }
}

impl From<tonic::Status> for CpError {
    fn from(status: tonic::Status) -> Self {
        CpError::Transport(format!("{:?}: {}", status.code(), status.message()))
    }
}
