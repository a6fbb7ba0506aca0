use crate::actor::ActorExited;
use crate::api::CpMember;
use crate::commitlog::Index;
use crate::raft::write_ahead_log::WriteAheadLogEntry;
use crate::raft::Term;
use bytes::Bytes;
use std::io;
use uuid::Uuid;

#[derive(Debug)]
pub(crate) struct SubmitInput {
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct SubmitOutput {
    pub(crate) response: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SubmitError {
    // Never appended. Safe to send elsewhere.
    #[error("Not leader. Known leader: {leader:?}")]
    NotLeader { leader: Option<CpMember> },

    // Appended but leadership was lost before it was applied. It may or may not commit.
    #[error("Leadership changed while waiting on the entry. Known leader: {leader:?}")]
    LeaderChanged { leader: Option<CpMember> },

    #[error("Another membership change is not committed yet")]
    MembershipChangeInProgress,

    #[error("Raft node was terminated")]
    Terminated,

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    #[error("Raft node actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for SubmitError {
    fn from(_: ActorExited) -> Self {
        SubmitError::ActorExited
    }
}

#[derive(Debug)]
pub(crate) struct ChangeMembershipInput {
    pub(crate) members: Vec<CpMember>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: Uuid,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) term: Term,
    pub(crate) vote_granted: bool,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RequestVoteError {
    #[error("Raft node was terminated")]
    Terminated,
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for RequestVoteError {
    fn from(_: ActorExited) -> Self {
        RequestVoteError::ActorExited
    }
}

#[derive(Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: Uuid,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<WriteAheadLogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    pub(crate) term: Term,
    pub(crate) success: bool,
    // On success, the last index we now share with the leader. On failure, our last index.
    pub(crate) match_index: Option<Index>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum AppendEntriesError {
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("Raft node was terminated")]
    Terminated,
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for AppendEntriesError {
    fn from(_: ActorExited) -> Self {
        AppendEntriesError::ActorExited
    }
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: Uuid,
    pub(crate) last_included_index: Index,
    pub(crate) last_included_term: Term,
    pub(crate) members: Vec<CpMember>,
    pub(crate) data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {
    pub(crate) term: Term,
    pub(crate) success: bool,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum InstallSnapshotError {
    #[error("We (server) failed to restore the snapshot: {0:?}")]
    ServerIoError(io::Error),
    #[error("Raft node was terminated")]
    Terminated,
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for InstallSnapshotError {
    fn from(_: ActorExited) -> Self {
        InstallSnapshotError::ActorExited
    }
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: Uuid,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted { peer_term: Term },
    RetryableFailure,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: PeerRequestDescriptor,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
    pub(crate) result: Result<(), PeerReplyError>,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) descriptor: PeerRequestDescriptor,
    pub(crate) snapshot_index: Index,
    pub(crate) result: Result<(), PeerReplyError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct PeerRequestDescriptor {
    pub(crate) peer_id: Uuid,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
}

#[derive(Debug)]
pub(crate) enum PeerReplyError {
    PeerMissingPreviousLogEntry { peer_last_index: Option<Index> },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

/// HeartbeatTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HeartbeatTick {
    pub(crate) peer_id: Uuid,
    pub(crate) term: Term,
}
