mod election;
mod local_state;
mod node;
mod node_api;
mod peers;
mod state_machine;
mod wiring;
mod write_ahead_log;

pub use election::ElectionStateChangeListener;
pub use election::ElectionStateSnapshot;
pub(crate) use local_state::Term;
pub(crate) use local_state::VolatileLocalState;
pub(crate) use node::RaftNode;
pub(crate) use node::RaftNodeConfig;
pub(crate) use node::RaftNodeOptions;
pub(crate) use node_api::AppendEntriesError;
pub(crate) use node_api::AppendEntriesInput;
pub(crate) use node_api::AppendEntriesOutput;
pub(crate) use node_api::AppendEntriesReplyFromPeer;
pub(crate) use node_api::ChangeMembershipInput;
pub(crate) use node_api::HeartbeatTick;
pub(crate) use node_api::InstallSnapshotError;
pub(crate) use node_api::InstallSnapshotInput;
pub(crate) use node_api::InstallSnapshotOutput;
pub(crate) use node_api::InstallSnapshotReplyFromPeer;
pub(crate) use node_api::RequestVoteError;
pub(crate) use node_api::RequestVoteInput;
pub(crate) use node_api::RequestVoteOutput;
pub(crate) use node_api::RequestVoteReplyFromPeer;
pub(crate) use node_api::SubmitError;
pub(crate) use node_api::SubmitInput;
pub(crate) use node_api::SubmitOutput;
pub(crate) use state_machine::Applied;
pub(crate) use state_machine::ApplyContext;
pub(crate) use state_machine::ApplyOutcome;
pub(crate) use state_machine::SnapshotError;
pub(crate) use state_machine::StateMachine;
pub(crate) use wiring::spawn_raft_node;
pub(crate) use wiring::RaftNodeHandle;
pub(crate) use write_ahead_log::EntryType;
pub(crate) use write_ahead_log::WriteAheadLogEntry;
