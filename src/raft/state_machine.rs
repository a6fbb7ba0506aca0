use crate::commitlog::Index;
use bytes::Bytes;

/// Facts about a committed entry that a state machine may rely on. `timestamp_millis` is the
/// leader's wall clock when the entry was appended; it is the same on every replica.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ApplyContext {
    pub(crate) index: Index,
    pub(crate) timestamp_millis: u64,
}

#[derive(Debug)]
pub(crate) enum Applied {
    /// Response for the caller of the entry being applied.
    Response(Bytes),
    /// The command is queued inside the state machine. A later entry completes it.
    Parked,
}

#[derive(Debug)]
pub(crate) struct ApplyOutcome {
    pub(crate) applied: Applied,
    /// Previously parked commands that this entry completed, keyed by the log index they are
    /// parked under.
    pub(crate) completed: Vec<(Index, Bytes)>,
}

impl ApplyOutcome {
    pub(crate) fn response(response: Bytes) -> Self {
        ApplyOutcome {
            applied: Applied::Response(response),
            completed: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("State machine snapshot failure: {0}")]
pub(crate) struct SnapshotError(pub(crate) String);

/// StateMachine is driven exclusively by a RaftNode, one committed entry at a time, in log
/// order. Implementations must be deterministic: no clocks, randomness or local state.
pub(crate) trait StateMachine: Send {
    fn apply(&mut self, context: &ApplyContext, command: &[u8]) -> ApplyOutcome;

    fn take_snapshot(&self) -> Result<Vec<u8>, SnapshotError>;

    fn restore_snapshot(&mut self, snapshot: &[u8]) -> Result<(), SnapshotError>;
}
