use crate::commitlog::Index;
use crate::raft::election::timers::HeartbeatTimerHandle;
use std::collections::HashMap;
use uuid::Uuid;

/// LeaderStateTracker holds the leader's replication progress for every peer of the group.
pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<Uuid, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<Uuid, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &Uuid) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn contains_peer(&self, peer_id: &Uuid) -> bool {
        self.peer_state.contains_key(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> Vec<Uuid> {
        self.peer_state.keys().cloned().collect()
    }

    pub(super) fn insert_peer(&mut self, peer_id: Uuid, state: PeerState) {
        self.peer_state.insert(peer_id, state);
    }

    /// Stops tracking (and heartbeating) a peer that left the group.
    pub(crate) fn remove_peer(&mut self, peer_id: &Uuid) {
        self.peer_state.remove(peer_id);
    }
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    heartbeat_timer: HeartbeatTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    // Logical clock of this leader's requests to the peer. Each request takes the next seq-no and
    // its reply is only accepted if newer than every reply seen so far. At most one request is
    // outstanding at a time.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,
}

impl PeerState {
    pub(super) fn new(heartbeat_timer: HeartbeatTimerHandle, latest_log_index: Option<Index>) -> Self {
        PeerState {
            heartbeat_timer,
            next: latest_log_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    /// Applies a reply. Returns false if the reply was stale and dropped.
    pub(crate) fn handle_reply(&mut self, logger: &slog::Logger, received_seq_no: u64, update: PeerStateUpdate) -> bool {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(logger, "Dropping out of date seq-no({:?}): {:?}", received_seq_no, update);
            return false;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => self.update_log(logger, previous_log_entry, num_entries_replicated),
            PeerStateUpdate::PeerLogBehind { peer_last_index } => self.rewind_log(logger, peer_last_index),
            PeerStateUpdate::SnapshotInstalled { snapshot_index } => self.match_through(snapshot_index),
        }

        true
    }

    fn update_log(&mut self, logger: &slog::Logger, previous_log_entry: Option<Index>, num_entries_replicated: usize) {
        let new_matched = match (previous_log_entry, num_entries_replicated) {
            // A heartbeat still proves the peer holds our previous entry.
            (None, 0) => return,
            (Some(prev), 0) => prev,
            (None, n) => Index::new_usize(n),
            (Some(prev), n) => prev.plus(n as u64),
        };

        if matches!(self.matched, Some(matched) if new_matched < matched) {
            slog::warn!(
                logger,
                "Ignoring success that would move matched backwards. Matched={:?}, Reported={:?}",
                self.matched,
                new_matched
            );
            return;
        }

        self.match_through(new_matched);
    }

    fn match_through(&mut self, index: Index) {
        self.matched.replace(index);
        if self.next <= index {
            self.next = index.plus(1);
        }
    }

    fn rewind_log(&mut self, logger: &slog::Logger, peer_last_index: Option<Index>) {
        // Jump straight past the peer's last entry when it is shorter than our guess, otherwise
        // step back one entry at a time.
        let stepped_back = self.next.checked_minus(1).unwrap_or_else(Index::start_index);
        let hinted = peer_last_index.map(|i| i.plus(1)).unwrap_or_else(Index::start_index);
        let mut new_next = std::cmp::min(stepped_back, hinted);

        // Don't go below what the peer is known to hold; peer could return garbage data.
        if let Some(matched) = self.matched {
            if new_next <= matched {
                slog::warn!(
                    logger,
                    "Peer claims to be missing entries it already matched. Matched={:?}",
                    matched
                );
                new_next = matched.plus(1);
            }
        }

        self.next = new_next;
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer.reset_heartbeat_timer();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    PeerLogBehind {
        peer_last_index: Option<Index>,
    },
    SnapshotInstalled {
        snapshot_index: Index,
    },
    OtherError,
}
