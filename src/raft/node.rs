use crate::actor::{Callback, WeakActorClient};
use crate::api::{CpGroupId, CpMember};
use crate::commitlog::{Index, Log};
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResp, ProtoInstallSnapshotReq, ProtoInstallSnapshotResp, ProtoLogEntry,
    ProtoRequestVoteReq,
};
use crate::raft::election::{
    CurrentLeader, ElectionConfig, ElectionState, ElectionStateChangeListener, ElectionStateSnapshot, PeerStateUpdate,
};
use crate::raft::local_state::{PersistentLocalState, Term};
use crate::raft::node_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer, ChangeMembershipInput,
    HeartbeatTick, InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput, InstallSnapshotReplyFromPeer,
    PeerReplyError, PeerRequestDescriptor, RequestVoteError, RequestVoteInput, RequestVoteOutput,
    RequestVoteReplyFromPeer, RequestVoteResult, SubmitError, SubmitInput, SubmitOutput,
};
use crate::raft::peers::ClusterTracker;
use crate::raft::state_machine::{Applied, StateMachine};
use crate::raft::write_ahead_log::{AppliedEntry, EntryType, SnapshotMeta, WriteAheadLog, WriteAheadLogEntry};
use crate::transport::{self, RaftTransport};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::{cmp, io};
use tokio::time::Duration;
use tonic::Status;
use uuid::Uuid;

/// Tunables of a single RaftNode.
#[derive(Clone, Debug)]
pub(crate) struct RaftNodeOptions {
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) append_entries_timeout: Duration,
    pub(crate) max_append_entries: usize,
    pub(crate) commit_index_advance_count_to_snapshot: u64,
}

pub(crate) struct RaftNodeConfig<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) logger: slog::Logger,
    pub(crate) group_id: CpGroupId,
    pub(crate) me: CpMember,
    pub(crate) initial_members: Vec<CpMember>,
    pub(crate) log: L,
    pub(crate) local_state: Box<dyn PersistentLocalState>,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) options: RaftNodeOptions,
}

/// RaftNode replicates one CP group's log on the local member. It has no idea what the entries
/// mean; committed entries go to the state machine owned by the write-ahead log.
pub(crate) struct RaftNode<L>
where
    L: Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    group_id: CpGroupId,
    cluster_tracker: ClusterTracker,
    local_state: Box<dyn PersistentLocalState>,
    election_state: ElectionState,
    wal: WriteAheadLog<L>,
    actor_client: WeakActorClient,
    transport: Arc<dyn RaftTransport>,
    options: RaftNodeOptions,

    // Leader only. Callers waiting for their entry to be applied, keyed by log index.
    pending: BTreeMap<Index, Callback<SubmitOutput, SubmitError>>,
    // Leader only. The NOOP appended on election; nothing else may change membership before it
    // commits.
    leader_noop_index: Option<Index>,
    // Leader only. Uncommitted MEMBERSHIP_CHANGE entry, at most one at a time.
    membership_change_index: Option<Index>,
    terminated: bool,
}

impl<L> RaftNode<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    pub(crate) fn new(config: RaftNodeConfig<L>) -> (Self, ElectionStateChangeListener) {
        let logger = config.logger;
        let (election_state, listener) = ElectionState::new_follower(
            ElectionConfig {
                my_id: config.me.uuid(),
                leader_heartbeat_duration: config.options.leader_heartbeat_duration,
                follower_min_timeout: config.options.follower_min_timeout,
                follower_max_timeout: config.options.follower_max_timeout,
            },
            config.actor_client.clone(),
        );
        let wal = WriteAheadLog::new(
            logger.clone(),
            config.log,
            config.state_machine,
            config.initial_members.clone(),
        );

        let node = RaftNode {
            logger,
            group_id: config.group_id,
            cluster_tracker: ClusterTracker::new(config.me, config.initial_members),
            local_state: config.local_state,
            election_state,
            wal,
            actor_client: config.actor_client,
            transport: config.transport,
            options: config.options,
            pending: BTreeMap::new(),
            leader_noop_index: None,
            membership_change_index: None,
            terminated: false,
        };

        (node, listener)
    }

    pub(crate) fn handle_submit(&mut self, input: SubmitInput, callback: Callback<SubmitOutput, SubmitError>) {
        if let Err(e) = self.check_leader() {
            callback.send(Err(e));
            return;
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let entry = WriteAheadLogEntry {
            term: self.local_state.current_term(),
            entry_type: EntryType::Normal,
            timestamp_millis: now_millis(),
            data: input.data.to_vec(),
        };
        match self.wal.append(entry) {
            Ok(index) => {
                self.pending.insert(index, callback);
                self.replicate_to_all_peers();
                self.advance_commit_index();
            }
            Err(e) => callback.send(Err(SubmitError::LocalIoError(e))),
        }
    }

    pub(crate) fn handle_change_membership(
        &mut self,
        input: ChangeMembershipInput,
        callback: Callback<SubmitOutput, SubmitError>,
    ) {
        if let Err(e) = self.check_leader() {
            callback.send(Err(e));
            return;
        }

        // Single-server changes only, one in flight, and never before this term's NOOP commits.
        let noop_committed = matches!(
            (self.leader_noop_index, self.wal.commit_index()),
            (Some(noop), Some(ci)) if noop <= ci
        );
        if self.membership_change_index.is_some() || !noop_committed {
            callback.send(Err(SubmitError::MembershipChangeInProgress));
            return;
        }

        if input.members.as_slice() == self.cluster_tracker.members() {
            callback.send(Ok(SubmitOutput { response: Bytes::new() }));
            return;
        }

        let entry = match WriteAheadLogEntry::membership_change(
            self.local_state.current_term(),
            now_millis(),
            &input.members,
        ) {
            Ok(entry) => entry,
            Err(e) => {
                let ioe = io::Error::new(io::ErrorKind::InvalidInput, e);
                callback.send(Err(SubmitError::LocalIoError(ioe)));
                return;
            }
        };

        match self.wal.append(entry) {
            Ok(index) => {
                slog::info!(
                    self.logger,
                    "Appended membership change at {:?}: {:?}",
                    index,
                    input.members.iter().map(|m| m.uuid()).collect::<Vec<_>>()
                );
                self.pending.insert(index, callback);
                self.membership_change_index = Some(index);
                self.refresh_members();
                self.replicate_to_all_peers();
                self.advance_commit_index();
            }
            Err(e) => callback.send(Err(SubmitError::LocalIoError(e))),
        }
    }

    fn check_leader(&self) -> Result<(), SubmitError> {
        match self.election_state.current_leader() {
            CurrentLeader::Me => Ok(()),
            CurrentLeader::Other(leader) => Err(SubmitError::NotLeader { leader: Some(leader) }),
            CurrentLeader::Unknown => Err(SubmitError::NotLeader { leader: None }),
        }
    }

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        // Ensure candidate is known member. Removed members must not disrupt the group.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            slog::info!(self.logger, "Not granting vote. {:?} is not a member.", input.candidate_id);
            return Ok(self.vote_output(false));
        }

        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Ok(self.vote_output(false));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if self.local_state.store_term_if_increased(input.candidate_term) {
            self.transition_to_follower(None);
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Transitioning to follower. Election state: {:?}",
                self.election_state
            );
            // If we've increased the term, it means we haven't voted for anyone this term.
            opt_voted_for = None;
        }

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).

        // If votedFor is null or candidateId, and...
        if let Some(voted_for) = opt_voted_for {
            if voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(self.vote_output(false));
            }
            // Candidate retried; award the same vote again.
            return Ok(self.vote_output(true));
        }

        // ...and candidate’s log is at least as up-to-date as receiver’s log...
        if !is_candidate_log_gte_mine(self.wal.latest_entry(), input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(self.vote_output(false));
        }

        // ...grant vote
        let granted = self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id);
        if granted {
            slog::info!(self.logger, "Voting for {:?}.", input.candidate_id);
            // Granting a vote counts as hearing from a would-be leader.
            self.election_state.reset_timeout_if_follower();
        }

        Ok(self.vote_output(granted))
    }

    fn vote_output(&self, vote_granted: bool) -> RequestVoteOutput {
        RequestVoteOutput {
            term: self.local_state.current_term(),
            vote_granted,
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v,
                    None => {
                        slog::debug!(
                            self.logger,
                            "Received vote for term {:?} after transitioning to a election state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                let num_voting_replicas = self.cluster_tracker.num_voting_replicas();
                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    num_voting_replicas,
                    reply.term,
                );

                if num_votes_received >= get_majority_vote_count(num_voting_replicas) {
                    self.transition_to_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted { peer_term } => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {:?} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
                if self.local_state.store_term_if_increased(peer_term) {
                    self.transition_to_follower(None);
                }
            }
            RequestVoteResult::RetryableFailure => {
                if !matches!(self.election_state.current_leader(), CurrentLeader::Unknown) {
                    return;
                }
                match self.cluster_tracker.member(&reply.peer_id) {
                    Some(peer) => {
                        tokio::task::spawn(Self::call_peer_request_vote(
                            self.logger.clone(),
                            self.transport.clone(),
                            peer.clone(),
                            self.new_request_vote_request(reply.term),
                            self.actor_client.clone(),
                            reply.term,
                            // Don't hammer a peer that is down.
                            self.options.leader_heartbeat_duration,
                        ));
                    }
                    None => slog::warn!(
                        self.logger,
                        "Peer {:?} not found while retrying RequestVote",
                        reply.peer_id
                    ),
                }
            }
        }
    }

    fn transition_to_leader(&mut self, term: Term) {
        self.election_state.transition_to_leader(
            term,
            self.cluster_tracker.peer_ids(),
            self.wal.latest_entry().map(|(_, index)| index),
        );
        slog::info!(self.logger, "Became leader for term {:?}", term);

        self.membership_change_index = self.find_uncommitted_membership_change();

        // > Raft handles this by having each leader commit a blank no-op entry into the log at
        // > the start of its term.
        match self.wal.append(WriteAheadLogEntry::noop(term, now_millis())) {
            Ok(index) => self.leader_noop_index = Some(index),
            Err(e) => {
                slog::error!(self.logger, "Failed to append NOOP as new leader: {:?}", e);
                self.transition_to_follower(None);
                return;
            }
        }

        self.replicate_to_all_peers();
        self.advance_commit_index();
    }

    fn find_uncommitted_membership_change(&self) -> Option<Index> {
        let latest = self.wal.latest_entry().map(|(_, index)| index)?;
        let mut cursor = self
            .wal
            .commit_index()
            .map(|ci| ci.plus(1))
            .unwrap_or_else(Index::start_index);
        let mut found = None;
        while cursor <= latest {
            if let Ok(Some(entry)) = self.wal.read(cursor) {
                if entry.entry_type == EntryType::MembershipChange {
                    found = Some(cursor);
                }
            }
            cursor = cursor.plus(1);
        }

        found
    }

    /// Single place a node becomes follower. A deposed leader fails everything it parked.
    fn transition_to_follower(&mut self, leader: Option<CpMember>) {
        if self.election_state.is_leader() {
            slog::info!(self.logger, "Stepping down as leader. New leader: {:?}", leader);
            let pending = std::mem::take(&mut self.pending);
            for (_, callback) in pending {
                callback.send(Err(SubmitError::LeaderChanged { leader: leader.clone() }));
            }
            self.leader_noop_index = None;
            self.membership_change_index = None;
        }

        self.election_state.transition_to_follower(leader);
    }

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Ok(self.append_entries_output(false, self.latest_index()));
        }

        self.observe_leader(input.leader_term, input.leader_id);

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_entry_term, leader_prev_entry_index)) = input.leader_previous_log_entry {
            let matches = self
                .has_matching_entry(leader_prev_entry_index, leader_prev_entry_term)
                .map_err(AppendEntriesError::ServerIoError)?;
            if !matches {
                return Ok(self.append_entries_output(false, self.latest_index()));
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let num_new_entries = input.new_entries.len() as u64;
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_entry_index)) => leader_prev_entry_index.plus(1),
        };
        let mut membership_touched = false;
        for new_entry in input.new_entries.into_iter() {
            let existing_term = self
                .existing_term(next_entry_index, new_entry.term)
                .map_err(AppendEntriesError::ServerIoError)?;

            match existing_term {
                // 4. (no-op)
                Some(term) if term == new_entry.term => {
                    next_entry_index = next_entry_index.plus(1);
                    continue;
                }
                // 3. (delete)
                Some(_) => {
                    if let Some(ci) = self.wal.commit_index() {
                        assert!(
                            next_entry_index > ci,
                            "Leader {:?} conflicts with committed entry {:?}",
                            input.leader_id,
                            next_entry_index
                        );
                    }
                    self.wal
                        .truncate(next_entry_index)
                        .map_err(AppendEntriesError::ServerIoError)?;
                    membership_touched = true;
                }
                None => {}
            }

            // 4. (append)
            if new_entry.entry_type == EntryType::MembershipChange {
                membership_touched = true;
            }
            let appended_index = self
                .wal
                .append(new_entry)
                .map_err(AppendEntriesError::ServerIoError)?;
            assert_eq!(
                appended_index, next_entry_index,
                "Appended log entry to unexpected index."
            );

            next_entry_index = next_entry_index.plus(1);
        }

        if membership_touched {
            self.refresh_members();
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        let index_of_last_new_entry = match input.leader_previous_log_entry {
            Some((_, prev)) => Some(prev.plus(num_new_entries)),
            None => Index::from_wire(num_new_entries),
        };
        if let (Some(leader_commit), Some(last_new)) = (input.leader_commit_index, index_of_last_new_entry) {
            self.wal.ratchet_fwd_commit_index(cmp::min(leader_commit, last_new));
        }

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.apply_committed_entries();

        Ok(self.append_entries_output(true, index_of_last_new_entry))
    }

    fn append_entries_output(&self, success: bool, match_index: Option<Index>) -> AppendEntriesOutput {
        AppendEntriesOutput {
            term: self.local_state.current_term(),
            success,
            match_index,
        }
    }

    /// Adopts the sender of a current-term AppendEntries/InstallSnapshot as leader.
    fn observe_leader(&mut self, leader_term: Term, leader_id: Uuid) {
        let leader = self.cluster_tracker.member(&leader_id).cloned();

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if self.local_state.store_term_if_increased(leader_term) {
            self.transition_to_follower(leader);
        } else {
            match self.election_state.current_leader() {
                // > If AppendEntries RPC received from new leader: convert to follower
                CurrentLeader::Unknown if !self.is_follower() => self.transition_to_follower(leader),
                CurrentLeader::Unknown => {
                    if let Some(leader) = &leader {
                        self.election_state.set_leader_if_unknown(leader);
                    }
                }
                CurrentLeader::Me => {
                    slog::error!(self.logger, "Two leaders in term {:?}: me and {:?}", leader_term, leader_id);
                }
                CurrentLeader::Other(_) => {}
            }
        }

        self.election_state.reset_timeout_if_follower();
    }

    fn is_follower(&self) -> bool {
        matches!(
            self.election_state.current_state(),
            ElectionStateSnapshot::Follower(_) | ElectionStateSnapshot::FollowerNoLeader
        )
    }

    fn has_matching_entry(&self, index: Index, term: Term) -> Result<bool, io::Error> {
        // Everything a snapshot covers is committed, so it matches any leader's log.
        if matches!(self.wal.snapshot(), Some(s) if index < s.index) {
            return Ok(true);
        }

        Ok(self.wal.term_at(index)? == Some(term))
    }

    /// Term of our entry at `index`. Compacted entries are committed, so they always agree with
    /// the leader.
    fn existing_term(&self, index: Index, leader_entry_term: Term) -> Result<Option<Term>, io::Error> {
        if matches!(self.wal.snapshot(), Some(s) if index <= s.index) {
            return Ok(Some(leader_entry_term));
        }

        Ok(self.wal.read(index)?.map(|entry| entry.term))
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let logger = self.peer_logger(&reply.descriptor);
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        let update = match self.check_peer_reply(&logger, &reply.descriptor, reply.result) {
            Some(Ok(())) => PeerStateUpdate::Success {
                previous_log_entry: reply.previous_log_entry_index,
                num_entries_replicated: reply.num_log_entries,
            },
            Some(Err(PeerReplyError::PeerMissingPreviousLogEntry { peer_last_index })) => {
                slog::info!(logger, "Peer is missing previous log entry");
                PeerStateUpdate::PeerLogBehind { peer_last_index }
            }
            Some(Err(_)) => PeerStateUpdate::OtherError,
            None => return,
        };

        self.handle_peer_state_update(&logger, reply.descriptor, update);
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self.peer_logger(&reply.descriptor);
        slog::debug!(logger, "InstallSnapshot reply from peer result: {:?}", reply.result);

        let update = match self.check_peer_reply(&logger, &reply.descriptor, reply.result) {
            Some(Ok(())) => PeerStateUpdate::SnapshotInstalled {
                snapshot_index: reply.snapshot_index,
            },
            Some(Err(_)) => PeerStateUpdate::OtherError,
            None => return,
        };

        self.handle_peer_state_update(&logger, reply.descriptor, update);
    }

    fn peer_logger(&self, descriptor: &PeerRequestDescriptor) -> slog::Logger {
        self.logger.new(slog::o!(
            "Peer" => format!("{:?}", descriptor.peer_id),
            "SeqNo" => descriptor.seq_no,
        ))
    }

    /// Returns None if the reply must be ignored. Steps down on a stale term.
    fn check_peer_reply(
        &mut self,
        logger: &slog::Logger,
        descriptor: &PeerRequestDescriptor,
        result: Result<(), PeerReplyError>,
    ) -> Option<Result<(), PeerReplyError>> {
        if self.local_state.current_term() != descriptor.term {
            slog::info!(
                logger,
                "Received reply for outdated term {:?}, but we're on term {:?}",
                descriptor.term,
                self.local_state.current_term()
            );
            return None;
        }

        match result {
            Err(PeerReplyError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                if self.local_state.store_term_if_increased(new_term) {
                    self.transition_to_follower(None);
                    slog::info!(logger, "Transitioned to follower.");
                    return None;
                }
                slog::warn!(logger, "Treating non-incrementing StaleTerm err as generic failure.");
                Some(Err(PeerReplyError::RetryableFailure("stale term".into())))
            }
            Err(PeerReplyError::RetryableFailure(msg)) => {
                slog::warn!(logger, "Peer call failed: {}", msg);
                Some(Err(PeerReplyError::RetryableFailure(msg)))
            }
            other => Some(other),
        }
    }

    fn handle_peer_state_update(
        &mut self,
        logger: &slog::Logger,
        descriptor: PeerRequestDescriptor,
        update: PeerStateUpdate,
    ) {
        let latest_index = self.latest_index();
        let leader_state = match self.election_state.leader_state_mut() {
            Some(ls) => ls,
            None => {
                slog::info!(logger, "No longer leader");
                return;
            }
        };

        // 1. Update peer log tracker
        let peer_state = match leader_state.peer_state_mut(&descriptor.peer_id) {
            Some(ps) => ps,
            None => {
                slog::info!(logger, "Peer {:?} is no longer part of the group", descriptor.peer_id);
                return;
            }
        };
        // A failed call waits for the peer's next heartbeat instead of being resent right away.
        let follow_up = !matches!(update, PeerStateUpdate::OtherError);
        let accepted = peer_state.handle_reply(logger, descriptor.seq_no, update);
        let (next_index, _) = peer_state.next_and_previous_log_index();
        if !accepted {
            return;
        }

        // 2. Check for majority replication and apply new commits.
        self.advance_commit_index();

        // 3. Keep going while the peer is behind.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        if follow_up && matches!(latest_index, Some(latest) if latest >= next_index) {
            self.replicate_to_peer(descriptor.peer_id);
        }
    }

    fn advance_commit_index(&mut self) {
        let current_term = self.local_state.current_term();
        let latest_index = self.latest_index();
        let my_id = self.cluster_tracker.my_id();

        let voters_matched: Vec<Option<Index>> = match self.election_state.leader_state_mut() {
            None => return,
            Some(leader_state) => self
                .cluster_tracker
                .members()
                .iter()
                .map(|member| {
                    if member.uuid() == my_id {
                        latest_index
                    } else {
                        leader_state
                            .peer_state_mut(&member.uuid())
                            .and_then(|peer_state| peer_state.matched())
                    }
                })
                .collect(),
        };

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        // See also:
        // > Figure 8: A time sequence showing why a leader cannot determine
        // > commitment using log entries from older terms.
        if let Some(tentative_new_commit_index) = get_cluster_commit_index(voters_matched) {
            match self
                .wal
                .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, current_term)
            {
                Ok(true) => self.apply_committed_entries(),
                Ok(false) => {}
                Err(ioe) => slog::warn!(
                    self.logger,
                    "IO failure while confirming new commit index {:?}: {:?}",
                    tentative_new_commit_index,
                    ioe
                ),
            }
        }
    }

    fn apply_committed_entries(&mut self) {
        let applied = self.wal.apply_all_committed_entries();
        for entry in applied {
            self.handle_applied_entry(entry);
        }

        match self
            .wal
            .take_snapshot_if_due(self.options.commit_index_advance_count_to_snapshot)
        {
            Ok(Some(index)) => slog::debug!(self.logger, "Compacted log through {:?}", index),
            Ok(None) => {}
            Err(e) => slog::error!(self.logger, "Failed to take snapshot: {:?}", e),
        }
    }

    fn handle_applied_entry(&mut self, entry: AppliedEntry) {
        match entry.entry_type {
            EntryType::Normal => {
                if let Some(outcome) = entry.outcome {
                    if let Applied::Response(response) = outcome.applied {
                        self.complete_pending(entry.index, response);
                    }
                    for (parked_index, response) in outcome.completed {
                        self.complete_pending(parked_index, response);
                    }
                }
            }
            EntryType::Noop => {}
            EntryType::MembershipChange => {
                self.complete_pending(entry.index, Bytes::new());
                if self.membership_change_index == Some(entry.index) {
                    self.membership_change_index = None;
                }
                if self.election_state.is_leader() && !self.cluster_tracker.am_i_voting() {
                    slog::info!(self.logger, "Removed from the group. Stepping down.");
                    self.transition_to_follower(None);
                }
            }
        }
    }

    fn complete_pending(&mut self, index: Index, response: Bytes) {
        if let Some(callback) = self.pending.remove(&index) {
            callback.send(Ok(SubmitOutput { response }));
        }
    }

    fn refresh_members(&mut self) {
        let members = match self.wal.effective_members() {
            Ok(members) => members,
            Err(e) => {
                slog::error!(self.logger, "Failed to read group membership from log: {:?}", e);
                return;
            }
        };

        if !self.cluster_tracker.set_members(members) {
            return;
        }
        slog::info!(
            self.logger,
            "Group members are now {:?}",
            self.cluster_tracker.members().iter().map(|m| m.uuid()).collect::<Vec<_>>()
        );

        let term = self.local_state.current_term();
        let latest_index = self.latest_index();
        let peer_ids = self.cluster_tracker.peer_ids();
        for peer_id in peer_ids.iter() {
            self.election_state.add_peer_if_leader(*peer_id, term, latest_index);
        }
        if let Some(leader_state) = self.election_state.leader_state_mut() {
            for tracked in leader_state.peer_ids() {
                if !peer_ids.contains(&tracked) {
                    leader_state.remove_peer(&tracked);
                }
            }
        }
    }

    pub(crate) fn handle_heartbeat_due(&mut self, tick: HeartbeatTick) {
        let current_term = self.local_state.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }

        self.replicate_to_peer(tick.peer_id);
    }

    fn replicate_to_all_peers(&mut self) {
        let peer_ids = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state.peer_ids(),
            None => return,
        };
        for peer_id in peer_ids {
            self.replicate_to_peer(peer_id);
        }
    }

    fn replicate_to_peer(&mut self, peer_id: Uuid) {
        let peer = match self.cluster_tracker.member(&peer_id) {
            Some(peer) => peer.clone(),
            None => {
                slog::debug!(self.logger, "Peer {:?} left the group", peer_id);
                return;
            }
        };

        let current_term = self.local_state.current_term();
        let my_id = self.cluster_tracker.my_id();
        let group_id = self.group_id.clone();
        let max_append_entries = self.options.max_append_entries;

        let wal = &self.wal;
        let leader_state = match self.election_state.leader_state_mut() {
            Some(ls) => ls,
            None => return,
        };
        if !leader_state.contains_peer(&peer_id) {
            slog::error!(
                self.logger,
                "Peer {:?} is in the group but missing in LeaderStateTracker. Tracked: {:?}",
                peer_id,
                leader_state.peer_ids(),
            );
            return;
        }
        let peer_state = match leader_state.peer_state_mut(&peer_id) {
            Some(ps) => ps,
            None => return,
        };

        // Simplicity vs throughput tradeoff. We're just going to allow 1 outstanding request per
        // peer; no pipelining. Entries are still batched.
        if peer_state.has_outstanding_request() {
            return;
        }

        let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();
        let request = if next_index < wal.first_index() {
            match wal.snapshot() {
                Some(snapshot) => OutboundRequest::InstallSnapshot(build_install_snapshot_request(
                    &group_id,
                    current_term,
                    my_id,
                    snapshot,
                )),
                None => {
                    slog::error!(self.logger, "Peer needs compacted entries but there is no snapshot");
                    return;
                }
            }
        } else {
            match build_append_entries_request(
                wal,
                &group_id,
                current_term,
                my_id,
                next_index,
                opt_previous_index,
                max_append_entries,
            ) {
                Ok(request) => OutboundRequest::AppendEntries(request),
                Err(e) => {
                    slog::error!(self.logger, "Failed to read log for peer {:?}: {:?}", peer_id, e);
                    return;
                }
            }
        };

        let descriptor = PeerRequestDescriptor {
            peer_id,
            term: current_term,
            seq_no: peer_state.next_seq_no(),
        };
        peer_state.reset_heartbeat_timer();

        let logger = self.logger.new(slog::o!("Peer" => format!("{:?}", peer_id)));
        let timeout = self.options.append_entries_timeout;
        match request {
            OutboundRequest::AppendEntries(request) => {
                tokio::task::spawn(Self::call_peer_append_entries(
                    logger,
                    self.transport.clone(),
                    peer,
                    request,
                    timeout,
                    self.actor_client.clone(),
                    descriptor,
                ));
            }
            OutboundRequest::InstallSnapshot(request) => {
                slog::info!(
                    logger,
                    "Sending snapshot at {:?} to peer",
                    request.last_included_index
                );
                tokio::task::spawn(Self::call_peer_install_snapshot(
                    logger,
                    self.transport.clone(),
                    peer,
                    request,
                    // Snapshots are larger than regular batches.
                    timeout * 4,
                    self.actor_client.clone(),
                    descriptor,
                ));
            }
        }
    }

    async fn call_peer_append_entries(
        logger: slog::Logger,
        transport: Arc<dyn RaftTransport>,
        peer: CpMember,
        rpc_request: ProtoAppendEntriesReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: PeerRequestDescriptor,
    ) {
        let previous_log_entry_index = Index::from_wire(rpc_request.prev_log_index);
        let num_log_entries = rpc_request.entries.len();
        let request_term = rpc_request.term;

        slog::debug!(logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = tokio::time::timeout(rpc_timeout, transport.append_entries(&peer, rpc_request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let result = match rpc_reply {
            Ok(Ok(reply)) => convert_append_entries_reply(request_term, reply),
            Ok(Err(status)) => Err(retryable_status("AppendEntries", status)),
            Err(_timeout) => Err(PeerReplyError::RetryableFailure(
                "Timed out calling AppendEntries".into(),
            )),
        };

        let _ = callback
            .notify_append_entries_reply_from_peer(AppendEntriesReplyFromPeer {
                descriptor,
                previous_log_entry_index,
                num_log_entries,
                result,
            })
            .await;
    }

    async fn call_peer_install_snapshot(
        logger: slog::Logger,
        transport: Arc<dyn RaftTransport>,
        peer: CpMember,
        rpc_request: ProtoInstallSnapshotReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: PeerRequestDescriptor,
    ) {
        let request_term = rpc_request.term;
        let snapshot_index = Index::new(rpc_request.last_included_index);

        slog::debug!(
            logger,
            "ClientWire - InstallSnapshot(index={}, bytes={})",
            rpc_request.last_included_index,
            rpc_request.snapshot_bytes.len()
        );
        let rpc_reply = tokio::time::timeout(rpc_timeout, transport.install_snapshot(&peer, rpc_request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let result = match rpc_reply {
            Ok(Ok(reply)) => convert_install_snapshot_reply(request_term, reply),
            Ok(Err(status)) => Err(retryable_status("InstallSnapshot", status)),
            Err(_timeout) => Err(PeerReplyError::RetryableFailure(
                "Timed out calling InstallSnapshot".into(),
            )),
        };

        let _ = callback
            .notify_install_snapshot_reply_from_peer(InstallSnapshotReplyFromPeer {
                descriptor,
                snapshot_index,
                result,
            })
            .await;
    }

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Ok(InstallSnapshotOutput {
                term: current_term,
                success: false,
            });
        }

        self.observe_leader(input.leader_term, input.leader_id);

        // Already have everything the snapshot holds.
        if matches!(self.wal.commit_index(), Some(ci) if ci >= input.last_included_index) {
            return Ok(InstallSnapshotOutput {
                term: self.local_state.current_term(),
                success: true,
            });
        }

        self.wal
            .install_snapshot(SnapshotMeta {
                index: input.last_included_index,
                term: input.last_included_term,
                members: input.members,
                data: input.data,
            })
            .map_err(InstallSnapshotError::ServerIoError)?;
        self.refresh_members();

        Ok(InstallSnapshotOutput {
            term: self.local_state.current_term(),
            success: true,
        })
    }

    pub(crate) fn handle_election_timeout(&mut self) {
        if self.election_state.is_leader() {
            return;
        }
        if !self.cluster_tracker.am_i_voting() {
            slog::debug!(self.logger, "Not a voting member of the group. Ignoring election timeout.");
            return;
        }

        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = self.local_state.increment_term_and_vote_for_self();
        let num_votes = self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "Timed out as follower. Changed to candidate. Election state: {:?}",
            self.election_state,
        );

        if num_votes >= get_majority_vote_count(self.cluster_tracker.num_voting_replicas()) {
            self.transition_to_leader(new_term);
            return;
        }

        for peer in self.cluster_tracker.iter_peers() {
            tokio::task::spawn(Self::call_peer_request_vote(
                self.logger.clone(),
                self.transport.clone(),
                peer.clone(),
                self.new_request_vote_request(new_term),
                self.actor_client.clone(),
                new_term,
                Duration::from_millis(0),
            ));
        }
    }

    fn new_request_vote_request(&self, term: Term) -> ProtoRequestVoteReq {
        let (last_log_term, last_log_index) = match self.wal.latest_entry() {
            None => (0, 0),
            Some((term, index)) => (term.as_u64(), index.as_u64()),
        };

        ProtoRequestVoteReq {
            group_id: Some(transport::group_id_to_proto(&self.group_id)),
            term: term.as_u64(),
            candidate_id: self.cluster_tracker.my_id().to_string(),
            last_log_index,
            last_log_term,
        }
    }

    async fn call_peer_request_vote(
        logger: slog::Logger,
        transport: Arc<dyn RaftTransport>,
        peer: CpMember,
        rpc_request: ProtoRequestVoteReq,
        callback: WeakActorClient,
        term: Term,
        delay: Duration,
    ) {
        if delay > Duration::from_millis(0) {
            tokio::time::sleep(delay).await;
        }

        slog::debug!(logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = transport.request_vote(&peer, rpc_request).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let result = match rpc_reply {
            Ok(reply) if reply.granted => RequestVoteResult::VoteGranted,
            Ok(reply) => RequestVoteResult::VoteNotGranted {
                peer_term: Term::new(reply.term),
            },
            Err(rpc_status) => {
                slog::debug!(logger, "RequestVote RPC failed: {:?}", rpc_status);
                RequestVoteResult::RetryableFailure
            }
        };

        let _ = callback
            .notify_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
                peer_id: peer.uuid(),
                term,
                result,
            })
            .await;
    }

    /// Fails every parked caller. The actor exits right after.
    pub(crate) fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        slog::info!(self.logger, "Terminating raft node");

        let pending = std::mem::take(&mut self.pending);
        for (_, callback) in pending {
            callback.send(Err(SubmitError::Terminated));
        }
    }

    fn latest_index(&self) -> Option<Index> {
        self.wal.latest_entry().map(|(_, index)| index)
    }
}

enum OutboundRequest {
    AppendEntries(ProtoAppendEntriesReq),
    InstallSnapshot(ProtoInstallSnapshotReq),
}

fn build_append_entries_request<L>(
    wal: &WriteAheadLog<L>,
    group_id: &CpGroupId,
    current_term: Term,
    my_id: Uuid,
    next_index: Index,
    opt_previous_index: Option<Index>,
    max_append_entries: usize,
) -> Result<ProtoAppendEntriesReq, io::Error>
where
    L: Log<WriteAheadLogEntry>,
{
    let (prev_log_term, prev_log_index) = match opt_previous_index {
        None => (0, 0),
        Some(previous_index) => match wal.term_at(previous_index)? {
            Some(term) => (term.as_u64(), previous_index.as_u64()),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Missing previous entry {:?}", previous_index),
                ))
            }
        },
    };

    let entries = wal
        .read_batch(next_index, max_append_entries)?
        .into_iter()
        .enumerate()
        .map(|(offset, entry)| ProtoLogEntry {
            term: entry.term.as_u64(),
            index: next_index.as_u64() + offset as u64,
            entry_type: entry.entry_type.to_wire(),
            timestamp_millis: entry.timestamp_millis,
            data: entry.data,
        })
        .collect();

    Ok(ProtoAppendEntriesReq {
        group_id: Some(transport::group_id_to_proto(group_id)),
        term: current_term.as_u64(),
        leader_id: my_id.to_string(),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit_index: wal.commit_index().map(|ci| ci.as_u64()).unwrap_or(0),
    })
}

fn build_install_snapshot_request(
    group_id: &CpGroupId,
    current_term: Term,
    my_id: Uuid,
    snapshot: &SnapshotMeta,
) -> ProtoInstallSnapshotReq {
    ProtoInstallSnapshotReq {
        group_id: Some(transport::group_id_to_proto(group_id)),
        term: current_term.as_u64(),
        leader_id: my_id.to_string(),
        last_included_index: snapshot.index.as_u64(),
        last_included_term: snapshot.term.as_u64(),
        members: snapshot.members.iter().map(transport::member_to_proto).collect(),
        snapshot_bytes: snapshot.data.clone(),
    }
}

fn convert_append_entries_reply(request_term: u64, reply: ProtoAppendEntriesResp) -> Result<(), PeerReplyError> {
    if reply.term > request_term {
        return Err(PeerReplyError::StaleTerm {
            new_term: Term::new(reply.term),
        });
    }
    if reply.success {
        Ok(())
    } else {
        Err(PeerReplyError::PeerMissingPreviousLogEntry {
            peer_last_index: Index::from_wire(reply.match_index),
        })
    }
}

fn convert_install_snapshot_reply(request_term: u64, reply: ProtoInstallSnapshotResp) -> Result<(), PeerReplyError> {
    if reply.term > request_term {
        return Err(PeerReplyError::StaleTerm {
            new_term: Term::new(reply.term),
        });
    }
    if reply.success {
        Ok(())
    } else {
        Err(PeerReplyError::RetryableFailure("Peer rejected snapshot".into()))
    }
}

fn retryable_status(rpc: &str, status: Status) -> PeerReplyError {
    PeerReplyError::RetryableFailure(format!("Un-modeled failure from {} RPC call: {:?}", rpc, status))
}

fn now_millis() -> u64 {
    let millis = chrono::Utc::now().timestamp_millis();
    if millis < 0 {
        0
    } else {
        millis as u64
    }
}

fn get_majority_vote_count(num_voting_replicas: usize) -> usize {
    (num_voting_replicas / 2) + 1
}

/// Highest index held by a majority of the voting members. Each voter contributes its matched
/// index; the leader contributes its own latest index when it is a voter.
fn get_cluster_commit_index(mut voters_matched_indexes: Vec<Option<Index>>) -> Option<Index> {
    if voters_matched_indexes.is_empty() {
        return None;
    }

    voters_matched_indexes.sort_by_key(|matched| match matched {
        None => 0u64,
        Some(m) => m.as_u64(),
    });

    // Everything at or right of the quorum position is held by a majority.
    let majority = get_majority_vote_count(voters_matched_indexes.len());
    let quorum_idx = voters_matched_indexes.len() - majority;

    voters_matched_indexes.remove(quorum_idx)
}

fn is_candidate_log_gte_mine(
    my_last_entry: Option<(Term, Index)>,
    candidate_last_entry: Option<(Term, Index)>,
) -> bool {
    // > Raft determines which of two logs is more up-to-date
    // > by comparing the index and term of the last entries in the
    // > logs. If the logs have last entries with different terms, then
    // > the log with the later term is more up-to-date. If the logs
    // > end with the same term, then whichever log is longer is
    // > more up-to-date.
    match (my_last_entry, candidate_last_entry) {
        (None, None) => true,
        (Some(_), None) => false,
        (None, Some(_)) => true,
        (
            Some((my_last_entry_term, my_last_entry_index)),
            Some((candidate_last_entry_term, candidate_last_entry_index)),
        ) => {
            if candidate_last_entry_term > my_last_entry_term {
                return true;
            } else if candidate_last_entry_term < my_last_entry_term {
                return false;
            }

            candidate_last_entry_index >= my_last_entry_index
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt_index(v: u64) -> Option<Index> {
        Index::from_wire(v)
    }

    #[test]
    fn test_commit_checker_logic() {
        fn run(expected: u64, matches: Vec<u64>) {
            let matches = matches.into_iter().map(opt_index).collect();
            assert_eq!(opt_index(expected), get_cluster_commit_index(matches));
        }

        // 1-member group (leader alone)
        run(5, vec![5]);

        // 3-member group. Last value is the leader.
        run(0, vec![0, 0, 0]);
        run(9, vec![0, 9, 9]);
        run(9, vec![8, 9, 9]);

        // 4-member group
        run(0, vec![0, 0, 0, 9]);
        run(0, vec![0, 0, 9, 9]);
        run(8, vec![0, 8, 9, 9]);
        run(8, vec![7, 8, 9, 9]);

        // 5-member group
        run(0, vec![0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 9, 9]);
        run(8, vec![0, 0, 8, 9, 9]);
        run(8, vec![0, 7, 8, 9, 9]);
        run(8, vec![6, 7, 8, 9, 9]);

        // Ordering doesn't matter
        run(9, vec![9, 0, 9]);
        run(8, vec![9, 8, 0, 9, 0]);

        // A leader that is leaving the group doesn't count itself.
        run(4, vec![4, 4, 0]);
        run(0, vec![0, 4, 0]);

        // Nobody votes.
        assert_eq!(None, get_cluster_commit_index(vec![]));
    }

    #[test]
    fn test_candidate_log_comparison() {
        let entry = |term: u64, index: u64| Some((Term::new(term), Index::new(index)));

        assert!(is_candidate_log_gte_mine(None, None));
        assert!(is_candidate_log_gte_mine(None, entry(1, 1)));
        assert!(!is_candidate_log_gte_mine(entry(1, 1), None));

        // Later term wins regardless of length.
        assert!(is_candidate_log_gte_mine(entry(1, 9), entry(2, 1)));
        assert!(!is_candidate_log_gte_mine(entry(2, 1), entry(1, 9)));

        // Same term, longer or equal wins.
        assert!(is_candidate_log_gte_mine(entry(3, 5), entry(3, 5)));
        assert!(is_candidate_log_gte_mine(entry(3, 5), entry(3, 6)));
        assert!(!is_candidate_log_gte_mine(entry(3, 5), entry(3, 4)));
    }

    #[test]
    fn test_majority() {
        assert_eq!(get_majority_vote_count(1), 1);
        assert_eq!(get_majority_vote_count(2), 2);
        assert_eq!(get_majority_vote_count(3), 2);
        assert_eq!(get_majority_vote_count(4), 3);
        assert_eq!(get_majority_vote_count(5), 3);
    }
}
