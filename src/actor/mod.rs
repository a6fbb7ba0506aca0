use crate::commitlog::Log;
use crate::raft::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer, ChangeMembershipInput,
    HeartbeatTick, InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput, InstallSnapshotReplyFromPeer,
    RaftNode, RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer, SubmitError,
    SubmitInput, SubmitOutput, WriteAheadLogEntry,
};
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// v1 Design choice: Disk interaction will be synchronous. Future improvement: There should be a
//                   Disk Actor.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Write to log, replicate eagerly, park callback until applied.
    // Candidate: Reject request.
    // Follower: Redirect.
    Submit(SubmitInput, Callback<SubmitOutput, SubmitError>),

    // Leader: Append MEMBERSHIP_CHANGE entry, park callback until committed.
    // Candidate/Follower: Redirect.
    ChangeMembership(ChangeMembershipInput, Callback<SubmitOutput, SubmitError>),

    // Leader: Grant vote if applicable. Transition to follower.
    // Candidate: Grant vote if applicable. Transition to follower.
    // Follower: Grant vote if applicable.
    RequestVote(RequestVoteInput, Callback<RequestVoteOutput, RequestVoteError>),

    // Leader: discard
    // Candidate: Update local state. Transition to leader if quorum vote.
    // Follower: discard
    RequestVoteReplyFromPeer(RequestVoteReplyFromPeer),

    // Leader: Transition to follower if applicable. Clean up log. Respond to request.
    // Candidate: Transition to follower if applicable. Clean up log. Respond to request.
    // Follower: Write to log then respond. Reset timeout.
    AppendEntries(AppendEntriesInput, Callback<AppendEntriesOutput, AppendEntriesError>),

    // Leader: Update per peer replication progress. Commit and apply what a majority holds.
    // Candidate/Follower: discard
    AppendEntriesReplyFromPeer(AppendEntriesReplyFromPeer),

    // Same as AppendEntries, with the whole state machine instead of entries.
    InstallSnapshot(InstallSnapshotInput, Callback<InstallSnapshotOutput, InstallSnapshotError>),
    InstallSnapshotReplyFromPeer(InstallSnapshotReplyFromPeer),

    // Leader: Call AppendEntries (or InstallSnapshot) on the peer.
    // Candidate/Follower: NOT POSSIBLE - discard
    HeartbeatDue(HeartbeatTick),

    // Leader: NOT POSSIBLE - discard
    // Candidate/Follower: Transition to candidate. Trigger new election.
    ElectionTimeout,

    // Fail everything parked and exit the event loop.
    Terminate(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Raft node event loop has exited")]
pub(crate) struct ActorExited;

/// ActorClient keeps the event loop alive. Held by whoever owns the RaftNode.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

/// WeakActorClient is held by the node itself, its timers and its in-flight peer calls, none of
/// which should keep a terminated node around.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn submit(&self, input: SubmitInput) -> Result<SubmitOutput, SubmitError> {
        self.call(|cb| Event::Submit(input, cb)).await
    }

    pub(crate) async fn change_membership(&self, input: ChangeMembershipInput) -> Result<SubmitOutput, SubmitError> {
        self.call(|cb| Event::ChangeMembership(input, cb)).await
    }

    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        self.call(|cb| Event::RequestVote(input, cb)).await
    }

    pub(crate) async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        self.call(|cb| Event::AppendEntries(input, cb)).await
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        self.call(|cb| Event::InstallSnapshot(input, cb)).await
    }

    /// Stops the node. Returns once the event loop has failed every parked call.
    pub(crate) async fn terminate(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Event::Terminate(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn call<O, E, F>(&self, to_event: F) -> Result<O, E>
    where
        O: Debug,
        E: Error + From<ActorExited>,
        F: FnOnce(Callback<O, E>) -> Event,
    {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(to_event(Callback(tx)))
            .await
            .map_err(|_| ActorExited)?;

        rx.await.map_err(|_| ActorExited)?
    }
}

impl WeakActorClient {
    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        reply: RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        reply: AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(
        &self,
        reply: InstallSnapshotReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::InstallSnapshotReplyFromPeer(reply)).await
    }

    pub(crate) async fn heartbeat_due(&self, tick: HeartbeatTick) -> Result<(), ActorExited> {
        self.send(Event::HeartbeatDue(tick)).await
    }

    pub(crate) async fn election_timeout(&self) -> Result<(), ActorExited> {
        self.send(Event::ElectionTimeout).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        match self.sender.upgrade() {
            Some(sender) => sender.send(event).await.map_err(|_| ActorExited),
            None => Err(ActorExited),
        }
    }
}

/// NodeActor is the RaftNode in actor model.
pub(crate) struct NodeActor<L>
where
    L: Log<WriteAheadLogEntry>,
{
    receiver: mpsc::Receiver<Event>,
    node: RaftNode<L>,
}

impl<L> NodeActor<L>
where
    L: Log<WriteAheadLogEntry> + Send + 'static,
{
    pub(crate) fn new(receiver: mpsc::Receiver<Event>, node: RaftNode<L>) -> Self {
        NodeActor { receiver, node }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            if let Event::Terminate(done) = event {
                self.node.terminate();
                let _ = done.send(());
                break;
            }
            self.handle_event(event);
        }

        // Anything queued behind Terminate gets the same answer.
        self.receiver.close();
        while let Some(event) = self.receiver.recv().await {
            Self::reject_after_terminate(event);
        }
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Submit(input, callback) => self.node.handle_submit(input, callback),
            Event::ChangeMembership(input, callback) => self.node.handle_change_membership(input, callback),
            Event::RequestVote(input, callback) => {
                let result = self.node.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(reply) => self.node.handle_request_vote_reply_from_peer(reply),
            Event::AppendEntries(input, callback) => {
                let result = self.node.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::AppendEntriesReplyFromPeer(reply) => self.node.handle_append_entries_reply_from_peer(reply),
            Event::InstallSnapshot(input, callback) => {
                let result = self.node.server_handle_install_snapshot(input);
                callback.send(result);
            }
            Event::InstallSnapshotReplyFromPeer(reply) => self.node.handle_install_snapshot_reply_from_peer(reply),
            Event::HeartbeatDue(tick) => self.node.handle_heartbeat_due(tick),
            Event::ElectionTimeout => self.node.handle_election_timeout(),
            Event::Terminate(done) => {
                let _ = done.send(());
            }
        }
    }

    fn reject_after_terminate(event: Event) {
        match event {
            Event::Submit(_, callback) | Event::ChangeMembership(_, callback) => {
                callback.send(Err(SubmitError::Terminated))
            }
            Event::RequestVote(_, callback) => callback.send(Err(RequestVoteError::Terminated)),
            Event::AppendEntries(_, callback) => callback.send(Err(AppendEntriesError::Terminated)),
            Event::InstallSnapshot(_, callback) => callback.send(Err(InstallSnapshotError::Terminated)),
            Event::Terminate(done) => {
                let _ = done.send(());
            }
            Event::RequestVoteReplyFromPeer(_)
            | Event::AppendEntriesReplyFromPeer(_)
            | Event::InstallSnapshotReplyFromPeer(_)
            | Event::HeartbeatDue(_)
            | Event::ElectionTimeout => {}
        }
    }
}
