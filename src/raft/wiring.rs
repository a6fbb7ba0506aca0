use crate::actor::{ActorClient, NodeActor};
use crate::api::{CpGroupId, CpMember};
use crate::commitlog::InMemoryLog;
use crate::raft::{
    ElectionStateChangeListener, ElectionStateSnapshot, RaftNode, RaftNodeConfig, RaftNodeOptions, StateMachine,
    VolatileLocalState,
};
use crate::transport::RaftTransport;
use std::io;
use std::sync::Arc;

const EVENT_QUEUE_SIZE: usize = 256;

/// RaftNodeHandle owns a running RaftNode. Dropping every clone of it lets the node's event loop
/// drain and exit.
#[derive(Clone)]
pub(crate) struct RaftNodeHandle {
    actor_client: ActorClient,
    election_state: ElectionStateChangeListener,
}

impl RaftNodeHandle {
    pub(crate) fn actor_client(&self) -> &ActorClient {
        &self.actor_client
    }

    pub(crate) fn election_state(&self) -> ElectionStateSnapshot {
        self.election_state.current()
    }
}

/// Creates an in-memory RaftNode for `group_id` and spawns its event loop.
pub(crate) fn spawn_raft_node(
    logger: slog::Logger,
    group_id: CpGroupId,
    me: CpMember,
    initial_members: Vec<CpMember>,
    state_machine: Box<dyn StateMachine>,
    transport: Arc<dyn RaftTransport>,
    options: RaftNodeOptions,
) -> Result<RaftNodeHandle, io::Error> {
    let logger = logger.new(slog::o!("Group" => group_id.to_string()));
    let (actor_client, receiver) = ActorClient::new(EVENT_QUEUE_SIZE);

    let (node, election_state) = RaftNode::new(RaftNodeConfig {
        logger,
        group_id,
        local_state: Box::new(VolatileLocalState::new(me.uuid())),
        me,
        initial_members,
        log: InMemoryLog::create()?,
        state_machine,
        transport,
        actor_client: actor_client.weak(),
        options,
    });

    tokio::task::spawn(NodeActor::new(receiver, node).run_event_loop());

    Ok(RaftNodeHandle {
        actor_client,
        election_state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{
        ProtoAppendEntriesReq, ProtoAppendEntriesResp, ProtoInstallSnapshotReq, ProtoInstallSnapshotResp,
        ProtoInvokeReq, ProtoInvokeResp, ProtoRequestVoteReq, ProtoRequestVoteResp,
    };
    use crate::raft::{ApplyContext, ApplyOutcome, SnapshotError, SubmitInput};
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration, Instant};
    use tonic::Status;
    use uuid::Uuid;

    struct Counter(u64);

    impl StateMachine for Counter {
        fn apply(&mut self, _context: &ApplyContext, command: &[u8]) -> ApplyOutcome {
            self.0 += command.len() as u64;
            ApplyOutcome::response(Bytes::from(self.0.to_le_bytes().to_vec()))
        }

        fn take_snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
            Ok(self.0.to_le_bytes().to_vec())
        }

        fn restore_snapshot(&mut self, _snapshot: &[u8]) -> Result<(), SnapshotError> {
            Ok(())
        }
    }

    // Every peer answers except `down`, which is unreachable.
    struct OnePeerDown {
        down: Uuid,
        replication_calls_to_down: AtomicUsize,
    }

    impl OnePeerDown {
        fn reach(&self, peer: &CpMember, replication: bool) -> Result<(), Status> {
            if peer.uuid() != self.down {
                return Ok(());
            }
            if replication {
                self.replication_calls_to_down.fetch_add(1, Ordering::SeqCst);
            }
            Err(Status::unavailable("peer is down"))
        }
    }

    #[async_trait::async_trait]
    impl RaftTransport for OnePeerDown {
        async fn request_vote(
            &self,
            peer: &CpMember,
            request: ProtoRequestVoteReq,
        ) -> Result<ProtoRequestVoteResp, Status> {
            self.reach(peer, false)?;
            Ok(ProtoRequestVoteResp {
                term: request.term,
                granted: true,
            })
        }

        async fn append_entries(
            &self,
            peer: &CpMember,
            request: ProtoAppendEntriesReq,
        ) -> Result<ProtoAppendEntriesResp, Status> {
            self.reach(peer, true)?;
            Ok(ProtoAppendEntriesResp {
                term: request.term,
                success: true,
                match_index: request.prev_log_index + request.entries.len() as u64,
            })
        }

        async fn install_snapshot(
            &self,
            peer: &CpMember,
            request: ProtoInstallSnapshotReq,
        ) -> Result<ProtoInstallSnapshotResp, Status> {
            self.reach(peer, true)?;
            Ok(ProtoInstallSnapshotResp {
                term: request.term,
                success: true,
            })
        }

        async fn invoke(&self, _peer: &CpMember, _request: ProtoInvokeReq) -> Result<ProtoInvokeResp, Status> {
            Err(Status::unimplemented("invoke"))
        }
    }

    #[tokio::test]
    async fn unreachable_peer_is_retried_at_heartbeat_pace() {
        let members: Vec<CpMember> = (0..3)
            .map(|i| CpMember::new(Uuid::new_v4(), SocketAddr::from(([127, 0, 0, 1], 7100 + i))))
            .collect();
        let transport = Arc::new(OnePeerDown {
            down: members[2].uuid(),
            replication_calls_to_down: AtomicUsize::new(0),
        });
        let options = RaftNodeOptions {
            leader_heartbeat_duration: Duration::from_millis(50),
            follower_min_timeout: Duration::from_millis(100),
            follower_max_timeout: Duration::from_millis(200),
            append_entries_timeout: Duration::from_millis(40),
            max_append_entries: 64,
            commit_index_advance_count_to_snapshot: 1000,
        };
        let node = spawn_raft_node(
            slog::Logger::root(slog::Discard, slog::o!()),
            CpGroupId::new("a", 1),
            members[0].clone(),
            members.clone(),
            Box::new(Counter(0)),
            transport.clone(),
            options,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while node.election_state() != ElectionStateSnapshot::Leader {
            assert!(Instant::now() < deadline, "No leader elected");
            sleep(Duration::from_millis(10)).await;
        }

        let before = transport.replication_calls_to_down.load(Ordering::SeqCst);
        for _ in 0..5 {
            // The reachable peer is enough for a majority.
            node.actor_client()
                .submit(SubmitInput {
                    data: Bytes::from_static(b"x"),
                })
                .await
                .unwrap();
        }
        sleep(Duration::from_secs(1)).await;
        let calls = transport.replication_calls_to_down.load(Ordering::SeqCst) - before;

        // Roughly one attempt per heartbeat plus one per submission.
        assert!(calls > 0);
        assert!(calls < 60, "{} calls to an unreachable peer in one second", calls);
        node.actor_client().terminate().await;
    }
}
