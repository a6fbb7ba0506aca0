use crate::api::{CpError, ReferenceFunction};
use crate::commitlog::Index;
use crate::cp::group::dedup::ResponseWindow;
use crate::cp::group::session::SessionRegistry;
use crate::cp::group::{GroupCommand, GroupResponse, RequestId, Value};
use crate::cp::primitives::{Completion, Primitive, PrimitiveKind, PrimitiveOp};
use crate::raft::{Applied, ApplyContext, ApplyOutcome, SnapshotError, StateMachine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const RESPONSE_WINDOW_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ParkedWait {
    index: u64,
    kind: PrimitiveKind,
    object: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct GroupState {
    sessions: SessionRegistry,
    responses: ResponseWindow,
    primitives: BTreeMap<(PrimitiveKind, String), Primitive>,
    // Waits queued in some primitive, and the log index their caller is parked under.
    parked: BTreeMap<RequestId, ParkedWait>,
}

/// GroupStateMachine is the replicated state of a data CP group: its sessions and every
/// primitive created in it.
pub(crate) struct GroupStateMachine {
    logger: slog::Logger,
    state: GroupState,
    functions: Arc<HashMap<String, ReferenceFunction>>,
}

struct Applying {
    response: Option<GroupResponse>,
    completed: Vec<(Index, Bytes)>,
}

impl GroupStateMachine {
    pub(crate) fn new(logger: slog::Logger, functions: Arc<HashMap<String, ReferenceFunction>>) -> Self {
        GroupStateMachine {
            logger,
            state: GroupState {
                sessions: SessionRegistry::default(),
                responses: ResponseWindow::new(RESPONSE_WINDOW_CAPACITY),
                primitives: BTreeMap::new(),
                parked: BTreeMap::new(),
            },
            functions,
        }
    }

    fn apply_command(&mut self, context: &ApplyContext, command: GroupCommand) -> Applying {
        let now = context.timestamp_millis;
        match command {
            GroupCommand::CreateSession { endpoint, ttl_millis } => {
                let session = self.state.sessions.create(endpoint, ttl_millis, now);
                slog::debug!(self.logger, "Created session {} for {}", session.id, endpoint);
                respond(Ok(Value::Session(session)))
            }
            GroupCommand::HeartbeatSession { session_id } => {
                respond(self.state.sessions.heartbeat(session_id, now).map(|_| Value::None))
            }
            GroupCommand::CloseSession { session_id } => {
                let closed = self.state.sessions.close(session_id);
                let completed = if closed {
                    slog::info!(self.logger, "Session {} closed", session_id);
                    self.release_session(session_id)
                } else {
                    Vec::new()
                };
                Applying {
                    response: Some(Ok(Value::Bool(closed))),
                    completed,
                }
            }
            GroupCommand::ExpireSessions => {
                let mut completed = Vec::new();
                for session_id in self.state.sessions.expired(now) {
                    slog::info!(self.logger, "Session {} expired", session_id);
                    self.state.sessions.close(session_id);
                    completed.extend(self.release_session(session_id));
                }
                Applying {
                    response: Some(Ok(Value::None)),
                    completed,
                }
            }
            GroupCommand::GetSessions => respond(Ok(Value::Sessions(self.state.sessions.sessions()))),
            GroupCommand::Invoke { request, object, op } => self.invoke(context.index, request, object, op),
            GroupCommand::CancelWait {
                request,
                target,
                kind,
                object,
            } => self.cancel_wait(request, target, kind, object),
        }
    }

    fn invoke(&mut self, index: Index, request: RequestId, object: String, op: PrimitiveOp) -> Applying {
        if let Some(response) = self.state.responses.get(&request) {
            return respond(response.clone());
        }
        // A retry of a call that is still waiting. Answer it under the new index.
        if let Some(parked) = self.state.parked.get_mut(&request) {
            parked.index = index.as_u64();
            return Applying {
                response: None,
                completed: Vec::new(),
            };
        }

        if let Some(session_id) = op.session_id() {
            if !self.state.sessions.contains(session_id) {
                let response = Err(CpError::SessionExpired { session_id });
                self.state.responses.record(request, response.clone());
                return respond(response);
            }
        }

        let kind = op.kind();
        let functions = self.functions.clone();
        let outcome = self
            .state
            .primitives
            .entry((kind, object.clone()))
            .or_insert_with(|| Primitive::new(kind))
            .apply(request, op, &functions);

        match &outcome.response {
            Some(response) => self.state.responses.record(request, response.clone()),
            None => {
                self.state.parked.insert(
                    request,
                    ParkedWait {
                        index: index.as_u64(),
                        kind,
                        object,
                    },
                );
            }
        }

        Applying {
            response: outcome.response,
            completed: self.complete(outcome.completed),
        }
    }

    fn cancel_wait(&mut self, request: RequestId, target: RequestId, kind: PrimitiveKind, object: String) -> Applying {
        if let Some(response) = self.state.responses.get(&request) {
            return respond(response.clone());
        }
        // Granted (or failed) before the cancel got here.
        if let Some(response) = self.state.responses.get(&target).cloned() {
            self.state.responses.record(request, response.clone());
            return respond(response);
        }

        let timed_out: GroupResponse = Ok(kind.timeout_value());
        // Also answers the original call if it commits after this.
        self.state.responses.record(target, timed_out.clone());
        self.state.responses.record(request, timed_out.clone());

        let mut completed = Vec::new();
        if let Some(parked) = self.state.parked.remove(&target) {
            completed.push((Index::new(parked.index), encode_response(&timed_out)));
            if let Some(primitive) = self.state.primitives.get_mut(&(parked.kind, parked.object)) {
                let (_, unblocked) = primitive.cancel_wait(target);
                completed.extend(self.complete(unblocked));
            }
        } else {
            slog::debug!(self.logger, "Cancel of unknown wait {:?} on {:?} '{}'", target, kind, object);
        }

        Applying {
            response: Some(timed_out),
            completed,
        }
    }

    fn release_session(&mut self, session_id: u64) -> Vec<(Index, Bytes)> {
        let mut completions = Vec::new();
        for primitive in self.state.primitives.values_mut() {
            completions.extend(primitive.release_session(session_id));
        }
        self.complete(completions)
    }

    fn complete(&mut self, completions: Vec<Completion>) -> Vec<(Index, Bytes)> {
        let mut completed = Vec::with_capacity(completions.len());
        for (request, response) in completions {
            let encoded = encode_response(&response);
            self.state.responses.record(request, response);
            if let Some(parked) = self.state.parked.remove(&request) {
                completed.push((Index::new(parked.index), encoded));
            }
        }
        completed
    }
}

impl StateMachine for GroupStateMachine {
    fn apply(&mut self, context: &ApplyContext, command: &[u8]) -> ApplyOutcome {
        let command: GroupCommand = match bincode::deserialize(command) {
            Ok(command) => command,
            Err(e) => return ApplyOutcome::response(encode_response(&Err(CpError::from(e)))),
        };

        let applying = self.apply_command(context, command);
        ApplyOutcome {
            applied: match applying.response {
                Some(response) => Applied::Response(encode_response(&response)),
                None => Applied::Parked,
            },
            completed: applying.completed,
        }
    }

    fn take_snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        bincode::serialize(&self.state).map_err(|e| SnapshotError(e.to_string()))
    }

    fn restore_snapshot(&mut self, snapshot: &[u8]) -> Result<(), SnapshotError> {
        self.state = bincode::deserialize(snapshot).map_err(|e| SnapshotError(e.to_string()))?;
        Ok(())
    }
}

fn respond(response: GroupResponse) -> Applying {
    Applying {
        response: Some(response),
        completed: Vec::new(),
    }
}

pub(crate) fn encode_response(response: &GroupResponse) -> Bytes {
    // Empty bytes never decode, so a failure here reaches the caller as a codec error.
    bincode::serialize(response).map(Bytes::from).unwrap_or_default()
}

pub(crate) fn decode_response(bytes: &[u8]) -> GroupResponse {
    bincode::deserialize(bytes).map_err(CpError::from)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp::primitives::{AtomicLongOp, FencedLockOp, SemaphoreOp, INVALID_FENCE};
    use uuid::Uuid;

    fn sessions_of(sm: &GroupStateMachine, endpoint: Uuid) -> Vec<u64> {
        sm.state
            .sessions
            .sessions()
            .into_iter()
            .filter(|s| s.endpoint == endpoint)
            .map(|s| s.id)
            .collect()
    }

    struct Harness {
        sm: GroupStateMachine,
        index: u64,
        now: u64,
    }

    impl Harness {
        fn new() -> Self {
            let logger = slog::Logger::root(slog::Discard, slog::o!());
            Harness {
                sm: GroupStateMachine::new(logger, Arc::new(HashMap::new())),
                index: 0,
                now: 1_000,
            }
        }

        fn apply(&mut self, command: GroupCommand) -> (Option<GroupResponse>, Vec<(u64, GroupResponse)>) {
            self.index += 1;
            let context = ApplyContext {
                index: Index::new(self.index),
                timestamp_millis: self.now,
            };
            let bytes = bincode::serialize(&command).unwrap();
            let outcome = self.sm.apply(&context, &bytes);
            let response = match outcome.applied {
                Applied::Response(bytes) => Some(decode_response(&bytes)),
                Applied::Parked => None,
            };
            let completed = outcome
                .completed
                .into_iter()
                .map(|(index, bytes)| (index.as_u64(), decode_response(&bytes)))
                .collect();
            (response, completed)
        }

        fn session(&mut self, endpoint: Uuid) -> u64 {
            match self.apply(GroupCommand::CreateSession {
                endpoint,
                ttl_millis: 10_000,
            }) {
                (Some(Ok(Value::Session(session))), _) => session.id,
                other => panic!("{:?}", other),
            }
        }
    }

    fn invoke(endpoint: Uuid, call_id: u64, object: &str, op: PrimitiveOp) -> GroupCommand {
        GroupCommand::Invoke {
            request: RequestId { endpoint, call_id },
            object: object.into(),
            op,
        }
    }

    fn lock(endpoint: Uuid, call_id: u64, session_id: u64) -> GroupCommand {
        invoke(
            endpoint,
            call_id,
            "lock",
            PrimitiveOp::FencedLock(FencedLockOp::Lock { session_id, wait: true }),
        )
    }

    #[test]
    fn duplicate_calls_are_answered_from_the_window() {
        let mut h = Harness::new();
        let endpoint = Uuid::new_v4();
        let add = invoke(
            endpoint,
            1,
            "counter",
            PrimitiveOp::AtomicLong(AtomicLongOp::AddAndGet(5)),
        );

        assert_eq!(h.apply(add.clone()).0, Some(Ok(Value::Long(5))));
        assert_eq!(h.apply(add).0, Some(Ok(Value::Long(5))));

        let get = invoke(endpoint, 2, "counter", PrimitiveOp::AtomicLong(AtomicLongOp::Get));
        assert_eq!(h.apply(get).0, Some(Ok(Value::Long(5))));
    }

    #[test]
    fn same_name_different_kind_are_different_objects() {
        let mut h = Harness::new();
        let endpoint = Uuid::new_v4();
        let session_id = h.session(endpoint);

        h.apply(invoke(endpoint, 1, "x", PrimitiveOp::AtomicLong(AtomicLongOp::Set(3))));
        let (response, _) = h.apply(invoke(
            endpoint,
            2,
            "x",
            PrimitiveOp::Semaphore(SemaphoreOp::Acquire {
                session_id,
                permits: 1,
                wait: false,
            }),
        ));
        assert_eq!(response, Some(Ok(Value::Bool(false))));
    }

    #[test]
    fn expired_session_releases_lock_to_waiter() {
        let mut h = Harness::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let session_a = h.session(a);
        h.now = 5_000;
        let session_b = h.session(b);

        assert_eq!(h.apply(lock(a, 1, session_a)).0, Some(Ok(Value::Fence(1))));
        let (response, _) = h.apply(lock(b, 1, session_b));
        assert_eq!(response, None);
        let waiting_index = h.index;

        h.now = 11_000;
        let (_, completed) = h.apply(GroupCommand::ExpireSessions);
        assert_eq!(completed, vec![(waiting_index, Ok(Value::Fence(2)))]);
        assert_eq!(sessions_of(&h.sm, a), Vec::<u64>::new());
        assert_eq!(sessions_of(&h.sm, b), vec![session_b]);

        // The expired session can no longer act.
        let (response, _) = h.apply(lock(a, 2, session_a));
        assert_eq!(response, Some(Err(CpError::SessionExpired { session_id: session_a })));
    }

    #[test]
    fn retried_wait_moves_to_new_index() {
        let mut h = Harness::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let session_a = h.session(a);
        let session_b = h.session(b);

        h.apply(lock(a, 1, session_a));
        assert_eq!(h.apply(lock(b, 1, session_b)).0, None);
        // Resubmitted after a leader change.
        assert_eq!(h.apply(lock(b, 1, session_b)).0, None);
        let retried_index = h.index;

        let unlock = invoke(
            a,
            2,
            "lock",
            PrimitiveOp::FencedLock(FencedLockOp::Unlock { session_id: session_a }),
        );
        let (_, completed) = h.apply(unlock);
        assert_eq!(completed, vec![(retried_index, Ok(Value::Fence(2)))]);

        // And a late duplicate gets the granted fence.
        assert_eq!(h.apply(lock(b, 1, session_b)).0, Some(Ok(Value::Fence(2))));
    }

    #[test]
    fn cancel_wait_answers_the_parked_call() {
        let mut h = Harness::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let session_a = h.session(a);
        let session_b = h.session(b);

        h.apply(lock(a, 1, session_a));
        h.apply(lock(b, 1, session_b));
        let waiting_index = h.index;

        let cancel = GroupCommand::CancelWait {
            request: RequestId { endpoint: b, call_id: 2 },
            target: RequestId { endpoint: b, call_id: 1 },
            kind: PrimitiveKind::FencedLock,
            object: "lock".into(),
        };
        let (response, completed) = h.apply(cancel);
        assert_eq!(response, Some(Ok(Value::Fence(INVALID_FENCE))));
        assert_eq!(completed, vec![(waiting_index, Ok(Value::Fence(INVALID_FENCE)))]);

        // Nothing left waiting: unlocking grants nobody.
        let unlock = invoke(
            a,
            2,
            "lock",
            PrimitiveOp::FencedLock(FencedLockOp::Unlock { session_id: session_a }),
        );
        assert!(h.apply(unlock).1.is_empty());
    }

    #[test]
    fn cancel_after_grant_returns_the_grant() {
        let mut h = Harness::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let session_a = h.session(a);
        let session_b = h.session(b);

        h.apply(lock(a, 1, session_a));
        h.apply(lock(b, 1, session_b));
        h.apply(GroupCommand::CloseSession { session_id: session_a });

        let cancel = GroupCommand::CancelWait {
            request: RequestId { endpoint: b, call_id: 2 },
            target: RequestId { endpoint: b, call_id: 1 },
            kind: PrimitiveKind::FencedLock,
            object: "lock".into(),
        };
        assert_eq!(h.apply(cancel).0, Some(Ok(Value::Fence(2))));
    }

    #[test]
    fn snapshot_restores_identical_state() {
        let mut h = Harness::new();
        let endpoint = Uuid::new_v4();
        let session_id = h.session(endpoint);
        h.apply(lock(endpoint, 1, session_id));
        h.apply(invoke(
            endpoint,
            2,
            "counter",
            PrimitiveOp::AtomicLong(AtomicLongOp::Set(42)),
        ));

        let snapshot = h.sm.take_snapshot().unwrap();
        let mut restored = Harness::new();
        restored.sm.restore_snapshot(&snapshot).unwrap();
        restored.index = h.index;
        assert_eq!(restored.sm.take_snapshot().unwrap(), snapshot);

        let get = invoke(endpoint, 3, "counter", PrimitiveOp::AtomicLong(AtomicLongOp::Get));
        assert_eq!(restored.apply(get).0, Some(Ok(Value::Long(42))));
        // Reentrant on the restored lock: same fence.
        assert_eq!(restored.apply(lock(endpoint, 4, session_id)).0, Some(Ok(Value::Fence(1))));
    }
}
