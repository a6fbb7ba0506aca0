mod atomic_long;
mod atomic_reference;
mod count_down_latch;
mod fenced_lock;
mod semaphore;

pub use atomic_long::LongFunction;
pub(crate) use atomic_long::{AtomicLongOp, AtomicLongState};
pub(crate) use atomic_reference::{AtomicReferenceOp, AtomicReferenceState};
pub(crate) use count_down_latch::{CountDownLatchOp, CountDownLatchState};
pub(crate) use fenced_lock::{FencedLockOp, FencedLockState, LockOwnership, INVALID_FENCE};
pub(crate) use semaphore::{SemaphoreOp, SemaphoreState};

use crate::api::{CpError, ReferenceFunction};
use crate::cp::group::{GroupResponse, RequestId, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) enum PrimitiveKind {
    AtomicLong,
    AtomicReference,
    CountDownLatch,
    Semaphore,
    FencedLock,
}

impl PrimitiveKind {
    /// What a wait of this kind answers when it gives up.
    pub(crate) fn timeout_value(self) -> Value {
        match self {
            PrimitiveKind::FencedLock => Value::Fence(INVALID_FENCE),
            PrimitiveKind::Semaphore | PrimitiveKind::CountDownLatch => Value::Bool(false),
            PrimitiveKind::AtomicLong | PrimitiveKind::AtomicReference => Value::None,
        }
    }
}

/// Which value an alter call answers with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum AlterMode {
    Alter,
    AlterAndGet,
    GetAndAlter,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum PrimitiveOp {
    AtomicLong(AtomicLongOp),
    AtomicReference(AtomicReferenceOp),
    CountDownLatch(CountDownLatchOp),
    Semaphore(SemaphoreOp),
    FencedLock(FencedLockOp),
}

impl PrimitiveOp {
    pub(crate) fn kind(&self) -> PrimitiveKind {
        match self {
            PrimitiveOp::AtomicLong(_) => PrimitiveKind::AtomicLong,
            PrimitiveOp::AtomicReference(_) => PrimitiveKind::AtomicReference,
            PrimitiveOp::CountDownLatch(_) => PrimitiveKind::CountDownLatch,
            PrimitiveOp::Semaphore(_) => PrimitiveKind::Semaphore,
            PrimitiveOp::FencedLock(_) => PrimitiveKind::FencedLock,
        }
    }

    /// The session this operation acts on behalf of, if it is session-bound.
    pub(crate) fn session_id(&self) -> Option<u64> {
        match self {
            PrimitiveOp::Semaphore(op) => op.session_id(),
            PrimitiveOp::FencedLock(op) => op.session_id(),
            _ => None,
        }
    }
}

/// A wait that some later command satisfied, answered by the request it was parked under.
pub(crate) type Completion = (RequestId, GroupResponse);

#[derive(Debug, PartialEq)]
pub(crate) struct Outcome {
    /// None when the command is parked in a wait queue.
    pub(crate) response: Option<GroupResponse>,
    pub(crate) completed: Vec<Completion>,
}

impl Outcome {
    pub(crate) fn respond(response: GroupResponse) -> Self {
        Outcome {
            response: Some(response),
            completed: Vec::new(),
        }
    }

    pub(crate) fn value(value: Value) -> Self {
        Self::respond(Ok(value))
    }

    pub(crate) fn error(error: CpError) -> Self {
        Self::respond(Err(error))
    }

    pub(crate) fn parked() -> Self {
        Outcome {
            response: None,
            completed: Vec::new(),
        }
    }

    pub(crate) fn with_completed(mut self, completed: Vec<Completion>) -> Self {
        self.completed.extend(completed);
        self
    }
}

/// State of one named primitive inside a group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum Primitive {
    AtomicLong(AtomicLongState),
    AtomicReference(AtomicReferenceState),
    CountDownLatch(CountDownLatchState),
    Semaphore(SemaphoreState),
    FencedLock(FencedLockState),
}

impl Primitive {
    pub(crate) fn new(kind: PrimitiveKind) -> Self {
        match kind {
            PrimitiveKind::AtomicLong => Primitive::AtomicLong(AtomicLongState::default()),
            PrimitiveKind::AtomicReference => Primitive::AtomicReference(AtomicReferenceState::default()),
            PrimitiveKind::CountDownLatch => Primitive::CountDownLatch(CountDownLatchState::default()),
            PrimitiveKind::Semaphore => Primitive::Semaphore(SemaphoreState::default()),
            PrimitiveKind::FencedLock => Primitive::FencedLock(FencedLockState::default()),
        }
    }

    pub(crate) fn apply(
        &mut self,
        request: RequestId,
        op: PrimitiveOp,
        functions: &HashMap<String, ReferenceFunction>,
    ) -> Outcome {
        match (self, op) {
            (Primitive::AtomicLong(state), PrimitiveOp::AtomicLong(op)) => Outcome::respond(state.apply(op)),
            (Primitive::AtomicReference(state), PrimitiveOp::AtomicReference(op)) => {
                Outcome::respond(state.apply(op, functions))
            }
            (Primitive::CountDownLatch(state), PrimitiveOp::CountDownLatch(op)) => state.apply(request, op),
            (Primitive::Semaphore(state), PrimitiveOp::Semaphore(op)) => state.apply(request, op),
            (Primitive::FencedLock(state), PrimitiveOp::FencedLock(op)) => state.apply(request, op),
            (_, op) => Outcome::error(CpError::IllegalState(format!(
                "Operation {:?} does not match the primitive kind",
                op
            ))),
        }
    }

    /// Frees whatever `session_id` holds and drops its waits.
    pub(crate) fn release_session(&mut self, session_id: u64) -> Vec<Completion> {
        match self {
            Primitive::Semaphore(state) => state.release_session(session_id),
            Primitive::FencedLock(state) => state.release_session(session_id),
            // Latches and atomics are not session-bound.
            _ => Vec::new(),
        }
    }

    /// Removes a parked wait. Returns true if it was queued here, plus any waits that could
    /// proceed once it was gone.
    pub(crate) fn cancel_wait(&mut self, request: RequestId) -> (bool, Vec<Completion>) {
        match self {
            Primitive::CountDownLatch(state) => (state.cancel_wait(request), Vec::new()),
            Primitive::Semaphore(state) => state.cancel_wait(request),
            Primitive::FencedLock(state) => (state.cancel_wait(request), Vec::new()),
            _ => (false, Vec::new()),
        }
    }
}
