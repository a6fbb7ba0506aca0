use crate::api::CpError;
use crate::cp::group::{RequestId, Value};
use crate::cp::primitives::{Completion, Outcome};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum SemaphoreOp {
    Init { permits: u32 },
    Acquire { session_id: u64, permits: u32, wait: bool },
    Release { session_id: u64, permits: u32 },
    AvailablePermits,
    Drain { session_id: u64 },
}

impl SemaphoreOp {
    pub(crate) fn session_id(&self) -> Option<u64> {
        match self {
            SemaphoreOp::Acquire { session_id, .. }
            | SemaphoreOp::Release { session_id, .. }
            | SemaphoreOp::Drain { session_id } => Some(*session_id),
            SemaphoreOp::Init { .. } | SemaphoreOp::AvailablePermits => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SemaphoreWaiter {
    request: RequestId,
    session_id: u64,
    permits: u64,
}

/// Counting semaphore with a strict FIFO wait queue: nothing is granted past a waiter that
/// cannot be satisfied yet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct SemaphoreState {
    initialized: bool,
    available: u64,
    // Permits held per session, returned when the session goes away.
    held: BTreeMap<u64, u64>,
    waiters: VecDeque<SemaphoreWaiter>,
}

impl SemaphoreState {
    pub(crate) fn apply(&mut self, request: RequestId, op: SemaphoreOp) -> Outcome {
        match op {
            SemaphoreOp::Init { permits } => self.init(permits),
            SemaphoreOp::Acquire {
                session_id,
                permits,
                wait,
            } => self.acquire(request, session_id, permits, wait),
            SemaphoreOp::Release { session_id, permits } => self.release(session_id, permits),
            SemaphoreOp::AvailablePermits => Outcome::value(Value::Count(self.available)),
            SemaphoreOp::Drain { session_id } => self.drain(session_id),
        }
    }

    fn init(&mut self, permits: u32) -> Outcome {
        if self.initialized {
            return Outcome::value(Value::Bool(false));
        }
        self.initialized = true;
        self.available += u64::from(permits);
        let completed = self.grant_waiters();
        Outcome::value(Value::Bool(true)).with_completed(completed)
    }

    fn acquire(&mut self, request: RequestId, session_id: u64, permits: u32, wait: bool) -> Outcome {
        if permits == 0 {
            return Outcome::error(CpError::IllegalArgument("Permits must be positive".into()));
        }
        let permits = u64::from(permits);

        if self.waiters.is_empty() && self.available >= permits {
            self.take(session_id, permits);
            return Outcome::value(Value::Bool(true));
        }

        if wait {
            self.waiters.push_back(SemaphoreWaiter {
                request,
                session_id,
                permits,
            });
            Outcome::parked()
        } else {
            Outcome::value(Value::Bool(false))
        }
    }

    fn release(&mut self, session_id: u64, permits: u32) -> Outcome {
        if permits == 0 {
            return Outcome::error(CpError::IllegalArgument("Permits must be positive".into()));
        }
        let permits = u64::from(permits);

        let held = self.held.get(&session_id).copied().unwrap_or(0);
        if held < permits {
            return Outcome::error(CpError::IllegalState(format!(
                "Cannot release {} permits. Session {} holds {}.",
                permits, session_id, held
            )));
        }

        self.give_back(session_id, permits);
        let completed = self.grant_waiters();
        Outcome::value(Value::None).with_completed(completed)
    }

    fn drain(&mut self, session_id: u64) -> Outcome {
        let drained = self.available;
        if drained > 0 {
            self.take(session_id, drained);
        }
        Outcome::value(Value::Count(drained))
    }

    pub(crate) fn release_session(&mut self, session_id: u64) -> Vec<Completion> {
        let mut completed = Vec::new();
        self.waiters.retain(|waiter| {
            if waiter.session_id == session_id {
                completed.push((waiter.request, Err(CpError::SessionExpired { session_id })));
                false
            } else {
                true
            }
        });

        if let Some(held) = self.held.get(&session_id).copied() {
            self.give_back(session_id, held);
        }
        completed.extend(self.grant_waiters());
        completed
    }

    pub(crate) fn cancel_wait(&mut self, request: RequestId) -> (bool, Vec<Completion>) {
        let before = self.waiters.len();
        self.waiters.retain(|waiter| waiter.request != request);
        if self.waiters.len() == before {
            return (false, Vec::new());
        }
        // The cancelled waiter may have been the one blocking the queue.
        (true, self.grant_waiters())
    }

    fn grant_waiters(&mut self) -> Vec<Completion> {
        let mut completed = Vec::new();
        while let Some(head) = self.waiters.front() {
            if head.permits > self.available {
                break;
            }
            if let Some(waiter) = self.waiters.pop_front() {
                self.take(waiter.session_id, waiter.permits);
                completed.push((waiter.request, Ok(Value::Bool(true))));
            }
        }
        completed
    }

    fn take(&mut self, session_id: u64, permits: u64) {
        assert!(self.available >= permits);
        self.available -= permits;
        *self.held.entry(session_id).or_insert(0) += permits;
    }

    fn give_back(&mut self, session_id: u64, permits: u64) {
        if let Some(held) = self.held.get_mut(&session_id) {
            *held -= permits;
            if *held == 0 {
                self.held.remove(&session_id);
            }
        }
        self.available += permits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp::primitives::test_utils::request;

    fn acquire(state: &mut SemaphoreState, call_id: u64, session_id: u64, permits: u32, wait: bool) -> Outcome {
        state.apply(
            request(call_id),
            SemaphoreOp::Acquire {
                session_id,
                permits,
                wait,
            },
        )
    }

    fn release(state: &mut SemaphoreState, session_id: u64, permits: u32) -> Outcome {
        state.apply(request(0), SemaphoreOp::Release { session_id, permits })
    }

    fn initialized(permits: u32) -> SemaphoreState {
        let mut state = SemaphoreState::default();
        assert_eq!(
            state.apply(request(0), SemaphoreOp::Init { permits }),
            Outcome::value(Value::Bool(true))
        );
        state
    }

    #[test]
    fn init_only_once() {
        let mut state = initialized(3);
        assert_eq!(
            state.apply(request(0), SemaphoreOp::Init { permits: 5 }),
            Outcome::value(Value::Bool(false))
        );
        assert_eq!(state.available, 3);
    }

    #[test]
    fn acquire_and_release() {
        let mut state = initialized(3);
        assert_eq!(acquire(&mut state, 1, 10, 2, false), Outcome::value(Value::Bool(true)));
        assert_eq!(acquire(&mut state, 2, 20, 2, false), Outcome::value(Value::Bool(false)));
        assert_eq!(state.available, 1);

        assert_eq!(release(&mut state, 10, 2), Outcome::value(Value::None));
        assert_eq!(state.available, 3);
        assert!(state.held.is_empty());
    }

    #[test]
    fn release_more_than_held_is_rejected() {
        let mut state = initialized(3);
        acquire(&mut state, 1, 10, 1, false);
        assert!(matches!(
            release(&mut state, 10, 2).response,
            Some(Err(CpError::IllegalState(_)))
        ));
        assert!(matches!(
            release(&mut state, 20, 1).response,
            Some(Err(CpError::IllegalState(_)))
        ));
        assert_eq!(state.available, 2);
    }

    #[test]
    fn waiters_are_served_strictly_in_order() {
        let mut state = initialized(2);
        acquire(&mut state, 1, 10, 2, false);
        assert_eq!(acquire(&mut state, 2, 20, 2, true), Outcome::parked());
        assert_eq!(acquire(&mut state, 3, 30, 1, true), Outcome::parked());

        // One permit back is enough for session 30, but 20 is first in line.
        let outcome = release(&mut state, 10, 1);
        assert!(outcome.completed.is_empty());

        // No barging either.
        assert_eq!(acquire(&mut state, 4, 40, 1, false), Outcome::value(Value::Bool(false)));

        let outcome = release(&mut state, 10, 1);
        assert_eq!(outcome.completed, vec![(request(2), Ok(Value::Bool(true)))]);
        assert_eq!(state.available, 0);
    }

    #[test]
    fn released_session_returns_its_permits() {
        let mut state = initialized(3);
        acquire(&mut state, 1, 10, 2, false);
        acquire(&mut state, 2, 20, 1, false);
        assert_eq!(acquire(&mut state, 3, 30, 2, true), Outcome::parked());

        let completed = state.release_session(10);
        assert_eq!(completed, vec![(request(3), Ok(Value::Bool(true)))]);
        assert_eq!(state.held.get(&20), Some(&1));
        assert_eq!(state.held.get(&30), Some(&2));
        assert_eq!(state.available, 0);
    }

    #[test]
    fn cancelling_the_head_unblocks_the_rest() {
        let mut state = initialized(1);
        acquire(&mut state, 1, 10, 1, false);
        release(&mut state, 10, 1);
        acquire(&mut state, 2, 10, 1, false);
        acquire(&mut state, 3, 20, 5, true);
        acquire(&mut state, 4, 30, 1, true);
        release(&mut state, 10, 1);

        let (found, completed) = state.cancel_wait(request(3));
        assert!(found);
        assert_eq!(completed, vec![(request(4), Ok(Value::Bool(true)))]);
    }

    #[test]
    fn drain_takes_everything_available() {
        let mut state = initialized(4);
        acquire(&mut state, 1, 10, 1, false);
        assert_eq!(
            state.apply(request(2), SemaphoreOp::Drain { session_id: 20 }),
            Outcome::value(Value::Count(3))
        );
        assert_eq!(state.available, 0);
        assert_eq!(state.held.get(&20), Some(&3));
    }
}
