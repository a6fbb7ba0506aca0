use crate::api::CpError;
use crate::cp::group::{GroupResponse, RequestId, Value};
use crate::cp::primitives::{Completion, Outcome};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Never handed out. Answered by failed or timed out acquisitions.
pub(crate) const INVALID_FENCE: u64 = 0;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum FencedLockOp {
    Lock { session_id: u64, wait: bool },
    Unlock { session_id: u64 },
    GetOwnership,
}

impl FencedLockOp {
    pub(crate) fn session_id(&self) -> Option<u64> {
        match self {
            FencedLockOp::Lock { session_id, .. } | FencedLockOp::Unlock { session_id } => Some(*session_id),
            FencedLockOp::GetOwnership => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LockOwnership {
    pub(crate) fence: u64,
    pub(crate) lock_count: u32,
    pub(crate) session_id: Option<u64>,
}

impl LockOwnership {
    pub(crate) fn is_locked(&self) -> bool {
        self.fence != INVALID_FENCE
    }

    pub(crate) fn is_locked_by(&self, session_id: u64) -> bool {
        self.is_locked() && self.session_id == Some(session_id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Owner {
    session_id: u64,
    fence: u64,
    lock_count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LockWaiter {
    request: RequestId,
    session_id: u64,
}

/// Reentrant lock owned by a session. Every unlocked to locked transition hands out the next
/// fence; waiters are granted in arrival order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct FencedLockState {
    owner: Option<Owner>,
    last_fence: u64,
    waiters: VecDeque<LockWaiter>,
}

impl FencedLockState {
    pub(crate) fn apply(&mut self, request: RequestId, op: FencedLockOp) -> Outcome {
        match op {
            FencedLockOp::Lock { session_id, wait } => self.lock(request, session_id, wait),
            FencedLockOp::Unlock { session_id } => self.unlock(session_id),
            FencedLockOp::GetOwnership => Outcome::value(Value::LockOwnership(self.ownership())),
        }
    }

    fn lock(&mut self, request: RequestId, session_id: u64, wait: bool) -> Outcome {
        if self.owner.is_none() {
            return Outcome::value(Value::Fence(self.acquire(session_id)));
        }

        match &mut self.owner {
            Some(owner) if owner.session_id == session_id => {
                owner.lock_count += 1;
                Outcome::value(Value::Fence(owner.fence))
            }
            Some(_) if wait => {
                self.waiters.push_back(LockWaiter { request, session_id });
                Outcome::parked()
            }
            _ => Outcome::value(Value::Fence(INVALID_FENCE)),
        }
    }

    fn unlock(&mut self, session_id: u64) -> Outcome {
        let owner = match &mut self.owner {
            Some(owner) if owner.session_id == session_id => owner,
            _ => {
                return Outcome::error(CpError::IllegalState(
                    "Current session is not the owner of the lock".into(),
                ))
            }
        };

        owner.lock_count -= 1;
        if owner.lock_count > 0 {
            return Outcome::value(Value::None);
        }

        self.owner = None;
        let completed = self.grant_next();
        Outcome::value(Value::None).with_completed(completed)
    }

    pub(crate) fn release_session(&mut self, session_id: u64) -> Vec<Completion> {
        let mut completed = Vec::new();
        self.waiters.retain(|waiter| {
            if waiter.session_id == session_id {
                completed.push((waiter.request, session_expired(session_id)));
                false
            } else {
                true
            }
        });

        if matches!(&self.owner, Some(owner) if owner.session_id == session_id) {
            self.owner = None;
            completed.extend(self.grant_next());
        }
        completed
    }

    pub(crate) fn cancel_wait(&mut self, request: RequestId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|waiter| waiter.request != request);
        self.waiters.len() != before
    }

    /// Hands the lock to the oldest waiter. The new owner's other queued waits re-enter with the
    /// same fence.
    fn grant_next(&mut self) -> Vec<Completion> {
        let waiter = match self.waiters.pop_front() {
            Some(waiter) => waiter,
            None => return Vec::new(),
        };

        let session_id = waiter.session_id;
        let fence = self.acquire(session_id);
        let mut completed = vec![(waiter.request, Ok(Value::Fence(fence)))];
        let mut reentered = 0;
        self.waiters.retain(|waiter| {
            if waiter.session_id == session_id {
                completed.push((waiter.request, Ok(Value::Fence(fence))));
                reentered += 1;
                false
            } else {
                true
            }
        });

        if let Some(owner) = &mut self.owner {
            owner.lock_count += reentered;
        }
        completed
    }

    fn acquire(&mut self, session_id: u64) -> u64 {
        assert!(self.owner.is_none());
        self.last_fence += 1;
        self.owner = Some(Owner {
            session_id,
            fence: self.last_fence,
            lock_count: 1,
        });
        self.last_fence
    }

    fn ownership(&self) -> LockOwnership {
        match &self.owner {
            Some(owner) => LockOwnership {
                fence: owner.fence,
                lock_count: owner.lock_count,
                session_id: Some(owner.session_id),
            },
            None => LockOwnership {
                fence: INVALID_FENCE,
                lock_count: 0,
                session_id: None,
            },
        }
    }
}

fn session_expired(session_id: u64) -> GroupResponse {
    Err(CpError::SessionExpired { session_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp::primitives::test_utils::request;

    fn lock(state: &mut FencedLockState, call_id: u64, session_id: u64, wait: bool) -> Outcome {
        state.apply(request(call_id), FencedLockOp::Lock { session_id, wait })
    }

    fn unlock(state: &mut FencedLockState, session_id: u64) -> Outcome {
        state.apply(request(0), FencedLockOp::Unlock { session_id })
    }

    #[test]
    fn fences_increase_per_acquisition() {
        let mut state = FencedLockState::default();

        assert_eq!(lock(&mut state, 1, 10, false), Outcome::value(Value::Fence(1)));
        // Reentrant: same fence, count goes up.
        assert_eq!(lock(&mut state, 2, 10, false), Outcome::value(Value::Fence(1)));
        assert_eq!(state.ownership().lock_count, 2);

        assert_eq!(unlock(&mut state, 10), Outcome::value(Value::None));
        assert!(state.ownership().is_locked_by(10));
        assert_eq!(unlock(&mut state, 10), Outcome::value(Value::None));
        assert!(!state.ownership().is_locked());

        assert_eq!(lock(&mut state, 3, 10, false), Outcome::value(Value::Fence(2)));
    }

    #[test]
    fn contended_try_lock_fails_without_waiting() {
        let mut state = FencedLockState::default();
        lock(&mut state, 1, 10, false);

        assert_eq!(lock(&mut state, 2, 20, false), Outcome::value(Value::Fence(INVALID_FENCE)));
        assert!(state.waiters.is_empty());
    }

    #[test]
    fn unlock_grants_waiters_in_order() {
        let mut state = FencedLockState::default();
        lock(&mut state, 1, 10, false);
        assert_eq!(lock(&mut state, 2, 20, true), Outcome::parked());
        assert_eq!(lock(&mut state, 3, 30, true), Outcome::parked());

        let outcome = unlock(&mut state, 10);
        assert_eq!(outcome.completed, vec![(request(2), Ok(Value::Fence(2)))]);
        assert!(state.ownership().is_locked_by(20));

        let outcome = unlock(&mut state, 20);
        assert_eq!(outcome.completed, vec![(request(3), Ok(Value::Fence(3)))]);
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let mut state = FencedLockState::default();
        assert!(matches!(
            unlock(&mut state, 10).response,
            Some(Err(CpError::IllegalState(_)))
        ));

        lock(&mut state, 1, 10, false);
        assert!(matches!(
            unlock(&mut state, 20).response,
            Some(Err(CpError::IllegalState(_)))
        ));
    }

    #[test]
    fn released_session_hands_lock_to_next_waiter() {
        let mut state = FencedLockState::default();
        lock(&mut state, 1, 10, false);
        lock(&mut state, 2, 10, false);
        lock(&mut state, 3, 20, true);
        lock(&mut state, 4, 30, true);

        let completed = state.release_session(10);
        assert_eq!(completed, vec![(request(3), Ok(Value::Fence(2)))]);
        assert_eq!(state.ownership().lock_count, 1);

        // Session 30's wait is dropped with it.
        let completed = state.release_session(30);
        assert_eq!(completed, vec![(request(4), session_expired(30))]);
        assert!(state.ownership().is_locked_by(20));
    }

    #[test]
    fn queued_waits_of_new_owner_reenter() {
        let mut state = FencedLockState::default();
        lock(&mut state, 1, 10, false);
        lock(&mut state, 2, 20, true);
        lock(&mut state, 3, 30, true);
        lock(&mut state, 4, 20, true);

        let outcome = unlock(&mut state, 10);
        assert_eq!(
            outcome.completed,
            vec![(request(2), Ok(Value::Fence(2))), (request(4), Ok(Value::Fence(2)))]
        );
        assert_eq!(state.ownership().lock_count, 2);
        assert_eq!(state.waiters.len(), 1);

        // Both holds must be released before session 30 gets the lock.
        assert!(unlock(&mut state, 20).completed.is_empty());
        let outcome = unlock(&mut state, 20);
        assert_eq!(outcome.completed, vec![(request(3), Ok(Value::Fence(3)))]);
    }

    #[test]
    fn cancelled_wait_is_not_granted() {
        let mut state = FencedLockState::default();
        lock(&mut state, 1, 10, false);
        lock(&mut state, 2, 20, true);

        assert!(state.cancel_wait(request(2)));
        assert!(!state.cancel_wait(request(2)));
        assert!(unlock(&mut state, 10).completed.is_empty());
    }
}
