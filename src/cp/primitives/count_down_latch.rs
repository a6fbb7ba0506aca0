use crate::api::CpError;
use crate::cp::group::{RequestId, Value};
use crate::cp::primitives::Outcome;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum CountDownLatchOp {
    TrySetCount { count: u32 },
    // Ignored unless it targets the current round, so a retried count down from an earlier
    // round cannot leak into the next one.
    CountDown { expected_round: u32 },
    GetCount,
    GetRound,
    Await { wait: bool },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct CountDownLatchState {
    round: u32,
    remaining: u32,
    waiters: Vec<RequestId>,
}

impl CountDownLatchState {
    pub(crate) fn apply(&mut self, request: RequestId, op: CountDownLatchOp) -> Outcome {
        match op {
            CountDownLatchOp::TrySetCount { count } => self.try_set_count(count),
            CountDownLatchOp::CountDown { expected_round } => self.count_down(expected_round),
            CountDownLatchOp::GetCount => Outcome::value(Value::Count(u64::from(self.remaining))),
            CountDownLatchOp::GetRound => Outcome::value(Value::Count(u64::from(self.round))),
            CountDownLatchOp::Await { wait } => self.await_zero(request, wait),
        }
    }

    fn try_set_count(&mut self, count: u32) -> Outcome {
        if count == 0 {
            return Outcome::error(CpError::IllegalArgument("Count must be positive".into()));
        }
        // Rounds never overlap.
        if self.remaining > 0 {
            return Outcome::value(Value::Bool(false));
        }
        self.round += 1;
        self.remaining = count;
        Outcome::value(Value::Bool(true))
    }

    fn count_down(&mut self, expected_round: u32) -> Outcome {
        if expected_round > self.round {
            return Outcome::error(CpError::IllegalState(format!(
                "Round {} is ahead of the current round {}",
                expected_round, self.round
            )));
        }
        if expected_round < self.round || self.remaining == 0 {
            return Outcome::value(Value::Count(u64::from(self.remaining)));
        }

        self.remaining -= 1;
        let completed = if self.remaining == 0 {
            self.waiters
                .drain(..)
                .map(|request| (request, Ok(Value::Bool(true))))
                .collect()
        } else {
            Vec::new()
        };
        Outcome::value(Value::Count(u64::from(self.remaining))).with_completed(completed)
    }

    fn await_zero(&mut self, request: RequestId, wait: bool) -> Outcome {
        if self.remaining == 0 {
            return Outcome::value(Value::Bool(true));
        }
        if !wait {
            return Outcome::value(Value::Bool(false));
        }
        self.waiters.push(request);
        Outcome::parked()
    }

    pub(crate) fn cancel_wait(&mut self, request: RequestId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|waiter| *waiter != request);
        self.waiters.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp::primitives::test_utils::request;

    fn apply(state: &mut CountDownLatchState, op: CountDownLatchOp) -> Outcome {
        state.apply(request(0), op)
    }

    #[test]
    fn rounds() {
        let mut state = CountDownLatchState::default();
        assert_eq!(
            apply(&mut state, CountDownLatchOp::TrySetCount { count: 2 }),
            Outcome::value(Value::Bool(true))
        );
        assert_eq!(
            apply(&mut state, CountDownLatchOp::TrySetCount { count: 5 }),
            Outcome::value(Value::Bool(false))
        );
        assert_eq!(state.round, 1);

        apply(&mut state, CountDownLatchOp::CountDown { expected_round: 1 });
        apply(&mut state, CountDownLatchOp::CountDown { expected_round: 1 });
        // Floor of zero.
        assert_eq!(
            apply(&mut state, CountDownLatchOp::CountDown { expected_round: 1 }),
            Outcome::value(Value::Count(0))
        );

        assert_eq!(
            apply(&mut state, CountDownLatchOp::TrySetCount { count: 1 }),
            Outcome::value(Value::Bool(true))
        );
        assert_eq!(
            apply(&mut state, CountDownLatchOp::GetRound),
            Outcome::value(Value::Count(2))
        );

        // Stale round is ignored.
        assert_eq!(
            apply(&mut state, CountDownLatchOp::CountDown { expected_round: 1 }),
            Outcome::value(Value::Count(1))
        );
    }

    #[test]
    fn waiters_released_at_zero() {
        let mut state = CountDownLatchState::default();
        apply(&mut state, CountDownLatchOp::TrySetCount { count: 1 });

        assert_eq!(
            state.apply(request(7), CountDownLatchOp::Await { wait: false }),
            Outcome::value(Value::Bool(false))
        );
        assert_eq!(
            state.apply(request(8), CountDownLatchOp::Await { wait: true }),
            Outcome::parked()
        );

        let outcome = apply(&mut state, CountDownLatchOp::CountDown { expected_round: 1 });
        assert_eq!(outcome.completed, vec![(request(8), Ok(Value::Bool(true)))]);
        assert_eq!(
            state.apply(request(9), CountDownLatchOp::Await { wait: true }),
            Outcome::value(Value::Bool(true))
        );
    }

    #[test]
    fn invalid_count_rejected() {
        let mut state = CountDownLatchState::default();
        assert!(matches!(
            apply(&mut state, CountDownLatchOp::TrySetCount { count: 0 }).response,
            Some(Err(CpError::IllegalArgument(_)))
        ));
    }
}
