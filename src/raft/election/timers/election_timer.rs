use crate::actor::WeakActorClient;
use crate::raft::election::timers::clock::{Clock, RealClock};
use crate::raft::election::timers::deadline::{self, Deadline, GuardWatch, TaskGuard};
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::time::{Duration, Instant};

/// ElectionTimerHandle is held while a node is a follower or a candidate. Unless the deadline is
/// pushed back (by hearing from a leader) before it passes, the node is told to start an
/// election. Each push back picks a fresh random timeout from the configured range.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    deadline: Deadline,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
    _guard: TaskGuard,
}

struct ElectionTimerTask<C: Clock> {
    deadline: Deadline,
    actor_client: WeakActorClient,
    clock: C,
    guard_watch: GuardWatch,
    // Pause after notifying the actor, before checking the deadline again.
    retry_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        self.deadline.push_back_to(self.random_wake_time());
    }

    fn random_wake_time(&self) -> Instant {
        let jittered_timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.clock.now() + jittered_timeout
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let deadline = Deadline::new();
        let (guard, guard_watch) = deadline::task_guard();

        let task = ElectionTimerTask {
            deadline: deadline.clone(),
            actor_client,
            clock: clock.clone(),
            guard_watch,
            retry_backoff: min_timeout,
        };
        let handle = ElectionTimerHandle {
            deadline,
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock,
            _guard: guard,
        };

        // The task must find a deadline on its first iteration, otherwise it would time out the
        // moment it starts.
        handle.reset_timeout();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.deadline.take() {
                Some(wake_time) => self.clock.sleep_until(wake_time).await,
                None => {
                    // Slept through the whole timeout without hearing from a leader.
                    if self.guard_watch.guard_dropped() {
                        return;
                    }
                    if self.actor_client.election_timeout().await.is_err() {
                        return;
                    }
                    self.clock.sleep(self.retry_backoff).await;
                }
            }

            // The node left the follower/candidate state this handle belonged to.
            if self.guard_watch.guard_dropped() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::raft::election::timers::clock;
    use crate::raft::election::timers::test_utils::TestUtilActor;

    #[tokio::test]
    async fn election_timer_fires_only_after_a_quiet_timeout() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut controller) = clock::mocked_clock();

        // Jitter is not under test, so min and max are equal.
        let (task, handle) = ElectionTimerTask::new(timeout, timeout, strong_actor_client.weak(), mock_clock);
        tokio::task::spawn(task.run());
        actor.assert_no_event().await;

        // Heartbeats every half timeout keep the timer quiet.
        for _ in 0..5 {
            controller.advance(timeout / 2);
            handle.reset_timeout();
        }
        actor.assert_no_event().await;
        assert_eq!(controller.elapsed(), timeout * 5 / 2);

        // Last reset was at T=2.5, so nothing happens before T=3.5.
        let one_ns = Duration::from_nanos(1);
        controller.advance(timeout - one_ns);
        actor.assert_no_event().await;

        controller.advance(one_ns);
        actor.assert_election_timeout_event().await;
    }

    #[tokio::test]
    async fn election_timer_task_exits_when_handle_drops() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut controller) = clock::mocked_clock();

        let (task, handle) = ElectionTimerTask::new(timeout, timeout, strong_actor_client.weak(), mock_clock);
        let join_handle = tokio::task::spawn(task.run());
        drop(handle);

        controller.advance(timeout * 2);
        join_handle.await.unwrap();
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn election_timer_survives_reset_racing_a_timeout() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut controller) = clock::mocked_clock();

        let (task, handle) = ElectionTimerTask::new(timeout, timeout, strong_actor_client.weak(), mock_clock);
        tokio::task::spawn(task.run());
        actor.assert_no_event().await;

        // An AppendEntries can already be queued behind the timeout event, so a reset right after
        // a timeout must keep the timer working.
        controller.advance(timeout);
        actor.assert_election_timeout_event().await;
        handle.reset_timeout();

        for _ in 0..5 {
            controller.advance(timeout / 2);
            handle.reset_timeout();
        }
        actor.assert_no_event().await;
    }
}
