use crate::actor::WeakActorClient;
use crate::raft::election::timers::clock::{Clock, RealClock};
use crate::raft::election::timers::deadline::Deadline;
use crate::raft::{HeartbeatTick, Term};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// HeartbeatTimerHandle is held by a leader for each peer. The paired task asks the actor to
/// send AppendEntries to that peer whenever nothing was sent for a heartbeat duration.
pub(crate) struct HeartbeatTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    heartbeat_duration: Duration,
    deadline: Deadline,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    deadline: Deadline,
    actor_client: WeakActorClient,
    tick: HeartbeatTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: Uuid,
        term: Term,
    ) -> Self {
        let (task, handle) = HeartbeatTimerTask::new(heartbeat_duration, actor_client, peer_id, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerHandle<C> {
    /// Called whenever a request goes out to the peer, postponing the next heartbeat.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.push_back_deadline();
    }
}

impl<C: Clock> Shared<C> {
    fn push_back_deadline(&self) {
        let next: Instant = self.clock.now() + self.heartbeat_duration;
        self.deadline.push_back_to(next);
    }
}

impl<C: Clock> HeartbeatTimerTask<C> {
    fn new(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: Uuid,
        term: Term,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let deadline = Deadline::new();
        let shared = Arc::new(Shared {
            heartbeat_duration,
            deadline: deadline.clone(),
            clock: clock.clone(),
        });

        let task = HeartbeatTimerTask {
            weak_shared: Arc::downgrade(&shared),
            deadline,
            actor_client,
            tick: HeartbeatTick { peer_id, term },
            clock,
        };

        (task, HeartbeatTimerHandle { shared })
    }

    async fn run(mut self) {
        // The deadline starts empty, so the first iteration ticks right away. A newly elected
        // leader announces itself to every peer without waiting a heartbeat duration.
        loop {
            match self.deadline.take() {
                Some(wake_time) => self.clock.sleep_until(wake_time).await,
                None => match self.weak_shared.upgrade() {
                    Some(shared) => {
                        if self.actor_client.heartbeat_due(self.tick.clone()).await.is_err() {
                            return;
                        }
                        shared.push_back_deadline();
                    }
                    // No longer leader of this term, or the peer left the group.
                    None => return,
                },
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
    async fn heartbeat_timer_lifecycle() {
        let heartbeat = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut controller) = clock::mocked_clock();

        let peer_id = Uuid::new_v4();
        let term = Term::new(10);
        let expected = HeartbeatTick { peer_id, term };

        let (task, handle) = HeartbeatTimerTask::new(heartbeat, strong_actor_client.weak(), peer_id, term, mock_clock);
        let join_handle = tokio::task::spawn(task.run());

        // Immediate first tick.
        actor.assert_heartbeat_event(expected.clone()).await;
        actor.assert_no_event().await;

        for _ in 0..5 {
            controller.advance(heartbeat);
            actor.assert_heartbeat_event(expected.clone()).await;
            actor.assert_no_event().await;
        }

        // A big leap still produces a single tick.
        controller.advance(heartbeat * 5);
        actor.assert_heartbeat_event(expected.clone()).await;
        actor.assert_no_event().await;

        drop(handle);
        controller.advance(heartbeat);
        join_handle.await.unwrap();
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn heartbeat_timer_postponed_by_traffic() {
        let heartbeat = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut controller) = clock::mocked_clock();

        let peer_id = Uuid::new_v4();
        let term = Term::new(3);
        let expected = HeartbeatTick { peer_id, term };

        let (task, handle) = HeartbeatTimerTask::new(heartbeat, strong_actor_client.weak(), peer_id, term, mock_clock);
        tokio::task::spawn(task.run());
        actor.assert_heartbeat_event(expected.clone()).await;

        for _ in 0..5 {
            controller.advance(heartbeat / 2);
            handle.reset_heartbeat_timer();
        }
        actor.assert_no_event().await;
        assert_eq!(controller.elapsed(), heartbeat * 5 / 2);

        // Last traffic at T=2.5 moves the next tick to T=3.5.
        controller.advance(heartbeat / 2);
        actor.assert_no_event().await;
        controller.advance(heartbeat / 2);
        actor.assert_heartbeat_event(expected).await;
        assert_eq!(controller.elapsed(), heartbeat * 7 / 2);
    }
}
