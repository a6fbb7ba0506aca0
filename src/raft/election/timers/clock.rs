#[cfg(test)]
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Clock abstracts the runtime timer so that timer tasks can be driven by hand in tests.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) fn mocked_clock() -> (MockClock, MockClockController) {
    let start = Instant::now();
    let (tx, rx) = watch::channel(start);

    (MockClock { now: rx }, MockClockController { now: tx, start })
}

/// MockClock only moves when its controller advances it.
#[cfg(test)]
#[derive(Clone)]
pub(crate) struct MockClock {
    now: watch::Receiver<Instant>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        while *self.now.borrow() < deadline {
            if self.now.changed().await.is_err() {
                // Controller is gone, time will never reach the deadline.
                futures::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) struct MockClockController {
    now: watch::Sender<Instant>,
    start: Instant,
}

#[cfg(test)]
impl MockClockController {
    pub(crate) fn now(&self) -> Instant {
        *self.now.borrow()
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.now() - self.start
    }

    /// Moves time forward. Sleepers wake once `now` is at or past their deadline, so advance in
    /// steps no larger than the granularity a test wants to observe.
    pub(crate) fn advance(&mut self, duration: Duration) {
        let next = self.now() + duration;
        let _ = self.now.send(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn mock_clock_ticks_only_when_advanced() {
        let tick = Duration::from_millis(500);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (mut clock, mut controller) = mocked_clock();
        let start = controller.now();

        tokio::spawn(async move {
            let mut wake_at = start;
            loop {
                wake_at += tick;
                clock.sleep_until(wake_at).await;
                if tx.send(()).is_err() {
                    return;
                }
            }
        });

        // Half-tick offset keeps every assertion away from a boundary.
        controller.advance(tick / 2);
        tokio::time::timeout(tick * 2, rx.recv())
            .await
            .expect_err("Expected timeout");

        controller.advance(tick);
        rx.recv().await.unwrap();
        tokio::time::timeout(tick * 2, rx.recv())
            .await
            .expect_err("Expected timeout");

        // One large jump releases every tick it covers.
        controller.advance(tick * 3);
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        tokio::time::timeout(tick * 2, rx.recv())
            .await
            .expect_err("Expected timeout");

        assert_eq!(controller.elapsed(), tick * 9 / 2);
    }
}
