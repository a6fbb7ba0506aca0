use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Deadline is the next instant a timer task should act at. The task takes the value each time
/// it wakes up; finding the slot empty means nobody pushed the deadline back while it slept.
#[derive(Clone, Default)]
pub(super) struct Deadline {
    slot: Arc<Mutex<Option<Instant>>>,
}

impl Deadline {
    pub(super) fn new() -> Self {
        Deadline::default()
    }

    pub(super) fn push_back_to(&self, instant: Instant) {
        self.slot
            .lock()
            .expect("Deadline.push_back_to() mutex guard poison")
            .replace(instant);
    }

    pub(super) fn take(&self) -> Option<Instant> {
        self.slot.lock().expect("Deadline.take() mutex guard poison").take()
    }
}

/// TaskGuard lives in a timer handle. Dropping it asks the paired timer task to exit.
pub(super) struct TaskGuard {
    dropped: Arc<AtomicBool>,
}

pub(super) struct GuardWatch {
    dropped: Arc<AtomicBool>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::Release);
    }
}

impl GuardWatch {
    pub(super) fn guard_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

pub(super) fn task_guard() -> (TaskGuard, GuardWatch) {
    let dropped = Arc::new(AtomicBool::new(false));

    (
        TaskGuard {
            dropped: dropped.clone(),
        },
        GuardWatch { dropped },
    )
}
