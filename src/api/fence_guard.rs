use crate::api::CpError;
use std::sync::atomic::{AtomicU64, Ordering};

/// Helper for a resource guarded by a `FencedLock`. Every write presents the fence its writer
/// got from the lock; a fence lower than the highest one seen belongs to a holder that has since
/// lost the lock and is turned away.
#[derive(Debug, Default)]
pub struct FenceGuard {
    highest: AtomicU64,
}

impl FenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits `fence` if no newer fence has been seen, and remembers it.
    pub fn check(&self, fence: u64) -> Result<(), CpError> {
        if fence == 0 {
            return Err(CpError::IllegalArgument("0 is not a valid fence".into()));
        }
        let previous = self.highest.fetch_max(fence, Ordering::SeqCst);
        if fence < previous {
            return Err(CpError::StaleFenceToken {
                presented: fence,
                highest: previous,
            });
        }
        Ok(())
    }

    pub fn highest(&self) -> u64 {
        self.highest.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_fences_are_rejected() {
        let guard = FenceGuard::new();
        assert!(guard.check(1).is_ok());
        // The same holder keeps writing.
        assert!(guard.check(1).is_ok());
        assert!(guard.check(3).is_ok());
        assert_eq!(
            guard.check(2),
            Err(CpError::StaleFenceToken {
                presented: 2,
                highest: 3
            })
        );
        assert_eq!(guard.highest(), 3);
        assert!(matches!(guard.check(0), Err(CpError::IllegalArgument(_))));
    }
}
