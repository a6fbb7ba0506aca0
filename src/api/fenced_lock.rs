use crate::api::proxy::ProxyTarget;
use crate::api::{CpError, CpGroupId};
use crate::cp::{FencedLockOp, LockOwnership, PrimitiveKind, PrimitiveOp, Value, Wait, INVALID_FENCE};
use tokio::time::Duration;

/// Reentrant lock held by this endpoint's session in the group. Every acquisition from the
/// unlocked state hands out a fence strictly greater than any before it, so a resource guarded
/// by the lock can turn away writes carrying an older fence (see `FenceGuard`).
///
/// A lock whose holder's session ends is released and granted to the next waiter.
#[derive(Clone)]
pub struct FencedLock {
    target: ProxyTarget,
}

impl FencedLock {
    pub(crate) fn new(target: ProxyTarget) -> Self {
        FencedLock { target }
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn group_id(&self) -> &CpGroupId {
        &self.target.group_id
    }

    /// Waits as long as it takes for the lock. Returns the fence.
    pub async fn lock(&self) -> Result<u64, CpError> {
        let fence = self
            .with_session(Wait::Parked, |session_id| FencedLockOp::Lock { session_id, wait: true })
            .await?
            .into_fence()?;
        if fence == INVALID_FENCE {
            return Err(CpError::IllegalState(format!("Lock {} was not granted", self.target.name)));
        }
        Ok(fence)
    }

    /// Takes the lock only if it is free or already held by this session.
    pub async fn try_lock(&self) -> Result<Option<u64>, CpError> {
        let fence = self
            .with_session(Wait::Bounded, |session_id| FencedLockOp::Lock { session_id, wait: false })
            .await?
            .into_fence()?;
        Ok(valid(fence))
    }

    /// Waits up to `timeout` for the lock. A timed out wait leaves nothing queued.
    pub async fn try_lock_for(&self, timeout: Duration) -> Result<Option<u64>, CpError> {
        if timeout == Duration::from_millis(0) {
            return self.try_lock().await;
        }
        let fence = self
            .target
            .client
            .invoke_with_timeout(
                &self.target.group_id,
                &self.target.object,
                PrimitiveKind::FencedLock,
                timeout,
                |session_id| PrimitiveOp::FencedLock(FencedLockOp::Lock { session_id, wait: true }),
            )
            .await?
            .into_fence()?;
        Ok(valid(fence))
    }

    pub async fn unlock(&self) -> Result<(), CpError> {
        if self.target.client.session(&self.target.group_id).is_none() {
            return Err(not_owner());
        }
        self.with_session(Wait::Bounded, |session_id| FencedLockOp::Unlock { session_id })
            .await
            .map(|_| ())
    }

    /// The fence of the current hold. Fails unless this session holds the lock.
    pub async fn get_fence(&self) -> Result<u64, CpError> {
        let ownership = self.ownership().await?;
        match self.target.client.session(&self.target.group_id) {
            Some(session_id) if ownership.is_locked_by(session_id) => Ok(ownership.fence),
            _ => Err(not_owner()),
        }
    }

    pub async fn is_locked(&self) -> Result<bool, CpError> {
        Ok(self.ownership().await?.is_locked())
    }

    pub async fn is_locked_by_current_session(&self) -> Result<bool, CpError> {
        let ownership = self.ownership().await?;
        Ok(self
            .target
            .client
            .session(&self.target.group_id)
            .map(|session_id| ownership.is_locked_by(session_id))
            .unwrap_or(false))
    }

    /// Reentrant hold count, whoever holds it.
    pub async fn get_lock_count(&self) -> Result<u32, CpError> {
        Ok(self.ownership().await?.lock_count)
    }

    async fn ownership(&self) -> Result<LockOwnership, CpError> {
        self.target
            .invoke(PrimitiveOp::FencedLock(FencedLockOp::GetOwnership))
            .await?
            .into_lock_ownership()
    }

    async fn with_session<F>(&self, wait: Wait, op: F) -> Result<Value, CpError>
    where
        F: FnOnce(u64) -> FencedLockOp,
    {
        let request = self.target.client.next_request();
        self.target
            .client
            .invoke_with_session(&self.target.group_id, &self.target.object, request, wait, |session_id| {
                PrimitiveOp::FencedLock(op(session_id))
            })
            .await
    }
}

fn valid(fence: u64) -> Option<u64> {
    if fence == INVALID_FENCE {
        None
    } else {
        Some(fence)
    }
}

fn not_owner() -> CpError {
    CpError::IllegalState("Current session is not the owner of the lock".into())
}
