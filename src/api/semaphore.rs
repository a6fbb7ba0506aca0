use crate::api::proxy::ProxyTarget;
use crate::api::{CpError, CpGroupId};
use crate::cp::{PrimitiveKind, PrimitiveOp, SemaphoreOp, Value, Wait};
use tokio::time::Duration;

/// Replicated counting semaphore. Permits are held by this endpoint's session in the group and
/// return to the pool when the session ends. Waiters are served strictly in arrival order.
#[derive(Clone)]
pub struct Semaphore {
    target: ProxyTarget,
}

impl Semaphore {
    pub(crate) fn new(target: ProxyTarget) -> Self {
        Semaphore { target }
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn group_id(&self) -> &CpGroupId {
        &self.target.group_id
    }

    /// Sets the initial permit count. Only the first call has any effect.
    pub async fn init(&self, permits: u32) -> Result<bool, CpError> {
        self.target
            .invoke(PrimitiveOp::Semaphore(SemaphoreOp::Init { permits }))
            .await?
            .into_bool()
    }

    /// Waits as long as it takes for `permits`.
    pub async fn acquire(&self, permits: u32) -> Result<(), CpError> {
        check_permits(permits)?;
        let granted = self
            .with_session(Wait::Parked, |session_id| SemaphoreOp::Acquire {
                session_id,
                permits,
                wait: true,
            })
            .await?
            .into_bool()?;
        if granted {
            Ok(())
        } else {
            Err(CpError::IllegalState(format!("Acquire of {} permits was not granted", permits)))
        }
    }

    pub async fn try_acquire(&self, permits: u32) -> Result<bool, CpError> {
        check_permits(permits)?;
        self.with_session(Wait::Bounded, |session_id| SemaphoreOp::Acquire {
            session_id,
            permits,
            wait: false,
        })
        .await?
        .into_bool()
    }

    /// Waits up to `timeout` for `permits`. A timed out wait leaves nothing queued.
    pub async fn try_acquire_for(&self, permits: u32, timeout: Duration) -> Result<bool, CpError> {
        check_permits(permits)?;
        if timeout == Duration::from_millis(0) {
            return self.try_acquire(permits).await;
        }
        self.target
            .client
            .invoke_with_timeout(
                &self.target.group_id,
                &self.target.object,
                PrimitiveKind::Semaphore,
                timeout,
                |session_id| {
                    PrimitiveOp::Semaphore(SemaphoreOp::Acquire {
                        session_id,
                        permits,
                        wait: true,
                    })
                },
            )
            .await?
            .into_bool()
    }

    pub async fn release(&self, permits: u32) -> Result<(), CpError> {
        check_permits(permits)?;
        self.current_session()?;
        self.with_session(Wait::Bounded, |session_id| SemaphoreOp::Release { session_id, permits })
            .await
            .map(|_| ())
    }

    pub async fn available_permits(&self) -> Result<u64, CpError> {
        self.target
            .invoke(PrimitiveOp::Semaphore(SemaphoreOp::AvailablePermits))
            .await?
            .into_count()
    }

    /// Takes every available permit. Returns how many that was.
    pub async fn drain_permits(&self) -> Result<u64, CpError> {
        self.with_session(Wait::Bounded, |session_id| SemaphoreOp::Drain { session_id })
            .await?
            .into_count()
    }

    // Releasing without a session would release someone else's permits.
    fn current_session(&self) -> Result<u64, CpError> {
        self.target.client.session(&self.target.group_id).ok_or_else(|| {
            CpError::IllegalState(format!("No permits are held on {} by this endpoint", self.target.name))
        })
    }

    async fn with_session<F>(&self, wait: Wait, op: F) -> Result<Value, CpError>
    where
        F: FnOnce(u64) -> SemaphoreOp,
    {
        let request = self.target.client.next_request();
        self.target
            .client
            .invoke_with_session(&self.target.group_id, &self.target.object, request, wait, |session_id| {
                PrimitiveOp::Semaphore(op(session_id))
            })
            .await
    }
}

fn check_permits(permits: u32) -> Result<(), CpError> {
    if permits == 0 {
        return Err(CpError::IllegalArgument("Permits must be positive".into()));
    }
    Ok(())
}
