use crate::api::proxy::ProxyTarget;
use crate::api::{CpError, CpGroupId};
use crate::cp::{CountDownLatchOp, PrimitiveOp, Value};
use std::convert::TryFrom;
use tokio::time::Duration;

/// Replicated count down latch. Once the count reaches zero a new round can be started with
/// `try_set_count`.
#[derive(Clone)]
pub struct CountDownLatch {
    target: ProxyTarget,
}

impl CountDownLatch {
    pub(crate) fn new(target: ProxyTarget) -> Self {
        CountDownLatch { target }
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn group_id(&self) -> &CpGroupId {
        &self.target.group_id
    }

    /// Starts a new round with `count`. False while the current round is still counting.
    pub async fn try_set_count(&self, count: u32) -> Result<bool, CpError> {
        if count == 0 {
            return Err(CpError::IllegalArgument("Count must be positive".into()));
        }
        self.call(CountDownLatchOp::TrySetCount { count }).await?.into_bool()
    }

    pub async fn count_down(&self) -> Result<(), CpError> {
        // Bound to the round read here so a late retry never counts down the next round.
        let expected_round = self.get_round().await?;
        self.call(CountDownLatchOp::CountDown { expected_round })
            .await
            .map(|_| ())
    }

    pub async fn get_count(&self) -> Result<u32, CpError> {
        to_u32(self.call(CountDownLatchOp::GetCount).await?)
    }

    pub async fn get_round(&self) -> Result<u32, CpError> {
        to_u32(self.call(CountDownLatchOp::GetRound).await?)
    }

    /// Waits up to `timeout` for the count to reach zero. Returns whether it did.
    pub async fn wait(&self, timeout: Duration) -> Result<bool, CpError> {
        if timeout == Duration::from_millis(0) {
            return self.call(CountDownLatchOp::Await { wait: false }).await?.into_bool();
        }
        self.target
            .client
            .await_with_timeout(
                &self.target.group_id,
                &self.target.object,
                timeout,
                PrimitiveOp::CountDownLatch(CountDownLatchOp::Await { wait: true }),
            )
            .await?
            .into_bool()
    }

    async fn call(&self, op: CountDownLatchOp) -> Result<Value, CpError> {
        self.target.invoke(PrimitiveOp::CountDownLatch(op)).await
    }
}

fn to_u32(value: Value) -> Result<u32, CpError> {
    let count = value.into_count()?;
    u32::try_from(count).map_err(|_| CpError::Codec(format!("{} does not fit a latch count", count)))
}
