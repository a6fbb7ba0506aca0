use crate::api::proxy::ProxyTarget;
use crate::api::{CpError, CpGroupId};
use crate::cp::{AlterMode, AtomicLongOp, LongFunction, PrimitiveOp, Value};

/// Linearizable 64-bit counter replicated in a CP group.
#[derive(Clone)]
pub struct AtomicLong {
    target: ProxyTarget,
}

impl AtomicLong {
    pub(crate) fn new(target: ProxyTarget) -> Self {
        AtomicLong { target }
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn group_id(&self) -> &CpGroupId {
        &self.target.group_id
    }

    pub async fn get(&self) -> Result<i64, CpError> {
        self.call(AtomicLongOp::Get).await?.into_long()
    }

    pub async fn set(&self, value: i64) -> Result<(), CpError> {
        self.call(AtomicLongOp::Set(value)).await.map(|_| ())
    }

    pub async fn get_and_set(&self, value: i64) -> Result<i64, CpError> {
        self.call(AtomicLongOp::GetAndSet(value)).await?.into_long()
    }

    pub async fn compare_and_set(&self, expect: i64, update: i64) -> Result<bool, CpError> {
        self.call(AtomicLongOp::CompareAndSet { expect, update })
            .await?
            .into_bool()
    }

    pub async fn add_and_get(&self, delta: i64) -> Result<i64, CpError> {
        self.call(AtomicLongOp::AddAndGet(delta)).await?.into_long()
    }

    pub async fn get_and_add(&self, delta: i64) -> Result<i64, CpError> {
        self.call(AtomicLongOp::GetAndAdd(delta)).await?.into_long()
    }

    pub async fn increment_and_get(&self) -> Result<i64, CpError> {
        self.add_and_get(1).await
    }

    pub async fn decrement_and_get(&self) -> Result<i64, CpError> {
        self.add_and_get(-1).await
    }

    pub async fn get_and_increment(&self) -> Result<i64, CpError> {
        self.get_and_add(1).await
    }

    pub async fn get_and_decrement(&self) -> Result<i64, CpError> {
        self.get_and_add(-1).await
    }

    pub async fn alter(&self, function: LongFunction) -> Result<(), CpError> {
        self.alter_with(function, AlterMode::Alter).await.map(|_| ())
    }

    pub async fn alter_and_get(&self, function: LongFunction) -> Result<i64, CpError> {
        self.alter_with(function, AlterMode::AlterAndGet).await?.into_long()
    }

    pub async fn get_and_alter(&self, function: LongFunction) -> Result<i64, CpError> {
        self.alter_with(function, AlterMode::GetAndAlter).await?.into_long()
    }

    /// Result of `function` over the current value. The stored value does not change.
    pub async fn apply(&self, function: LongFunction) -> Result<i64, CpError> {
        let current = self.get().await?;
        Ok(function.evaluate(current))
    }

    async fn alter_with(&self, function: LongFunction, mode: AlterMode) -> Result<Value, CpError> {
        self.call(AtomicLongOp::Alter { function, mode }).await
    }

    async fn call(&self, op: AtomicLongOp) -> Result<Value, CpError> {
        self.target.invoke(PrimitiveOp::AtomicLong(op)).await
    }
}
