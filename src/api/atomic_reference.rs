use crate::api::proxy::ProxyTarget;
use crate::api::{CpError, CpGroupId};
use crate::cp::{AlterMode, AtomicReferenceOp, PrimitiveOp, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Linearizable reference replicated in a CP group. Values are stored and compared in their
/// bincode form, so equality is equality of the serialized bytes. `None` is the null reference.
///
/// Functions passed to the alter and apply calls are looked up by name in
/// `CpOptions::reference_functions` and must be registered identically on every member.
pub struct AtomicReference<T> {
    target: ProxyTarget,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for AtomicReference<T> {
    fn clone(&self) -> Self {
        AtomicReference {
            target: self.target.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> AtomicReference<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(target: ProxyTarget) -> Self {
        AtomicReference {
            target,
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn group_id(&self) -> &CpGroupId {
        &self.target.group_id
    }

    pub async fn get(&self) -> Result<Option<T>, CpError> {
        decode(self.call(AtomicReferenceOp::Get).await?)
    }

    pub async fn set(&self, value: Option<&T>) -> Result<(), CpError> {
        self.call(AtomicReferenceOp::Set(encode(value)?)).await.map(|_| ())
    }

    pub async fn get_and_set(&self, value: Option<&T>) -> Result<Option<T>, CpError> {
        decode(self.call(AtomicReferenceOp::GetAndSet(encode(value)?)).await?)
    }

    pub async fn compare_and_set(&self, expect: Option<&T>, update: Option<&T>) -> Result<bool, CpError> {
        let op = AtomicReferenceOp::CompareAndSet {
            expect: encode(expect)?,
            update: encode(update)?,
        };
        self.call(op).await?.into_bool()
    }

    pub async fn is_null(&self) -> Result<bool, CpError> {
        Ok(self.call(AtomicReferenceOp::Get).await?.into_bytes()?.is_none())
    }

    pub async fn clear(&self) -> Result<(), CpError> {
        self.set(None).await
    }

    pub async fn contains(&self, value: Option<&T>) -> Result<bool, CpError> {
        let current = self.call(AtomicReferenceOp::Get).await?.into_bytes()?;
        Ok(current == encode(value)?)
    }

    pub async fn alter(&self, function: &str) -> Result<(), CpError> {
        self.alter_with(function, AlterMode::Alter).await.map(|_| ())
    }

    pub async fn alter_and_get(&self, function: &str) -> Result<Option<T>, CpError> {
        decode(self.alter_with(function, AlterMode::AlterAndGet).await?)
    }

    pub async fn get_and_alter(&self, function: &str) -> Result<Option<T>, CpError> {
        decode(self.alter_with(function, AlterMode::GetAndAlter).await?)
    }

    /// Result of `function` over the current value, decoded as `R`. Nothing is stored.
    pub async fn apply<R: DeserializeOwned>(&self, function: &str) -> Result<Option<R>, CpError> {
        let op = AtomicReferenceOp::Apply {
            function: function.to_string(),
        };
        decode(self.call(op).await?)
    }

    async fn alter_with(&self, function: &str, mode: AlterMode) -> Result<Value, CpError> {
        let op = AtomicReferenceOp::Alter {
            function: function.to_string(),
            mode,
        };
        self.call(op).await
    }

    async fn call(&self, op: AtomicReferenceOp) -> Result<Value, CpError> {
        self.target.invoke(PrimitiveOp::AtomicReference(op)).await
    }
}

fn encode<T: Serialize>(value: Option<&T>) -> Result<Option<Vec<u8>>, CpError> {
    value
        .map(|v| bincode::serialize(v).map_err(CpError::from))
        .transpose()
}

fn decode<R: DeserializeOwned>(value: Value) -> Result<Option<R>, CpError> {
    value
        .into_bytes()?
        .map(|bytes| bincode::deserialize(&bytes).map_err(CpError::from))
        .transpose()
}
