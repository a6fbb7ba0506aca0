use crate::api::{CpError, ReferenceFunction};
use crate::cp::group::{GroupResponse, Value};
use crate::cp::primitives::AlterMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Values are compared by their serialized bytes. `None` is the null reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum AtomicReferenceOp {
    Get,
    Set(Option<Vec<u8>>),
    GetAndSet(Option<Vec<u8>>),
    CompareAndSet {
        expect: Option<Vec<u8>>,
        update: Option<Vec<u8>>,
    },
    Alter {
        function: String,
        mode: AlterMode,
    },
    // Answers the function's result without storing it.
    Apply {
        function: String,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct AtomicReferenceState {
    value: Option<Vec<u8>>,
}

impl AtomicReferenceState {
    pub(crate) fn apply(
        &mut self,
        op: AtomicReferenceOp,
        functions: &HashMap<String, ReferenceFunction>,
    ) -> GroupResponse {
        let value = match op {
            AtomicReferenceOp::Get => Value::Bytes(self.value.clone()),
            AtomicReferenceOp::Set(v) => {
                self.value = v;
                Value::None
            }
            AtomicReferenceOp::GetAndSet(v) => Value::Bytes(std::mem::replace(&mut self.value, v)),
            AtomicReferenceOp::CompareAndSet { expect, update } => {
                let matched = self.value == expect;
                if matched {
                    self.value = update;
                }
                Value::Bool(matched)
            }
            AtomicReferenceOp::Alter { function, mode } => {
                let function = lookup(functions, &function)?;
                let updated = function(self.value.as_deref());
                let previous = std::mem::replace(&mut self.value, updated);
                match mode {
                    AlterMode::Alter => Value::None,
                    AlterMode::AlterAndGet => Value::Bytes(self.value.clone()),
                    AlterMode::GetAndAlter => Value::Bytes(previous),
                }
            }
            AtomicReferenceOp::Apply { function } => {
                let function = lookup(functions, &function)?;
                Value::Bytes(function(self.value.as_deref()))
            }
        };
        Ok(value)
    }
}

fn lookup<'a>(functions: &'a HashMap<String, ReferenceFunction>, name: &str) -> Result<&'a ReferenceFunction, CpError> {
    functions
        .get(name)
        .ok_or_else(|| CpError::IllegalArgument(format!("No reference function registered as '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn functions() -> HashMap<String, ReferenceFunction> {
        let mut functions: HashMap<String, ReferenceFunction> = HashMap::new();
        functions.insert(
            "append-x".into(),
            Arc::new(|value: Option<&[u8]>| {
                let mut bytes = value.map(|v| v.to_vec()).unwrap_or_default();
                bytes.push(b'x');
                Some(bytes)
            }),
        );
        functions
    }

    #[test]
    fn operations() {
        let functions = functions();
        let mut state = AtomicReferenceState::default();
        let cases = vec![
            (AtomicReferenceOp::Get, Ok(Value::Bytes(None))),
            (
                AtomicReferenceOp::CompareAndSet {
                    expect: None,
                    update: Some(b"a".to_vec()),
                },
                Ok(Value::Bool(true)),
            ),
            (
                AtomicReferenceOp::CompareAndSet {
                    expect: None,
                    update: Some(b"b".to_vec()),
                },
                Ok(Value::Bool(false)),
            ),
            (
                AtomicReferenceOp::Alter {
                    function: "append-x".into(),
                    mode: AlterMode::AlterAndGet,
                },
                Ok(Value::Bytes(Some(b"ax".to_vec()))),
            ),
            (
                AtomicReferenceOp::Apply {
                    function: "append-x".into(),
                },
                Ok(Value::Bytes(Some(b"axx".to_vec()))),
            ),
            (
                AtomicReferenceOp::GetAndSet(None),
                Ok(Value::Bytes(Some(b"ax".to_vec()))),
            ),
            (
                AtomicReferenceOp::Apply {
                    function: "missing".into(),
                },
                Err(CpError::IllegalArgument(
                    "No reference function registered as 'missing'".into(),
                )),
            ),
        ];

        for (op, expected) in cases {
            assert_eq!(state.apply(op.clone(), &functions), expected, "{:?}", op);
        }
    }
}
