use crate::cp::group::{GroupResponse, Value};
use crate::cp::primitives::AlterMode;
use serde::{Deserialize, Serialize};

/// Pure functions an AtomicLong can be altered with. Arithmetic wraps on overflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LongFunction {
    Add(i64),
    Multiply(i64),
    Set(i64),
    Min(i64),
    Max(i64),
    Negate,
}

impl LongFunction {
    pub fn evaluate(self, value: i64) -> i64 {
        match self {
            LongFunction::Add(delta) => value.wrapping_add(delta),
            LongFunction::Multiply(factor) => value.wrapping_mul(factor),
            LongFunction::Set(v) => v,
            LongFunction::Min(v) => value.min(v),
            LongFunction::Max(v) => value.max(v),
            LongFunction::Negate => value.wrapping_neg(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum AtomicLongOp {
    Get,
    Set(i64),
    GetAndSet(i64),
    CompareAndSet { expect: i64, update: i64 },
    AddAndGet(i64),
    GetAndAdd(i64),
    Alter { function: LongFunction, mode: AlterMode },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct AtomicLongState {
    value: i64,
}

impl AtomicLongState {
    pub(crate) fn apply(&mut self, op: AtomicLongOp) -> GroupResponse {
        let value = match op {
            AtomicLongOp::Get => Value::Long(self.value),
            AtomicLongOp::Set(v) => {
                self.value = v;
                Value::None
            }
            AtomicLongOp::GetAndSet(v) => Value::Long(std::mem::replace(&mut self.value, v)),
            AtomicLongOp::CompareAndSet { expect, update } => {
                let matched = self.value == expect;
                if matched {
                    self.value = update;
                }
                Value::Bool(matched)
            }
            AtomicLongOp::AddAndGet(delta) => {
                self.value = self.value.wrapping_add(delta);
                Value::Long(self.value)
            }
            AtomicLongOp::GetAndAdd(delta) => {
                let previous = self.value;
                self.value = previous.wrapping_add(delta);
                Value::Long(previous)
            }
            AtomicLongOp::Alter { function, mode } => {
                let previous = self.value;
                self.value = function.evaluate(previous);
                match mode {
                    AlterMode::Alter => Value::None,
                    AlterMode::AlterAndGet => Value::Long(self.value),
                    AlterMode::GetAndAlter => Value::Long(previous),
                }
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations() {
        let mut state = AtomicLongState::default();
        let cases = vec![
            (AtomicLongOp::Get, Value::Long(0)),
            (AtomicLongOp::GetAndAdd(5), Value::Long(0)),
            (AtomicLongOp::AddAndGet(5), Value::Long(10)),
            (AtomicLongOp::CompareAndSet { expect: 3, update: 4 }, Value::Bool(false)),
            (AtomicLongOp::CompareAndSet { expect: 10, update: 4 }, Value::Bool(true)),
            (AtomicLongOp::GetAndSet(7), Value::Long(4)),
            (
                AtomicLongOp::Alter {
                    function: LongFunction::Multiply(3),
                    mode: AlterMode::AlterAndGet,
                },
                Value::Long(21),
            ),
            (
                AtomicLongOp::Alter {
                    function: LongFunction::Negate,
                    mode: AlterMode::GetAndAlter,
                },
                Value::Long(21),
            ),
            (
                AtomicLongOp::Alter {
                    function: LongFunction::Max(0),
                    mode: AlterMode::Alter,
                },
                Value::None,
            ),
            (AtomicLongOp::Get, Value::Long(0)),
            (AtomicLongOp::Set(i64::MAX), Value::None),
            (AtomicLongOp::AddAndGet(1), Value::Long(i64::MIN)),
        ];

        for (op, expected) in cases {
            assert_eq!(state.apply(op.clone()), Ok(expected), "{:?}", op);
        }
    }
}
