use crate::api::{CpError, CpSession};
use crate::cp::primitives::{LockOwnership, PrimitiveKind, PrimitiveOp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique per client call. Retries of the same call reuse it so the group can recognize them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct RequestId {
    pub(crate) endpoint: Uuid,
    pub(crate) call_id: u64,
}

/// Commands replicated through a data group's log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum GroupCommand {
    CreateSession {
        endpoint: Uuid,
        ttl_millis: u64,
    },
    HeartbeatSession {
        session_id: u64,
    },
    CloseSession {
        session_id: u64,
    },
    // Submitted periodically by every member hosting the group. Only the leader's gets in.
    ExpireSessions,
    GetSessions,
    Invoke {
        request: RequestId,
        object: String,
        op: PrimitiveOp,
    },
    CancelWait {
        request: RequestId,
        target: RequestId,
        kind: PrimitiveKind,
        object: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Value {
    None,
    Bool(bool),
    Long(i64),
    Count(u64),
    Fence(u64),
    Bytes(Option<Vec<u8>>),
    Session(CpSession),
    Sessions(Vec<CpSession>),
    LockOwnership(LockOwnership),
}

pub(crate) type GroupResponse = Result<Value, CpError>;

impl Value {
    pub(crate) fn into_bool(self) -> Result<bool, CpError> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(unexpected("Bool", &other)),
        }
    }

    pub(crate) fn into_long(self) -> Result<i64, CpError> {
        match self {
            Value::Long(v) => Ok(v),
            other => Err(unexpected("Long", &other)),
        }
    }

    pub(crate) fn into_count(self) -> Result<u64, CpError> {
        match self {
            Value::Count(v) => Ok(v),
            other => Err(unexpected("Count", &other)),
        }
    }

    pub(crate) fn into_fence(self) -> Result<u64, CpError> {
        match self {
            Value::Fence(v) => Ok(v),
            other => Err(unexpected("Fence", &other)),
        }
    }

    pub(crate) fn into_bytes(self) -> Result<Option<Vec<u8>>, CpError> {
        match self {
            Value::Bytes(v) => Ok(v),
            other => Err(unexpected("Bytes", &other)),
        }
    }

    pub(crate) fn into_session(self) -> Result<CpSession, CpError> {
        match self {
            Value::Session(v) => Ok(v),
            other => Err(unexpected("Session", &other)),
        }
    }

    pub(crate) fn into_sessions(self) -> Result<Vec<CpSession>, CpError> {
        match self {
            Value::Sessions(v) => Ok(v),
            other => Err(unexpected("Sessions", &other)),
        }
    }

    pub(crate) fn into_lock_ownership(self) -> Result<LockOwnership, CpError> {
        match self {
            Value::LockOwnership(v) => Ok(v),
            other => Err(unexpected("LockOwnership", &other)),
        }
    }
}

fn unexpected(expected: &str, actual: &Value) -> CpError {
    CpError::Codec(format!("Expected {} response, got {:?}", expected, actual))
}
