use crate::api::{CpError, CpGroupId};
use crate::cp::group::{GroupCommand, RequestId, Value};
use crate::cp::group_manager::CpGroupManager;
use crate::cp::invocation::{InvocationManager, Wait};
use crate::cp::primitives::{PrimitiveKind, PrimitiveOp};
use crate::cp::session_manager::SessionManager;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Duration;

/// CpClient is what every primitive proxy talks through. It resolves group names, attaches this
/// endpoint's session to session-bound operations, and gives each call its request id.
#[derive(Clone)]
pub(crate) struct CpClient {
    groups: Arc<CpGroupManager>,
    invocation: Arc<InvocationManager>,
    sessions: Arc<SessionManager>,
}

impl CpClient {
    pub(crate) fn new(
        groups: Arc<CpGroupManager>,
        invocation: Arc<InvocationManager>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        CpClient {
            groups,
            invocation,
            sessions,
        }
    }

    pub(crate) async fn resolve_group(&self, name: &str) -> Result<CpGroupId, CpError> {
        Ok(self.groups.get_or_create_group(name).await?.id().clone())
    }

    pub(crate) fn next_request(&self) -> RequestId {
        self.sessions.next_request()
    }

    pub(crate) fn session(&self, group_id: &CpGroupId) -> Option<u64> {
        self.sessions.session(group_id)
    }

    /// Runs an operation that needs no session.
    pub(crate) async fn invoke(&self, group_id: &CpGroupId, object: &str, op: PrimitiveOp) -> Result<Value, CpError> {
        let command = GroupCommand::Invoke {
            request: self.next_request(),
            object: object.to_string(),
            op,
        };
        self.invocation.invoke_group(group_id, &command, Wait::Bounded).await
    }

    /// Runs an operation on behalf of this endpoint's session in the group, creating the session
    /// if there is none. A session found expired is dropped so the next call starts a new one.
    pub(crate) async fn invoke_with_session<F>(
        &self,
        group_id: &CpGroupId,
        object: &str,
        request: RequestId,
        wait: Wait,
        op: F,
    ) -> Result<Value, CpError>
    where
        F: FnOnce(u64) -> PrimitiveOp,
    {
        let session_id = self.sessions.get_or_create_session(group_id).await?;
        let command = GroupCommand::Invoke {
            request,
            object: object.to_string(),
            op: op(session_id),
        };
        let result = self.invocation.invoke_group(group_id, &command, wait).await;
        if let Err(CpError::SessionExpired { session_id: expired }) = &result {
            self.sessions.invalidate(group_id, *expired);
        }
        result
    }

    /// Parks a session-bound call for up to `timeout`, then withdraws it.
    pub(crate) async fn invoke_with_timeout<F>(
        &self,
        group_id: &CpGroupId,
        object: &str,
        kind: PrimitiveKind,
        timeout: Duration,
        op: F,
    ) -> Result<Value, CpError>
    where
        F: FnOnce(u64) -> PrimitiveOp,
    {
        let request = self.next_request();
        let call = self.invoke_with_session(group_id, object, request, Wait::Parked, op);
        self.withdraw_after(group_id, object, kind, request, timeout, call).await
    }

    /// Same as `invoke_with_timeout` for waits that need no session.
    pub(crate) async fn await_with_timeout(
        &self,
        group_id: &CpGroupId,
        object: &str,
        timeout: Duration,
        op: PrimitiveOp,
    ) -> Result<Value, CpError> {
        let request = self.next_request();
        let kind = op.kind();
        let command = GroupCommand::Invoke {
            request,
            object: object.to_string(),
            op,
        };
        let call = self.invocation.invoke_group(group_id, &command, Wait::Parked);
        self.withdraw_after(group_id, object, kind, request, timeout, call).await
    }

    // The answer is the call's outcome either way: granted before the withdrawal landed, or the
    // kind's timeout value.
    async fn withdraw_after<C>(
        &self,
        group_id: &CpGroupId,
        object: &str,
        kind: PrimitiveKind,
        request: RequestId,
        timeout: Duration,
        call: C,
    ) -> Result<Value, CpError>
    where
        C: Future<Output = Result<Value, CpError>>,
    {
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let command = GroupCommand::CancelWait {
                    request: self.next_request(),
                    target: request,
                    kind,
                    object: object.to_string(),
                };
                self.invocation.invoke_group(group_id, &command, Wait::Bounded).await
            }
        }
    }

    pub(crate) async fn invoke_group(&self, group_id: &CpGroupId, command: GroupCommand) -> Result<Value, CpError> {
        self.invocation.invoke_group(group_id, &command, Wait::Bounded).await
    }
}
