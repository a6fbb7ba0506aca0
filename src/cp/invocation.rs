use crate::api::{CpError, CpGroupId, CpMember};
use crate::cp::group::{decode_response, GroupCommand, GroupResponse};
use crate::cp::metadata::{decode_metadata_response, MetadataCommand, MetadataResponse};
use crate::cp::operation::{decode, encode, InvokeResult, Operation};
use crate::cp::view::MetadataView;
use crate::grpc::ProtoInvokeReq;
use crate::transport::RaftTransport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};
use tonic::Code;

/// How long a call may wait for the group to answer, excluding time parked on a primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wait {
    Bounded,
    // Lock and semaphore waits park at the leader until granted or cancelled.
    Parked,
}

/// InvocationManager gets a command committed by the leader of a CP group. It tracks who it
/// believes each leader is and retries through leader changes until the operation timeout.
/// Retries are safe because every command that is not naturally idempotent carries a request id
/// the group deduplicates on.
pub(crate) struct InvocationManager {
    logger: slog::Logger,
    transport: Arc<dyn RaftTransport>,
    view: Arc<MetadataView>,
    leaders: Mutex<HashMap<CpGroupId, CpMember>>,
    operation_timeout: Duration,
    retry_backoff: Duration,
}

impl InvocationManager {
    pub(crate) fn new(
        logger: slog::Logger,
        transport: Arc<dyn RaftTransport>,
        view: Arc<MetadataView>,
        operation_timeout: Duration,
        retry_backoff: Duration,
    ) -> Self {
        InvocationManager {
            logger,
            transport,
            view,
            leaders: Mutex::new(HashMap::new()),
            operation_timeout,
            retry_backoff,
        }
    }

    pub(crate) fn view(&self) -> &Arc<MetadataView> {
        &self.view
    }

    pub(crate) async fn invoke_group(&self, group_id: &CpGroupId, command: &GroupCommand, wait: Wait) -> GroupResponse {
        let command = encode(command)?;
        let bytes = self
            .on_leader(group_id, wait, || Operation::Submit {
                group_id: group_id.clone(),
                command: command.clone(),
            })
            .await?;
        decode_response(&bytes)
    }

    pub(crate) async fn invoke_metadata(&self, command: &MetadataCommand) -> MetadataResponse {
        let metadata = self.view.metadata_group().ok_or(CpError::DiscoveryIncomplete)?;
        let command = encode(command)?;
        let bytes = self
            .on_leader(&metadata.group_id, Wait::Bounded, || Operation::Submit {
                group_id: metadata.group_id.clone(),
                command: command.clone(),
            })
            .await?;
        decode_metadata_response(&bytes)
    }

    pub(crate) async fn change_membership(&self, group_id: &CpGroupId, members: Vec<CpMember>) -> Result<(), CpError> {
        self.on_leader(group_id, Wait::Bounded, || Operation::ChangeMembership {
            group_id: group_id.clone(),
            members: members.clone(),
        })
        .await
        .map(|_| ())
    }

    /// Sends a single operation to a single member. No retries.
    pub(crate) async fn send(&self, member: &CpMember, operation: &Operation) -> Result<InvokeResult, CpError> {
        let payload = encode(operation)?;
        let attempt = self.transport.invoke(member, ProtoInvokeReq { payload });
        let response = tokio::time::timeout(self.operation_timeout, attempt)
            .await
            .map_err(|_| CpError::OperationTimeout(format!("{:?} to {}", operation, member.uuid())))??;
        decode(&response.payload)
    }

    async fn on_leader<F>(&self, group_id: &CpGroupId, wait: Wait, operation: F) -> Result<Vec<u8>, CpError>
    where
        F: Fn() -> Operation,
    {
        let mut deadline = Instant::now() + self.operation_timeout;
        let mut maybe_committed = false;
        let mut rotation = 0usize;
        let mut target = self.cached_leader(group_id);

        loop {
            if self.view.is_destroyed(group_id) {
                self.forget_leader(group_id);
                return Err(CpError::GroupDestroyed(group_id.clone()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.give_up(group_id, maybe_committed));
            }

            let member = match target.take() {
                Some(member) => member,
                None => match self.view.members_of(group_id) {
                    Some(members) if !members.is_empty() => {
                        rotation += 1;
                        members[rotation % members.len()].clone()
                    }
                    _ => {
                        self.view.request_refresh();
                        self.backoff(deadline).await;
                        continue;
                    }
                },
            };

            let attempt = self.transport.invoke(
                &member,
                ProtoInvokeReq {
                    payload: encode(&operation())?,
                },
            );
            let reply = match wait {
                Wait::Parked => attempt.await,
                Wait::Bounded => match tokio::time::timeout(deadline - now, attempt).await {
                    Ok(reply) => reply,
                    // Still pending on a leader that cannot commit.
                    Err(_) => return Err(self.give_up(group_id, maybe_committed)),
                },
            };

            let result = match reply {
                Ok(response) => decode::<InvokeResult>(&response.payload)?,
                Err(status) => {
                    // Unavailable means the request never left. Anything else and it may have run.
                    if status.code() != Code::Unavailable {
                        maybe_committed = true;
                    }
                    slog::debug!(self.logger, "Invocation on {} via {} failed: {:?}", group_id, member.uuid(), status);
                    self.forget_leader(group_id);
                    self.backoff(deadline).await;
                    continue;
                }
            };

            match result {
                InvokeResult::Ok(bytes) => {
                    self.remember_leader(group_id, &member);
                    return Ok(bytes);
                }
                InvokeResult::NotLeader { leader } => {
                    self.forget_leader(group_id);
                    target = leader.filter(|leader| leader.uuid() != member.uuid());
                    if target.is_none() {
                        self.backoff(deadline).await;
                    }
                }
                InvokeResult::LeaderChanged { leader } => {
                    maybe_committed = true;
                    self.forget_leader(group_id);
                    target = leader.filter(|leader| leader.uuid() != member.uuid());
                    if wait == Wait::Parked {
                        // The wait itself is not bounded here, only finding the next leader is.
                        deadline = Instant::now() + self.operation_timeout;
                    }
                    self.backoff(deadline).await;
                }
                InvokeResult::MembershipChangeInProgress => self.backoff(deadline).await,
                InvokeResult::GroupNotFound => {
                    // The member may not have created its node yet, or no longer hosts the group.
                    self.forget_leader(group_id);
                    self.view.request_refresh();
                    self.backoff(deadline).await;
                }
                InvokeResult::GroupDestroyed => {
                    self.forget_leader(group_id);
                    return Err(CpError::GroupDestroyed(group_id.clone()));
                }
                InvokeResult::Failed(e) => return Err(e),
            }
        }
    }

    fn give_up(&self, group_id: &CpGroupId, maybe_committed: bool) -> CpError {
        slog::warn!(self.logger, "Giving up on {} after {:?}", group_id, self.operation_timeout);
        if maybe_committed {
            CpError::Indeterminate(format!("Command to {} may or may not have been committed", group_id))
        } else {
            CpError::GroupUnavailable(group_id.clone())
        }
    }

    async fn backoff(&self, deadline: Instant) {
        let until = std::cmp::min(Instant::now() + self.retry_backoff, deadline);
        tokio::time::sleep_until(until).await;
    }

    fn cached_leader(&self, group_id: &CpGroupId) -> Option<CpMember> {
        self.lock().get(group_id).cloned()
    }

    fn remember_leader(&self, group_id: &CpGroupId, leader: &CpMember) {
        self.lock().insert(group_id.clone(), leader.clone());
    }

    fn forget_leader(&self, group_id: &CpGroupId) {
        self.lock().remove(group_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CpGroupId, CpMember>> {
        match self.leaders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
