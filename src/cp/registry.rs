use crate::api::{CpError, CpGroupId, CpMember, CpOptionsValidated};
use crate::cp::group::{GroupCommand, GroupStateMachine};
use crate::cp::metadata::{is_metadata_group_name, metadata_seed_of, MetadataStateMachine};
use crate::cp::operation::{InvokeResult, Operation};
use crate::raft::{
    spawn_raft_node, ChangeMembershipInput, ElectionStateSnapshot, RaftNodeHandle, StateMachine, SubmitError,
    SubmitInput,
};
use crate::transport::RaftTransport;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

struct LocalNode {
    handle: RaftNodeHandle,
    session_expiry: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Nodes {
    running: HashMap<CpGroupId, LocalNode>,
    // Groups destroyed while this member hosted them. Never hosted again.
    tombstones: HashSet<CpGroupId>,
    // Groups created under an older metadata seed were wiped by a reset.
    retired_before: u64,
}

impl Nodes {
    fn is_gone(&self, group_id: &CpGroupId) -> bool {
        self.tombstones.contains(group_id) || metadata_seed_of(group_id) < self.retired_before
    }
}

/// RaftNodeRegistry owns every RaftNode this member runs, one per CP group it belongs to.
pub(crate) struct RaftNodeRegistry {
    logger: slog::Logger,
    me: CpMember,
    transport: Arc<dyn RaftTransport>,
    options: CpOptionsValidated,
    nodes: Mutex<Nodes>,
}

impl RaftNodeRegistry {
    pub(crate) fn new(
        logger: slog::Logger,
        me: CpMember,
        transport: Arc<dyn RaftTransport>,
        options: CpOptionsValidated,
    ) -> Self {
        RaftNodeRegistry {
            logger,
            me,
            transport,
            options,
            nodes: Mutex::new(Nodes::default()),
        }
    }

    pub(crate) fn node(&self, group_id: &CpGroupId) -> Result<RaftNodeHandle, CpError> {
        let nodes = self.lock();
        if let Some(node) = nodes.running.get(group_id) {
            return Ok(node.handle.clone());
        }
        if nodes.is_gone(group_id) {
            return Err(CpError::GroupDestroyed(group_id.clone()));
        }
        Err(CpError::GroupNotFound(group_id.to_string()))
    }

    pub(crate) fn group_ids(&self) -> Vec<CpGroupId> {
        self.lock().running.keys().cloned().collect()
    }

    pub(crate) fn is_leader_of(&self, group_id: &CpGroupId) -> bool {
        self.node(group_id)
            .map(|node| node.election_state() == ElectionStateSnapshot::Leader)
            .unwrap_or(false)
    }

    /// Starts a RaftNode for `group_id` unless one is running or the group was destroyed here.
    pub(crate) fn create_node(&self, group_id: &CpGroupId, members: Vec<CpMember>) -> Result<(), CpError> {
        let mut nodes = self.lock();
        if nodes.running.contains_key(group_id) {
            return Ok(());
        }
        if nodes.is_gone(group_id) {
            return Err(CpError::GroupDestroyed(group_id.clone()));
        }

        let is_metadata = is_metadata_group_name(group_id.name());
        let state_machine: Box<dyn StateMachine> = if is_metadata {
            Box::new(MetadataStateMachine::new(self.logger.clone(), group_id.clone()))
        } else {
            Box::new(GroupStateMachine::new(
                self.logger.new(slog::o!("Group" => group_id.to_string())),
                self.options.reference_functions.clone(),
            ))
        };

        let handle = spawn_raft_node(
            self.logger.clone(),
            group_id.clone(),
            self.me.clone(),
            members,
            state_machine,
            self.transport.clone(),
            self.options.raft_node_options(),
        )
        .map_err(|e| CpError::IllegalState(format!("Failed to create RaftNode for {}: {}", group_id, e)))?;

        let session_expiry = if is_metadata {
            None
        } else {
            Some(tokio::spawn(drive_session_expiry(
                self.logger.clone(),
                handle.clone(),
                self.options.session_heartbeat_interval,
            )))
        };

        slog::info!(self.logger, "Created RaftNode for {}", group_id);
        nodes.running.insert(group_id.clone(), LocalNode { handle, session_expiry });
        Ok(())
    }

    pub(crate) async fn destroy_node(&self, group_id: &CpGroupId) {
        let node = {
            let mut nodes = self.lock();
            nodes.tombstones.insert(group_id.clone());
            nodes.running.remove(group_id)
        };
        if let Some(node) = node {
            slog::info!(self.logger, "Destroying RaftNode for {}", group_id);
            terminate(node).await;
        }
    }

    /// Stops the local node of a group that lives on without this member.
    pub(crate) async fn leave_node(&self, group_id: &CpGroupId) {
        let node = self.lock().running.remove(group_id);
        if let Some(node) = node {
            slog::info!(self.logger, "Leaving {}", group_id);
            terminate(node).await;
        }
    }

    /// Terminates every node. Nothing created before `metadata_seed` runs here again.
    pub(crate) async fn reset(&self, metadata_seed: u64) {
        let nodes: Vec<LocalNode> = {
            let mut nodes = self.lock();
            nodes.retired_before = nodes.retired_before.max(metadata_seed);
            let retired: Vec<CpGroupId> = nodes.running.keys().cloned().collect();
            nodes.tombstones.extend(retired);
            nodes.running.drain().map(|(_, node)| node).collect()
        };
        slog::warn!(self.logger, "Terminating {} RaftNodes for CP Subsystem reset", nodes.len());
        for node in nodes {
            terminate(node).await;
        }
    }

    pub(crate) async fn shutdown(&self) {
        let nodes: Vec<LocalNode> = self.lock().running.drain().map(|(_, node)| node).collect();
        for node in nodes {
            terminate(node).await;
        }
    }

    /// Runs a group-level operation against the local RaftNode.
    pub(crate) async fn execute(&self, operation: Operation) -> InvokeResult {
        match operation {
            Operation::Submit { group_id, command } => {
                let node = match self.node(&group_id) {
                    Ok(node) => node,
                    Err(e) => return missing_node(e),
                };
                let result = node
                    .actor_client()
                    .submit(SubmitInput {
                        data: Bytes::from(command),
                    })
                    .await;
                self.submit_result(&group_id, result.map(|output| output.response))
            }
            Operation::ChangeMembership { group_id, members } => {
                let node = match self.node(&group_id) {
                    Ok(node) => node,
                    Err(e) => return missing_node(e),
                };
                let result = node
                    .actor_client()
                    .change_membership(ChangeMembershipInput { members })
                    .await;
                self.submit_result(&group_id, result.map(|output| output.response))
            }
            Operation::CreateRaftNode { group_id, members } => match self.create_node(&group_id, members) {
                Ok(()) => InvokeResult::Ok(Vec::new()),
                Err(e) => missing_node(e),
            },
            Operation::DestroyRaftNode { group_id } => {
                self.destroy_node(&group_id).await;
                InvokeResult::Ok(Vec::new())
            }
            Operation::LeaveRaftNode { group_id } => {
                self.leave_node(&group_id).await;
                InvokeResult::Ok(Vec::new())
            }
            Operation::DescribeMetadata | Operation::Reset { .. } => InvokeResult::Failed(CpError::IllegalArgument(
                "Member-level operation sent to the node registry".into(),
            )),
        }
    }

    fn submit_result(&self, group_id: &CpGroupId, result: Result<Bytes, SubmitError>) -> InvokeResult {
        match result {
            Ok(response) => InvokeResult::Ok(response.to_vec()),
            Err(SubmitError::NotLeader { leader }) => InvokeResult::NotLeader { leader },
            Err(SubmitError::LeaderChanged { leader }) => InvokeResult::LeaderChanged { leader },
            Err(SubmitError::MembershipChangeInProgress) => InvokeResult::MembershipChangeInProgress,
            // Parked calls fail this way when the node stops. The command may have been appended.
            Err(SubmitError::Terminated) | Err(SubmitError::ActorExited) => {
                if self.lock().is_gone(group_id) {
                    InvokeResult::GroupDestroyed
                } else {
                    InvokeResult::LeaderChanged { leader: None }
                }
            }
            Err(SubmitError::LocalIoError(e)) => {
                InvokeResult::Failed(CpError::IllegalState(format!("{} failed to persist: {}", group_id, e)))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Nodes> {
        match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn terminate(node: LocalNode) {
    if let Some(task) = node.session_expiry {
        task.abort();
    }
    node.handle.actor_client().terminate().await;
}

fn missing_node(e: CpError) -> InvokeResult {
    match e {
        CpError::GroupDestroyed(_) => InvokeResult::GroupDestroyed,
        CpError::GroupNotFound(_) => InvokeResult::GroupNotFound,
        other => InvokeResult::Failed(other),
    }
}

/// While this member leads the group, periodically commits a sweep of expired sessions. The
/// leader's clock stamps every entry, so followers expire the same sessions at the same index.
async fn drive_session_expiry(logger: slog::Logger, node: RaftNodeHandle, interval: tokio::time::Duration) {
    let command = match bincode::serialize(&GroupCommand::ExpireSessions) {
        Ok(command) => Bytes::from(command),
        Err(e) => {
            slog::error!(logger, "Cannot encode session expiry command: {:?}", e);
            return;
        }
    };

    let mut ticks = tokio::time::interval(interval);
    loop {
        ticks.tick().await;
        if node.election_state() != ElectionStateSnapshot::Leader {
            continue;
        }
        match node
            .actor_client()
            .submit(SubmitInput { data: command.clone() })
            .await
        {
            Ok(_) | Err(SubmitError::NotLeader { .. }) | Err(SubmitError::LeaderChanged { .. }) => {}
            Err(SubmitError::Terminated) | Err(SubmitError::ActorExited) => return,
            Err(e) => slog::warn!(logger, "Session expiry sweep failed: {:?}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CpOptions;
    use crate::cp::metadata::{data_group_seed, METADATA_GROUP_NAME};
    use crate::transport::{LocalNetwork, LocalTransport};
    use std::convert::TryFrom;
    use uuid::Uuid;

    fn registry() -> (RaftNodeRegistry, CpMember) {
        let me = CpMember::new(Uuid::new_v4(), "127.0.0.1:5701".parse().unwrap());
        let options = CpOptionsValidated::try_from(CpOptions::default()).unwrap();
        let registry = RaftNodeRegistry::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            me.clone(),
            Arc::new(LocalTransport::new(me.uuid(), LocalNetwork::new())),
            options,
        );
        (registry, me)
    }

    #[tokio::test]
    async fn destroyed_groups_stay_destroyed() {
        let (registry, me) = registry();
        let group_id = CpGroupId::new("a", 1);
        let members = vec![me];

        assert_eq!(
            registry.node(&group_id).err(),
            Some(CpError::GroupNotFound(group_id.to_string()))
        );
        registry.create_node(&group_id, members.clone()).unwrap();
        registry.create_node(&group_id, members.clone()).unwrap();
        assert_eq!(registry.group_ids(), vec![group_id.clone()]);

        registry.destroy_node(&group_id).await;
        assert_eq!(
            registry.node(&group_id).err(),
            Some(CpError::GroupDestroyed(group_id.clone()))
        );
        assert_eq!(
            registry.create_node(&group_id, members.clone()),
            Err(CpError::GroupDestroyed(group_id.clone()))
        );

        // A new incarnation is a different group.
        registry.create_node(&CpGroupId::new("a", 2), members).unwrap();
        assert_eq!(
            registry
                .execute(Operation::DestroyRaftNode {
                    group_id: CpGroupId::new(METADATA_GROUP_NAME, 0)
                })
                .await,
            InvokeResult::Ok(Vec::new())
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn reset_retires_groups_of_older_seeds() {
        let (registry, me) = registry();
        let hosted = CpGroupId::new("a", data_group_seed(0, 3));
        let never_hosted = CpGroupId::new("b", data_group_seed(0, 5));
        let members = vec![me];
        registry.create_node(&hosted, members.clone()).unwrap();

        registry.reset(1).await;
        assert!(registry.group_ids().is_empty());
        assert_eq!(registry.node(&hosted).err(), Some(CpError::GroupDestroyed(hosted.clone())));
        assert_eq!(
            registry.create_node(&never_hosted, members.clone()),
            Err(CpError::GroupDestroyed(never_hosted.clone()))
        );
        assert_eq!(
            registry
                .execute(Operation::Submit {
                    group_id: hosted,
                    command: Vec::new(),
                })
                .await,
            InvokeResult::GroupDestroyed
        );

        let fresh = CpGroupId::new("a", data_group_seed(1, 3));
        registry.create_node(&fresh, members).unwrap();
        assert_eq!(registry.group_ids(), vec![fresh]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn submit_to_missing_group() {
        let (registry, _) = registry();
        let result = registry
            .execute(Operation::Submit {
                group_id: CpGroupId::new("a", 1),
                command: Vec::new(),
            })
            .await;
        assert_eq!(result, InvokeResult::GroupNotFound);
    }
}
