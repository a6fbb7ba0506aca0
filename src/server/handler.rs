use crate::api::{CpError, CpGroupId};
use crate::commitlog::Index;
use crate::cp::{decode, encode, InvokeResult, MetadataView, Operation, RaftNodeRegistry};
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResp, ProtoGroupId, ProtoInstallSnapshotReq, ProtoInstallSnapshotResp,
    ProtoInvokeReq, ProtoInvokeResp, ProtoRequestVoteReq, ProtoRequestVoteResp,
};
use crate::raft::{
    AppendEntriesError, AppendEntriesInput, EntryType, InstallSnapshotError, InstallSnapshotInput, RaftNodeHandle,
    RequestVoteError, RequestVoteInput, Term, WriteAheadLogEntry,
};
use crate::transport::{self, group_id_from_proto, log_entry_metadata_from_wire, uuid_from_wire};
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::Status;

/// MessageHandler is the receiving end of every member-to-member message, whichever network
/// carried it. Consensus messages go to the addressed group's RaftNode. Invocations run against
/// the node registry or this member's metadata view.
pub(crate) struct MessageHandler {
    logger: slog::Logger,
    registry: Arc<RaftNodeRegistry>,
    view: Arc<MetadataView>,
    resets: mpsc::UnboundedSender<u64>,
}

impl MessageHandler {
    pub(crate) fn new(
        logger: slog::Logger,
        registry: Arc<RaftNodeRegistry>,
        view: Arc<MetadataView>,
        resets: mpsc::UnboundedSender<u64>,
    ) -> Self {
        MessageHandler {
            logger,
            registry,
            view,
            resets,
        }
    }

    pub(crate) async fn handle_request_vote(
        &self,
        rpc_request: ProtoRequestVoteReq,
    ) -> Result<ProtoRequestVoteResp, Status> {
        let node = self.node(rpc_request.group_id.clone())?;
        let input = RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: uuid_from_wire(&rpc_request.candidate_id)?,
            candidate_last_log_entry: log_entry_metadata_from_wire(
                rpc_request.last_log_term,
                rpc_request.last_log_index,
            )?,
        };

        match node.actor_client().request_vote(input).await {
            Ok(output) => Ok(ProtoRequestVoteResp {
                term: output.term.as_u64(),
                granted: output.vote_granted,
            }),
            Err(RequestVoteError::Terminated) | Err(RequestVoteError::ActorExited) => {
                Err(Status::unavailable("RaftNode is not running"))
            }
        }
    }

    pub(crate) async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResp, Status> {
        let node = self.node(rpc_request.group_id.clone())?;

        let mut new_entries = Vec::with_capacity(rpc_request.entries.len());
        for proto_entry in rpc_request.entries {
            let entry_type = EntryType::from_wire(proto_entry.entry_type)
                .ok_or_else(|| Status::invalid_argument(format!("Unknown entry type {}", proto_entry.entry_type)))?;
            new_entries.push(WriteAheadLogEntry {
                term: Term::new(proto_entry.term),
                entry_type,
                timestamp_millis: proto_entry.timestamp_millis,
                data: proto_entry.data,
            });
        }

        let input = AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: uuid_from_wire(&rpc_request.leader_id)?,
            leader_previous_log_entry: log_entry_metadata_from_wire(
                rpc_request.prev_log_term,
                rpc_request.prev_log_index,
            )?,
            leader_commit_index: Index::from_wire(rpc_request.leader_commit_index),
            new_entries,
        };

        match node.actor_client().append_entries(input).await {
            Ok(output) => Ok(ProtoAppendEntriesResp {
                term: output.term.as_u64(),
                success: output.success,
                match_index: output.match_index.map(|i| i.as_u64()).unwrap_or(0),
            }),
            Err(AppendEntriesError::ServerIoError(e)) => Err(Status::internal(format!("Local IO failure: {}", e))),
            Err(AppendEntriesError::Terminated) | Err(AppendEntriesError::ActorExited) => {
                Err(Status::unavailable("RaftNode is not running"))
            }
        }
    }

    pub(crate) async fn handle_install_snapshot(
        &self,
        rpc_request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResp, Status> {
        let node = self.node(rpc_request.group_id.clone())?;

        let mut members = Vec::with_capacity(rpc_request.members.len());
        for member in rpc_request.members {
            members.push(transport::member_from_proto(member)?);
        }
        let last_included_index = Index::from_wire(rpc_request.last_included_index)
            .ok_or_else(|| Status::invalid_argument("Snapshot index 0"))?;

        let input = InstallSnapshotInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: uuid_from_wire(&rpc_request.leader_id)?,
            last_included_index,
            last_included_term: Term::new(rpc_request.last_included_term),
            members,
            data: rpc_request.snapshot_bytes,
        };

        match node.actor_client().install_snapshot(input).await {
            Ok(output) => Ok(ProtoInstallSnapshotResp {
                term: output.term.as_u64(),
                success: output.success,
            }),
            Err(InstallSnapshotError::ServerIoError(e)) => {
                Err(Status::internal(format!("Failed to restore snapshot: {}", e)))
            }
            Err(InstallSnapshotError::Terminated) | Err(InstallSnapshotError::ActorExited) => {
                Err(Status::unavailable("RaftNode is not running"))
            }
        }
    }

    pub(crate) async fn handle_invoke(&self, rpc_request: ProtoInvokeReq) -> Result<ProtoInvokeResp, Status> {
        let operation: Operation =
            decode(&rpc_request.payload).map_err(|e| Status::invalid_argument(e.to_string()))?;

        let result = match operation {
            Operation::DescribeMetadata => match encode(&self.view.metadata_group()) {
                Ok(bytes) => InvokeResult::Ok(bytes),
                Err(e) => InvokeResult::Failed(e),
            },
            Operation::Reset { metadata_seed } => {
                slog::warn!(self.logger, "Received CP Subsystem reset to metadata seed {}", metadata_seed);
                // Proxies must see the old groups as gone before this call returns.
                self.view.retire_before(metadata_seed);
                match self.resets.send(metadata_seed) {
                    Ok(()) => InvokeResult::Ok(Vec::new()),
                    Err(_) => InvokeResult::Failed(CpError::IllegalState("Member is shutting down".into())),
                }
            }
            operation => self.registry.execute(operation).await,
        };

        let payload = encode(&result).map_err(|e| Status::internal(e.to_string()))?;
        Ok(ProtoInvokeResp { payload })
    }

    fn node(&self, group_id: Option<ProtoGroupId>) -> Result<RaftNodeHandle, Status> {
        let group_id: CpGroupId = group_id_from_proto(group_id)?;
        self.registry
            .node(&group_id)
            .map_err(|e| Status::not_found(e.to_string()))
    }
}
