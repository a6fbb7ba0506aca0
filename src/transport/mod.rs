mod grpc;
mod local;

pub(crate) use grpc::GrpcTransport;
pub use local::LocalNetwork;
pub(crate) use local::LocalTransport;

use crate::api::{CpGroupId, CpMember};
use crate::commitlog::Index;
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResp, ProtoGroupId, ProtoInstallSnapshotReq, ProtoInstallSnapshotResp,
    ProtoInvokeReq, ProtoInvokeResp, ProtoMember, ProtoRequestVoteReq, ProtoRequestVoteResp,
};
use crate::raft::Term;
use std::str::FromStr;
use tonic::Status;
use uuid::Uuid;

/// RaftTransport carries wire messages to other members. Consensus messages name their target
/// group inside the message; `invoke` carries opaque member-to-member operations.
#[async_trait::async_trait]
pub(crate) trait RaftTransport: Send + Sync {
    async fn request_vote(&self, peer: &CpMember, request: ProtoRequestVoteReq)
        -> Result<ProtoRequestVoteResp, Status>;

    async fn append_entries(
        &self,
        peer: &CpMember,
        request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResp, Status>;

    async fn install_snapshot(
        &self,
        peer: &CpMember,
        request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResp, Status>;

    async fn invoke(&self, peer: &CpMember, request: ProtoInvokeReq) -> Result<ProtoInvokeResp, Status>;
}

pub(crate) fn group_id_to_proto(group_id: &CpGroupId) -> ProtoGroupId {
    ProtoGroupId {
        name: group_id.name().to_string(),
        seed: group_id.seed(),
    }
}

pub(crate) fn group_id_from_proto(group_id: Option<ProtoGroupId>) -> Result<CpGroupId, Status> {
    match group_id {
        Some(proto) if !proto.name.is_empty() => Ok(CpGroupId::new(proto.name, proto.seed)),
        _ => Err(Status::invalid_argument("Missing group id")),
    }
}

pub(crate) fn member_to_proto(member: &CpMember) -> ProtoMember {
    ProtoMember {
        uuid: member.uuid().to_string(),
        address: member.address().to_string(),
    }
}

pub(crate) fn member_from_proto(member: ProtoMember) -> Result<CpMember, Status> {
    let uuid = uuid_from_wire(&member.uuid)?;
    let address = member
        .address
        .parse()
        .map_err(|_| Status::invalid_argument(format!("Bad member address '{}'", member.address)))?;
    Ok(CpMember::new(uuid, address))
}

pub(crate) fn uuid_from_wire(value: &str) -> Result<Uuid, Status> {
    Uuid::from_str(value).map_err(|_| Status::invalid_argument(format!("Bad member id '{}'", value)))
}

/// Term and index of some log entry, where (0, 0) means "no entry".
pub(crate) fn log_entry_metadata_from_wire(term: u64, index: u64) -> Result<Option<(Term, Index)>, Status> {
    match (term, index) {
        (0, 0) => Ok(None),
        (0, _) => Err(Status::invalid_argument("Log entry term 0 and index non-0")),
        (_, 0) => Err(Status::invalid_argument("Log entry index 0 and term non-0")),
        (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_metadata() {
        assert!(matches!(log_entry_metadata_from_wire(0, 0), Ok(None)));
        assert!(log_entry_metadata_from_wire(0, 3).is_err());
        assert!(log_entry_metadata_from_wire(3, 0).is_err());
        let (term, index) = log_entry_metadata_from_wire(2, 5).unwrap().unwrap();
        assert_eq!(term.as_u64(), 2);
        assert_eq!(index.as_u64(), 5);
    }

    #[test]
    fn member_conversion() {
        let member = CpMember::new(Uuid::new_v4(), "127.0.0.1:5701".parse().unwrap());
        assert_eq!(member_from_proto(member_to_proto(&member)).unwrap(), member);

        let bad = ProtoMember {
            uuid: "nope".into(),
            address: "127.0.0.1:5701".into(),
        };
        assert!(member_from_proto(bad).is_err());
    }
}
