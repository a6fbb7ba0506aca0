use crate::api::CpMember;
use crate::grpc::grpc_cp_raft_client::GrpcCpRaftClient;
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResp, ProtoInstallSnapshotReq, ProtoInstallSnapshotResp,
    ProtoInvokeReq, ProtoInvokeResp, ProtoRequestVoteReq, ProtoRequestVoteResp,
};
use crate::transport::RaftTransport;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use uuid::Uuid;

/// GrpcTransport connects lazily and keeps one channel per peer. A failed call drops the
/// channel so the next call reconnects.
pub(crate) struct GrpcTransport {
    logger: slog::Logger,
    clients: Mutex<HashMap<Uuid, GrpcCpRaftClient<Channel>>>,
}

impl GrpcTransport {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        GrpcTransport {
            logger,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, peer: &CpMember) -> Result<GrpcCpRaftClient<Channel>, Status> {
        if let Some(client) = self.clients.lock().await.get(&peer.uuid()) {
            return Ok(client.clone());
        }

        // Connect outside the lock. Two racing connects to the same peer both succeed.
        let url = format!("http://{}", peer.address());
        slog::debug!(self.logger, "Connecting to {} ...", url);
        let endpoint = Endpoint::from_shared(url).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let connection = endpoint
            .connect()
            .await
            .map_err(|e| Status::unavailable(format!("Connect to {:?} failed: {}", peer.address(), e)))?;

        let client = GrpcCpRaftClient::new(connection);
        self.clients.lock().await.insert(peer.uuid(), client.clone());
        Ok(client)
    }

    async fn forget_on_failure<T>(&self, peer: &CpMember, result: Result<T, Status>) -> Result<T, Status> {
        if let Err(status) = &result {
            if status.code() == tonic::Code::Unavailable || status.code() == tonic::Code::Unknown {
                self.clients.lock().await.remove(&peer.uuid());
            }
        }
        result
    }
}

#[async_trait::async_trait]
impl RaftTransport for GrpcTransport {
    async fn request_vote(
        &self,
        peer: &CpMember,
        request: ProtoRequestVoteReq,
    ) -> Result<ProtoRequestVoteResp, Status> {
        let mut client = self.client(peer).await?;
        let result = client.request_vote(request).await.map(|r| r.into_inner());
        self.forget_on_failure(peer, result).await
    }

    async fn append_entries(
        &self,
        peer: &CpMember,
        request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResp, Status> {
        let mut client = self.client(peer).await?;
        let result = client.append_entries(request).await.map(|r| r.into_inner());
        self.forget_on_failure(peer, result).await
    }

    async fn install_snapshot(
        &self,
        peer: &CpMember,
        request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResp, Status> {
        let mut client = self.client(peer).await?;
        let result = client.install_snapshot(request).await.map(|r| r.into_inner());
        self.forget_on_failure(peer, result).await
    }

    async fn invoke(&self, peer: &CpMember, request: ProtoInvokeReq) -> Result<ProtoInvokeResp, Status> {
        let mut client = self.client(peer).await?;
        let result = client.invoke(request).await.map(|r| r.into_inner());
        self.forget_on_failure(peer, result).await
    }
}
