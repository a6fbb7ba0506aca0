use crate::grpc::grpc_cp_raft_server::{GrpcCpRaft, GrpcCpRaftServer};
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResp, ProtoInstallSnapshotReq, ProtoInstallSnapshotResp,
    ProtoInvokeReq, ProtoInvokeResp, ProtoRequestVoteReq, ProtoRequestVoteResp,
};
use crate::server::{MessageHandler, RpcServerShutdownSignal};
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer is the type that implements the CP Raft gRPC interface.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    handler: Arc<MessageHandler>,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, handler: Arc<MessageHandler>) -> Self {
        RpcServer { logger, handler }
    }

    pub(crate) async fn run(self, socket_addr: SocketAddr, shutdown_signal: RpcServerShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcCpRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        match result {
            Ok(()) => slog::info!(logger, "Server run() has exited"),
            Err(e) => slog::error!(logger, "Server on '{:?}' failed: {:?}", socket_addr, e),
        }
    }
}

#[async_trait::async_trait]
impl GrpcCpRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResp>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handler.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResp>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handler.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoInstallSnapshotReq>,
    ) -> Result<Response<ProtoInstallSnapshotResp>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        // Snapshot bytes are too noisy to log.
        slog::debug!(
            self.logger,
            "ServerWire - InstallSnapshot {:?} term {} index {}",
            rpc_request.group_id,
            rpc_request.term,
            rpc_request.last_included_index
        );
        let rpc_result = self.handler.handle_install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn invoke(&self, rpc_request_wrapped: Request<ProtoInvokeReq>) -> Result<Response<ProtoInvokeResp>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - Invoke {} bytes", rpc_request.payload.len());
        let rpc_result = self.handler.handle_invoke(rpc_request).await;
        slog::debug!(
            self.logger,
            "ServerWire - Invoke reply {:?}",
            rpc_result.as_ref().map(|r| r.payload.len())
        );

        rpc_result.map(Response::new)
    }
}
