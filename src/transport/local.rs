use crate::api::CpMember;
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResp, ProtoInstallSnapshotReq, ProtoInstallSnapshotResp,
    ProtoInvokeReq, ProtoInvokeResp, ProtoRequestVoteReq, ProtoRequestVoteResp,
};
use crate::server::MessageHandler;
use crate::transport::RaftTransport;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::time::Duration;
use tonic::Status;
use uuid::Uuid;

const LINK_CHECK_INTERVAL: Duration = Duration::from_millis(20);

/// LocalNetwork delivers messages between members living in the same process. Members can be
/// disconnected to simulate a crash or a partition: nothing reaches them and nothing they send
/// leaves.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<LocalNetworkInner>>,
}

#[derive(Default)]
struct LocalNetworkInner {
    handlers: HashMap<Uuid, Weak<MessageHandler>>,
    disconnected: HashSet<Uuid>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disconnect(&self, member: Uuid) {
        self.lock().disconnected.insert(member);
    }

    pub fn reconnect(&self, member: Uuid) {
        self.lock().disconnected.remove(&member);
    }

    pub fn is_connected(&self, member: Uuid) -> bool {
        !self.lock().disconnected.contains(&member)
    }

    pub(crate) fn register(&self, member: Uuid, handler: &Arc<MessageHandler>) {
        self.lock().handlers.insert(member, Arc::downgrade(handler));
    }

    fn route(&self, from: Uuid, to: Uuid) -> Result<Arc<MessageHandler>, Status> {
        let inner = self.lock();
        if inner.disconnected.contains(&from) || inner.disconnected.contains(&to) {
            return Err(Status::unavailable(format!("{} is unreachable", to)));
        }
        inner
            .handlers
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Status::unavailable(format!("{} is not running", to)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalNetworkInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub(crate) struct LocalTransport {
    me: Uuid,
    network: LocalNetwork,
}

impl LocalTransport {
    pub(crate) fn new(me: Uuid, network: LocalNetwork) -> Self {
        LocalTransport { me, network }
    }
}

#[async_trait::async_trait]
impl RaftTransport for LocalTransport {
    async fn request_vote(
        &self,
        peer: &CpMember,
        request: ProtoRequestVoteReq,
    ) -> Result<ProtoRequestVoteResp, Status> {
        let handler = self.network.route(self.me, peer.uuid())?;
        handler.handle_request_vote(request).await
    }

    async fn append_entries(
        &self,
        peer: &CpMember,
        request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResp, Status> {
        let handler = self.network.route(self.me, peer.uuid())?;
        handler.handle_append_entries(request).await
    }

    async fn install_snapshot(
        &self,
        peer: &CpMember,
        request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResp, Status> {
        let handler = self.network.route(self.me, peer.uuid())?;
        handler.handle_install_snapshot(request).await
    }

    async fn invoke(&self, peer: &CpMember, request: ProtoInvokeReq) -> Result<ProtoInvokeResp, Status> {
        let handler = self.network.route(self.me, peer.uuid())?;
        let call = handler.handle_invoke(request);
        tokio::pin!(call);

        // Invocations can wait on a lock for a long time. A link that breaks meanwhile must fail
        // the call the way a dropped connection would. The operation itself may have run.
        loop {
            tokio::select! {
                response = &mut call => {
                    if !self.is_linked(peer) {
                        return Err(Status::unknown(format!("{} became unreachable", peer.uuid())));
                    }
                    return response;
                }
                _ = tokio::time::sleep(LINK_CHECK_INTERVAL) => {
                    if !self.is_linked(peer) {
                        return Err(Status::unknown(format!("{} became unreachable", peer.uuid())));
                    }
                }
            }
        }
    }
}

impl LocalTransport {
    fn is_linked(&self, peer: &CpMember) -> bool {
        self.network.is_connected(self.me) && self.network.is_connected(peer.uuid())
    }
}
