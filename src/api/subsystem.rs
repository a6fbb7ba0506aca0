use crate::api::options::CpOptionsValidated;
use crate::api::proxy::{parse_name, ProxyTarget};
use crate::api::{
    AtomicLong, AtomicReference, ClusterMembership, CountDownLatch, CpError, CpManagement, CpMember, CpOptions,
    CpSessionManagement, FencedLock, Network, Semaphore,
};
use crate::cp::{
    run_heartbeats, CpClient, CpGroupManager, InvocationManager, MetadataView, RaftNodeRegistry, SessionManager,
};
use crate::server::{self, MessageHandler, RpcServer, RpcServerShutdownHandle};
use crate::transport::{GrpcTransport, LocalTransport, RaftTransport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::TryFrom;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct CpSubsystemConfig {
    pub me: CpMember,
    pub cluster: ClusterMembership,
    pub network: Network,
    pub info_logger: slog::Logger,
    pub options: CpOptions,
}

/// Placeholder for the replicated map. It is not available in this build, so no value of this
/// type can exist.
#[derive(Debug)]
pub enum CpMap {}

struct Running {
    client: CpClient,
    management: CpManagement,
    session_management: CpSessionManagement,
    registry: Arc<RaftNodeRegistry>,
    sessions: Arc<SessionManager>,
    // Kept alive for the local network, which only holds it weakly.
    _handler: Arc<MessageHandler>,
    server_shutdown: Option<RpcServerShutdownHandle>,
    tasks: Vec<JoinHandle<()>>,
}

/// CpSubsystem is a member's entry point to CP data structures and CP administration. Start one
/// per platform member; with a CP member count of 0 it starts disabled and every call fails
/// with `CpSubsystemDisabled`.
pub struct CpSubsystem {
    logger: slog::Logger,
    me: CpMember,
    running: Option<Running>,
}

impl CpSubsystem {
    pub async fn start(config: CpSubsystemConfig) -> Result<CpSubsystem, CpError> {
        let logger = config.info_logger.new(slog::o!("Member" => config.me.uuid().to_string()));
        let options = CpOptionsValidated::try_from(config.options)
            .map_err(|e| CpError::IllegalArgument(e.to_string()))?;

        if !options.is_enabled() {
            slog::warn!(
                logger,
                "CP Subsystem is not enabled. CP data structures will operate in UNSAFE mode! \
                 Please note that UNSAFE mode will not provide strong consistency guarantees."
            );
            return Ok(CpSubsystem {
                logger,
                me: config.me,
                running: None,
            });
        }
        slog::info!(logger, "CP Subsystem is enabled with {} members.", options.cp_member_count);

        let me = config.me;
        let transport: Arc<dyn RaftTransport> = match &config.network {
            Network::Grpc => Arc::new(GrpcTransport::new(logger.clone())),
            Network::Local(network) => Arc::new(LocalTransport::new(me.uuid(), network.clone())),
        };

        let view = Arc::new(MetadataView::new());
        let registry = Arc::new(RaftNodeRegistry::new(
            logger.clone(),
            me.clone(),
            transport.clone(),
            options.clone(),
        ));
        let invocation = Arc::new(InvocationManager::new(
            logger.clone(),
            transport,
            view.clone(),
            options.operation_timeout,
            options.retry_backoff,
        ));

        let (resets_tx, resets_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(MessageHandler::new(logger.clone(), registry.clone(), view, resets_tx));
        let server_shutdown = match &config.network {
            Network::Grpc => {
                let (handle, signal) = server::shutdown_signal();
                let rpc_server = RpcServer::new(logger.clone(), handler.clone());
                tokio::spawn(rpc_server.run(me.address(), signal));
                Some(handle)
            }
            Network::Local(network) => {
                network.register(me.uuid(), &handler);
                None
            }
        };

        let groups = Arc::new(CpGroupManager::new(
            logger.clone(),
            me.clone(),
            options.clone(),
            config.cluster,
            registry.clone(),
            invocation.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            logger.clone(),
            me.uuid(),
            invocation.clone(),
            options.session_ttl,
        ));

        let tasks = vec![
            tokio::spawn(groups.clone().run(resets_rx)),
            tokio::spawn(run_heartbeats(sessions.clone(), options.session_heartbeat_interval)),
        ];

        let client = CpClient::new(groups.clone(), invocation, sessions.clone());
        Ok(CpSubsystem {
            logger,
            me,
            running: Some(Running {
                management: CpManagement::new(groups.clone()),
                session_management: CpSessionManagement::new(groups, client.clone()),
                client,
                registry,
                sessions,
                _handler: handler,
                server_shutdown,
                tasks,
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_member(&self) -> &CpMember {
        &self.me
    }

    pub fn management(&self) -> Result<&CpManagement, CpError> {
        Ok(&self.running()?.management)
    }

    pub fn session_management(&self) -> Result<&CpSessionManagement, CpError> {
        Ok(&self.running()?.session_management)
    }

    /// Proxies are named `object` or `object@group`; without a group they live in the default
    /// group. The group is created on first use.
    pub async fn get_atomic_long(&self, name: &str) -> Result<AtomicLong, CpError> {
        Ok(AtomicLong::new(self.target(name).await?))
    }

    pub async fn get_atomic_reference<T>(&self, name: &str) -> Result<AtomicReference<T>, CpError>
    where
        T: Serialize + DeserializeOwned,
    {
        Ok(AtomicReference::new(self.target(name).await?))
    }

    pub async fn get_count_down_latch(&self, name: &str) -> Result<CountDownLatch, CpError> {
        Ok(CountDownLatch::new(self.target(name).await?))
    }

    pub async fn get_semaphore(&self, name: &str) -> Result<Semaphore, CpError> {
        Ok(Semaphore::new(self.target(name).await?))
    }

    pub async fn get_lock(&self, name: &str) -> Result<FencedLock, CpError> {
        Ok(FencedLock::new(self.target(name).await?))
    }

    pub fn get_map(&self, name: &str) -> Result<CpMap, CpError> {
        self.running()?;
        parse_name(name)?;
        Err(CpError::NotImplemented("CPMap is not available".into()))
    }

    /// Closes this endpoint's sessions, stops every local RaftNode and leaves the network.
    pub async fn shutdown(mut self) {
        let running = match self.running.take() {
            Some(running) => running,
            None => return,
        };
        slog::info!(self.logger, "Shutting down CP Subsystem");

        running.sessions.close_all().await;
        for task in running.tasks {
            task.abort();
        }
        running.registry.shutdown().await;
        if let Some(handle) = running.server_shutdown {
            handle.shutdown();
        }
    }

    async fn target(&self, name: &str) -> Result<ProxyTarget, CpError> {
        ProxyTarget::resolve(self.running()?.client.clone(), name).await
    }

    fn running(&self) -> Result<&Running, CpError> {
        self.running.as_ref().ok_or(CpError::CpSubsystemDisabled)
    }
}
