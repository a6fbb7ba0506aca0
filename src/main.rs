use cp_subsystem::{ClusterMembership, CpError, CpMember, CpOptions, CpSubsystem, CpSubsystemConfig, Network};
use slog::Drain;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::time::Duration;
use uuid::Uuid;

const NUM_MEMBERS: u16 = 3;
const PORT_BASE: u16 = 5701;

/// Boots three CP members over gRPC on localhost and passes a fenced lock around.
#[tokio::main]
async fn main() -> Result<(), CpError> {
    let root_logger = create_root_logger_for_stdout();

    let members: Vec<CpMember> = (0..NUM_MEMBERS)
        .map(|i| {
            CpMember::new(
                Uuid::new_v4(),
                SocketAddr::from((Ipv4Addr::LOCALHOST, PORT_BASE + i)),
            )
        })
        .collect();
    let cluster = ClusterMembership::with_members(members.clone());

    let mut subsystems = Vec::with_capacity(members.len());
    for member in members {
        let config = CpSubsystemConfig {
            me: member,
            cluster: cluster.clone(),
            network: Network::Grpc,
            info_logger: root_logger.clone(),
            options: CpOptions {
                cp_member_count: Some(NUM_MEMBERS as usize),
                ..CpOptions::default()
            },
        };
        subsystems.push(CpSubsystem::start(config).await?);
    }

    for subsystem in subsystems.iter() {
        let management = subsystem.management()?;
        if !management.await_discovery_completed(Duration::from_secs(30)).await {
            return Err(CpError::DiscoveryIncomplete);
        }
    }

    for subsystem in subsystems.iter() {
        let lock = subsystem.get_lock("demo-lock").await?;
        let fence = lock.lock().await?;
        slog::info!(root_logger, "{} holds {} with fence {}", subsystem.local_member().uuid(), lock.name(), fence);
        lock.unlock().await?;
    }

    let group_ids = subsystems[0].management()?.get_cp_group_ids().await?;
    slog::info!(root_logger, "CP groups: {:?}", group_ids);

    for subsystem in subsystems {
        subsystem.shutdown().await;
    }
    Ok(())
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
