mod actor;
mod api;
mod commitlog;
mod cp;
mod raft;
mod server;
mod transport;
mod grpc {
    include!("../generated/cp_raft.rs");
}

pub use api::AtomicLong;
pub use api::AtomicReference;
pub use api::AvailabilityChange;
pub use api::ClusterEvent;
pub use api::ClusterMembership;
pub use api::CountDownLatch;
pub use api::CpError;
pub use api::CpGroup;
pub use api::CpGroupAvailabilityEvent;
pub use api::CpGroupId;
pub use api::CpGroupStatus;
pub use api::CpManagement;
pub use api::CpMap;
pub use api::CpMember;
pub use api::CpOptions;
pub use api::CpSession;
pub use api::CpSessionManagement;
pub use api::CpSubsystem;
pub use api::CpSubsystemConfig;
pub use api::FenceGuard;
pub use api::FencedLock;
pub use api::MembershipEvent;
pub use api::Network;
pub use api::ReferenceFunction;
pub use api::Semaphore;
pub use cp::LongFunction;
pub use transport::LocalNetwork;

