//! This mod is meant to hold most of the code for the library's client-facing API.
mod atomic_long;
mod atomic_reference;
mod cluster;
mod count_down_latch;
mod error;
mod fence_guard;
mod fenced_lock;
mod listeners;
mod management;
mod options;
mod proxy;
mod semaphore;
mod subsystem;
mod types;

pub use atomic_long::AtomicLong;
pub use atomic_reference::AtomicReference;
pub use cluster::ClusterEvent;
pub use cluster::ClusterMembership;
pub use cluster::Network;
pub use count_down_latch::CountDownLatch;
pub use error::CpError;
pub use fence_guard::FenceGuard;
pub use fenced_lock::FencedLock;
pub use management::CpManagement;
pub use management::CpSessionManagement;
pub use options::CpOptions;
pub use options::ReferenceFunction;
pub use semaphore::Semaphore;
pub use subsystem::CpMap;
pub use subsystem::CpSubsystem;
pub use subsystem::CpSubsystemConfig;
pub use types::AvailabilityChange;
pub use types::CpGroup;
pub use types::CpGroupAvailabilityEvent;
pub use types::CpGroupId;
pub use types::CpGroupStatus;
pub use types::CpMember;
pub use types::CpSession;
pub use types::MembershipEvent;

// So the CP layer can read validated options and fire events.
pub(crate) use listeners::ListenerRegistry;
pub(crate) use options::CpOptionsValidated;
