mod client;
mod group;
mod group_manager;
mod invocation;
mod metadata;
mod operation;
mod primitives;
mod registry;
mod session_manager;
mod view;

pub(crate) use client::CpClient;
pub(crate) use group::GroupCommand;
pub(crate) use group::Value;
pub(crate) use group_manager::CpGroupManager;
pub(crate) use invocation::InvocationManager;
pub(crate) use invocation::Wait;
pub(crate) use metadata::is_metadata_group_name;
pub(crate) use metadata::DEFAULT_GROUP_NAME;
pub(crate) use operation::decode;
pub(crate) use operation::encode;
pub(crate) use operation::InvokeResult;
pub(crate) use operation::Operation;
pub use primitives::LongFunction;
pub(crate) use primitives::{
    AlterMode, AtomicLongOp, AtomicReferenceOp, CountDownLatchOp, FencedLockOp, LockOwnership, PrimitiveKind,
    PrimitiveOp, SemaphoreOp, INVALID_FENCE,
};
pub(crate) use registry::RaftNodeRegistry;
pub(crate) use session_manager::run_heartbeats;
pub(crate) use session_manager::SessionManager;
pub(crate) use view::MetadataView;
