//! Raft-specific facade over the generic commit log. It owns the group's state machine so that
//! committed entries are applied in strict index order, in one place.

mod log;
mod log_entry;

pub(crate) use log::AppliedEntry;
pub(crate) use log::SnapshotMeta;
pub(crate) use log::WriteAheadLog;
pub(crate) use log_entry::EntryType;
pub(crate) use log_entry::WriteAheadLogEntry;
