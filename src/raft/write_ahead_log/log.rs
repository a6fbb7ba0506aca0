use crate::api::CpMember;
use crate::commitlog;
use crate::commitlog::Index;
use crate::raft::state_machine::{ApplyContext, ApplyOutcome, StateMachine};
use crate::raft::write_ahead_log::{EntryType, WriteAheadLogEntry};
use crate::raft::Term;
use std::io;

/// A state machine snapshot plus the log position and group membership it captures.
#[derive(Clone, Debug)]
pub(crate) struct SnapshotMeta {
    pub(crate) index: Index,
    pub(crate) term: Term,
    pub(crate) members: Vec<CpMember>,
    pub(crate) data: Vec<u8>,
}

/// A committed entry that has just been applied. `outcome` is only present for NORMAL entries.
#[derive(Debug)]
pub(crate) struct AppliedEntry {
    pub(crate) index: Index,
    pub(crate) entry_type: EntryType,
    pub(crate) outcome: Option<ApplyOutcome>,
}

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to the log, not yet replicated to majority
/// 2. Committed - written to the log, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,

    log: L,
    // Metadata about the highest log entry that we've locally written, or the snapshot if the log
    // is empty past it.
    latest_entry_metadata: Option<(Term, Index)>,
    // Latest snapshot. Everything up to and including its index has been compacted.
    snapshot: Option<SnapshotMeta>,

    state_machine: Box<dyn StateMachine>,
    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry applied to state machine. None if nothing is applied.
    last_applied_index: Option<Index>,

    // Group membership before any MEMBERSHIP_CHANGE entry or snapshot.
    initial_members: Vec<CpMember>,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    pub(crate) fn new(
        logger: slog::Logger,
        log: L,
        state_machine: Box<dyn StateMachine>,
        initial_members: Vec<CpMember>,
    ) -> Self {
        assert_eq!(
            log.next_index(),
            Index::start_index(),
            "We only know how to handle initialization of an empty log."
        );

        WriteAheadLog {
            logger,
            log,
            latest_entry_metadata: None,
            snapshot: None,
            state_machine,
            commit_index: None,
            last_applied_index: None,
            initial_members,
        }
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn snapshot(&self) -> Option<&SnapshotMeta> {
        self.snapshot.as_ref()
    }

    /// Index of the oldest entry that can still be sent to a follower.
    pub(crate) fn first_index(&self) -> Index {
        self.log.first_index()
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    fn read_required(&self, index: Index) -> Result<WriteAheadLogEntry, io::Error> {
        match self.read(index)? {
            Some(entry) => Ok(entry),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No log entry for index {:?}", index),
            )),
        }
    }

    /// Term of the entry at `index`, also answering for the snapshot's last included index.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some(snapshot) = &self.snapshot {
            if snapshot.index == index {
                return Ok(Some(snapshot.term));
            }
        }

        Ok(self.read(index)?.map(|entry| entry.term))
    }

    /// Reads up to `max` consecutive entries starting at `from`.
    pub(crate) fn read_batch(&self, from: Index, max: usize) -> Result<Vec<WriteAheadLogEntry>, io::Error> {
        let mut entries = Vec::new();
        let mut next = from;
        while entries.len() < max {
            match self.read(next)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            next = next.plus(1);
        }

        Ok(entries)
    }

    /// Remove anything starting at `index` and later.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let mut new_latest_entry_metadata = None;
        if let Some(new_latest_entry_index) = index.checked_minus(1) {
            new_latest_entry_metadata = self
                .term_at(new_latest_entry_index)?
                .map(|term| (term, new_latest_entry_index));
        }

        self.log.truncate(index);

        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(ci) if tentative_new_commit_index <= ci) {
            return Ok(false);
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        match self.term_at(tentative_new_commit_index)? {
            Some(term) if term == current_term => {}
            _ => return Ok(false),
        }

        self.ratchet_fwd_commit_index(tentative_new_commit_index);

        Ok(true)
    }

    /// Moves the commit index forward. Anything at or below the current commit index is ignored,
    /// which happens when AppendEntries calls are reordered.
    pub(crate) fn ratchet_fwd_commit_index(&mut self, new_commit_index: Index) {
        if matches!(self.commit_index, Some(ci) if new_commit_index <= ci) {
            return;
        }

        // Assert we only mark as committed if we have the entry locally.
        let latest_locally_written_index = self.latest_entry_metadata.map(|(_, index)| index);
        assert!(
            matches!(latest_locally_written_index, Some(latest) if latest >= new_commit_index),
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            latest_locally_written_index,
            new_commit_index,
        );

        self.commit_index.replace(new_commit_index);
    }

    /// apply_all_committed_entries applies all committed but unapplied entries in order, and
    /// returns what was applied.
    pub(crate) fn apply_all_committed_entries(&mut self) -> Vec<AppliedEntry> {
        let mut applied = Vec::new();
        if let Err(e) = self.try_apply_all_committed_entries(&mut applied) {
            // Entries are already persisted. We retry applying on the next commit.
            slog::error!(self.logger, "Failed to apply a log entry. {:?}", e);
        }

        applied
    }

    fn try_apply_all_committed_entries(&mut self, applied: &mut Vec<AppliedEntry>) -> Result<(), io::Error> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(()),
        };

        let mut next_index = match self.last_applied_index {
            None => Index::start_index(),
            Some(last_applied) => last_applied.plus(1),
        };

        // This may be a long running loop, and starve the node's event loop. It only runs long
        // when a follower catches up on many commits at once.
        while next_index <= commit_index {
            let entry = self.read_required(next_index)?;
            let outcome = match entry.entry_type {
                EntryType::Normal => {
                    let context = ApplyContext {
                        index: next_index,
                        timestamp_millis: entry.timestamp_millis,
                    };
                    Some(self.state_machine.apply(&context, &entry.data))
                }
                EntryType::Noop | EntryType::MembershipChange => None,
            };

            applied.push(AppliedEntry {
                index: next_index,
                entry_type: entry.entry_type,
                outcome,
            });
            self.last_applied_index.replace(next_index);
            next_index = next_index.plus(1);
        }

        Ok(())
    }

    /// Member list in effect after every entry the log holds: the latest MEMBERSHIP_CHANGE entry,
    /// else the snapshot's members, else the initial members.
    pub(crate) fn effective_members(&self) -> Result<Vec<CpMember>, io::Error> {
        match self.latest_entry_metadata {
            Some((_, latest)) => self.members_as_of(latest),
            None => Ok(self.initial_members.clone()),
        }
    }

    fn members_as_of(&self, index: Index) -> Result<Vec<CpMember>, io::Error> {
        let first_index = self.log.first_index();
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            if i < first_index {
                break;
            }
            if let Some(entry) = self.read(i)? {
                if entry.entry_type == EntryType::MembershipChange {
                    return entry.decode_members();
                }
            }
            cursor = i.checked_minus(1);
        }

        Ok(match &self.snapshot {
            Some(snapshot) => snapshot.members.clone(),
            None => self.initial_members.clone(),
        })
    }

    /// Takes a snapshot at the last applied index and compacts the log behind it, once at least
    /// `threshold` entries were applied since the previous snapshot.
    pub(crate) fn take_snapshot_if_due(&mut self, threshold: u64) -> Result<Option<Index>, io::Error> {
        let last_applied = match self.last_applied_index {
            Some(la) => la,
            None => return Ok(None),
        };
        let snapshot_index = self.snapshot.as_ref().map(|s| s.index.as_u64()).unwrap_or(0);
        if last_applied.as_u64() - snapshot_index < threshold {
            return Ok(None);
        }

        let term = match self.term_at(last_applied)? {
            Some(term) => term,
            None => return Ok(None),
        };
        let members = self.members_as_of(last_applied)?;
        let data = self
            .state_machine
            .take_snapshot()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.log.compact_through(last_applied);
        self.snapshot = Some(SnapshotMeta {
            index: last_applied,
            term,
            members,
            data,
        });
        slog::info!(self.logger, "Took snapshot at index {:?}, term {:?}", last_applied, term);

        Ok(Some(last_applied))
    }

    /// Replaces local state with a snapshot received from the leader.
    pub(crate) fn install_snapshot(&mut self, snapshot: SnapshotMeta) -> Result<(), io::Error> {
        self.state_machine
            .restore_snapshot(&snapshot.data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // > If existing log entry has same index and term as snapshot's
        // > last included entry, retain log entries following it and reply
        if self.read(snapshot.index)?.map(|e| e.term) == Some(snapshot.term) {
            self.log.compact_through(snapshot.index);
        } else {
            // > Discard the entire log
            self.log.reset_after(snapshot.index);
            self.latest_entry_metadata = Some((snapshot.term, snapshot.index));
        }

        self.commit_index.replace(snapshot.index);
        self.last_applied_index.replace(snapshot.index);
        slog::info!(
            self.logger,
            "Installed snapshot at index {:?}, term {:?}",
            snapshot.index,
            snapshot.term
        );
        self.snapshot = Some(snapshot);

        Ok(())
    }
}
