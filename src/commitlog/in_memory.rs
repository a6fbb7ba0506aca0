use crate::commitlog::{Entry, Index, Log};
use std::io;
use std::marker::PhantomData;

// Durability is modeled, not implemented. Entries are kept as bytes so the entry codec is
// exercised on every read and write.
pub struct InMemoryLog<E: Entry> {
    log: Vec<Vec<u8>>,
    // Number of entries discarded from the front of the log.
    offset: u64,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Result<Self, io::Error> {
        Ok(InMemoryLog {
            log: vec![],
            offset: 0,
            _pd: PhantomData::default(),
        })
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        // Log API states that Index starts from 1.
        index
            .as_u64()
            .checked_sub(self.offset + 1)
            .map(|position| position as usize)
    }

    fn held_through(&self) -> u64 {
        self.offset + self.log.len() as u64
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        self.log.push(entry.into());

        Ok(Index::new(self.held_through()))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        let opt_entry = self
            .vec_index(index)
            .and_then(|position| self.log.get(position))
            .cloned()
            .map(E::from);

        Ok(opt_entry)
    }

    fn truncate(&mut self, index: Index) {
        match self.vec_index(index) {
            Some(position) => self.log.truncate(position),
            None => self.log.clear(),
        }
    }

    fn next_index(&self) -> Index {
        Index::new(self.held_through() + 1)
    }

    fn first_index(&self) -> Index {
        Index::new(self.offset + 1)
    }

    fn compact_through(&mut self, index: Index) {
        let through = index.as_u64();
        if through <= self.offset {
            return;
        }

        if through >= self.held_through() {
            self.log.clear();
        } else {
            self.log.drain(..(through - self.offset) as usize);
        }
        self.offset = through;
    }

    fn reset_after(&mut self, index: Index) {
        self.log.clear();
        self.offset = index.as_u64();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestEntry(Vec<u8>);

    impl Entry for TestEntry {}

    impl From<Vec<u8>> for TestEntry {
        fn from(bytes: Vec<u8>) -> Self {
            TestEntry(bytes)
        }
    }

    impl Into<Vec<u8>> for TestEntry {
        fn into(self) -> Vec<u8> {
            self.0
        }
    }

    fn log_with(n: u8) -> InMemoryLog<TestEntry> {
        let mut log = InMemoryLog::create().unwrap();
        for i in 1..=n {
            log.append(TestEntry(vec![i])).unwrap();
        }
        log
    }

    #[test]
    fn append_read_truncate() {
        let mut log = log_with(3);
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(TestEntry(vec![2])));
        assert_eq!(log.read(Index::new(4)).unwrap(), None);

        log.truncate(Index::new(2));
        assert_eq!(log.next_index(), Index::new(2));
        assert_eq!(log.read(Index::new(2)).unwrap(), None);
        assert_eq!(log.append(TestEntry(vec![9])).unwrap(), Index::new(2));
    }

    #[test]
    fn compaction_keeps_indexes() {
        let mut log = log_with(5);
        log.compact_through(Index::new(3));

        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(6));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(TestEntry(vec![4])));
        assert_eq!(log.append(TestEntry(vec![6])).unwrap(), Index::new(6));

        // Compacting backwards is a no-op.
        log.compact_through(Index::new(2));
        assert_eq!(log.first_index(), Index::new(4));
    }

    #[test]
    fn compaction_past_the_end_and_reset() {
        let mut log = log_with(2);
        log.compact_through(Index::new(10));
        assert_eq!(log.first_index(), Index::new(11));
        assert_eq!(log.next_index(), Index::new(11));

        log.reset_after(Index::new(20));
        assert_eq!(log.append(TestEntry(vec![1])).unwrap(), Index::new(21));
        assert_eq!(log.first_index(), Index::new(21));
    }
}
