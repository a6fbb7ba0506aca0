use crate::api::CpMember;
use crate::commitlog;
use crate::raft::Term;
use std::convert::TryInto;
use std::io;

/// Byte representation:
///
/// ```text
/// |                                         1                                   |
/// | 0 | 1 | 2 | ... | 8 | 9 | 0 | 1 | ... | 7 | 8 | ...                          |
/// +---+---------------+---+-------------------+-------------------------------...-+
/// |Vrs| Term (8 bytes)|Typ| Timestamp (8 bytes)|   Data (variable size)      ...  |
/// +---+---------------+---+-------------------+-------------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - raft leadership term when this entry was created, little endian
/// * `Typ` - entry type, see `EntryType`
/// * `Timestamp` - leader's wall clock in millis when the entry was appended, little endian
/// * `Data` - command payload, or the bincode member list for membership changes
///
/// Checksum and data length are left to the underlying commitlog.
#[derive(Clone, Debug)]
pub(crate) struct WriteAheadLogEntry {
    pub term: Term,
    pub entry_type: EntryType,
    pub timestamp_millis: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryType {
    Normal,
    Noop,
    MembershipChange,
}

const WAL_ENTRY_FORMAT_VERSION: u8 = 2;
const HEADER_LEN: usize = 1 + 8 + 1 + 8;

impl EntryType {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            EntryType::Normal => 0,
            EntryType::Noop => 1,
            EntryType::MembershipChange => 2,
        }
    }

    pub(crate) fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(EntryType::Normal),
            1 => Some(EntryType::Noop),
            2 => Some(EntryType::MembershipChange),
            _ => None,
        }
    }
}

impl WriteAheadLogEntry {
    pub(crate) fn noop(term: Term, timestamp_millis: u64) -> Self {
        WriteAheadLogEntry {
            term,
            entry_type: EntryType::Noop,
            timestamp_millis,
            data: Vec::new(),
        }
    }

    pub(crate) fn membership_change(
        term: Term,
        timestamp_millis: u64,
        members: &[CpMember],
    ) -> Result<Self, bincode::Error> {
        Ok(WriteAheadLogEntry {
            term,
            entry_type: EntryType::MembershipChange,
            timestamp_millis,
            data: bincode::serialize(members)?,
        })
    }

    pub(crate) fn decode_members(&self) -> Result<Vec<CpMember>, io::Error> {
        bincode::deserialize(&self.data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl commitlog::Entry for WriteAheadLogEntry {}

impl From<Vec<u8>> for WriteAheadLogEntry {
    fn from(bytes: Vec<u8>) -> Self {
        // Only bytes produced by `Into<Vec<u8>>` below ever reach the commitlog.
        assert!(bytes.len() >= HEADER_LEN, "WAL entry too short: {} bytes", bytes.len());
        assert_eq!(bytes[0], WAL_ENTRY_FORMAT_VERSION);

        let term = u64::from_le_bytes(bytes[1..9].try_into().expect("slice of 8"));
        let entry_type = EntryType::from_wire(bytes[9] as u32).expect("unknown WAL entry type");
        let timestamp_millis = u64::from_le_bytes(bytes[10..18].try_into().expect("slice of 8"));

        WriteAheadLogEntry {
            term: Term::new(term),
            entry_type,
            timestamp_millis,
            data: bytes[HEADER_LEN..].to_vec(),
        }
    }
}

impl Into<Vec<u8>> for WriteAheadLogEntry {
    fn into(self) -> Vec<u8> {
        let mut bytes: Vec<u8> = Vec::with_capacity(HEADER_LEN + self.data.len());

        bytes.push(WAL_ENTRY_FORMAT_VERSION);
        bytes.extend_from_slice(&self.term.as_u64().to_le_bytes());
        bytes.push(self.entry_type.to_wire() as u8);
        bytes.extend_from_slice(&self.timestamp_millis.to_le_bytes());
        bytes.extend_from_slice(&self.data);

        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_layout() {
        let entry = WriteAheadLogEntry {
            term: Term::new(0x0102),
            entry_type: EntryType::MembershipChange,
            timestamp_millis: 7,
            data: vec![0xAA, 0xBB],
        };

        let bytes: Vec<u8> = entry.into();
        assert_eq!(
            bytes,
            vec![2, 0x02, 0x01, 0, 0, 0, 0, 0, 0, 2, 7, 0, 0, 0, 0, 0, 0, 0, 0xAA, 0xBB]
        );

        let decoded = WriteAheadLogEntry::from(bytes);
        assert_eq!(decoded.term, Term::new(0x0102));
        assert_eq!(decoded.entry_type, EntryType::MembershipChange);
        assert_eq!(decoded.timestamp_millis, 7);
        assert_eq!(decoded.data, vec![0xAA, 0xBB]);
    }
}
