use crate::api::{CpError, CpSession};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SessionRecord {
    session: CpSession,
    ttl_millis: u64,
}

/// Sessions of one CP group. Times are log entry timestamps, never local clocks.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct SessionRegistry {
    next_session_id: u64,
    sessions: BTreeMap<u64, SessionRecord>,
}

impl SessionRegistry {
    pub(crate) fn create(&mut self, endpoint: Uuid, ttl_millis: u64, now_millis: u64) -> CpSession {
        self.next_session_id += 1;
        let session = CpSession {
            id: self.next_session_id,
            endpoint,
            creation_time_millis: now_millis,
            expiration_time_millis: now_millis.saturating_add(ttl_millis),
            version: 0,
        };
        self.sessions.insert(
            session.id,
            SessionRecord {
                session: session.clone(),
                ttl_millis,
            },
        );
        session
    }

    pub(crate) fn heartbeat(&mut self, session_id: u64, now_millis: u64) -> Result<(), CpError> {
        let record = self
            .sessions
            .get_mut(&session_id)
            .ok_or(CpError::SessionExpired { session_id })?;
        record.session.expiration_time_millis = now_millis.saturating_add(record.ttl_millis);
        record.session.version += 1;
        Ok(())
    }

    pub(crate) fn contains(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Returns false if the session was already gone.
    pub(crate) fn close(&mut self, session_id: u64) -> bool {
        self.sessions.remove(&session_id).is_some()
    }

    pub(crate) fn expired(&self, now_millis: u64) -> Vec<u64> {
        self.sessions
            .values()
            .filter(|record| record.session.expiration_time_millis <= now_millis)
            .map(|record| record.session.id)
            .collect()
    }

    pub(crate) fn sessions(&self) -> Vec<CpSession> {
        self.sessions.values().map(|record| record.session.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let mut registry = SessionRegistry::default();
        let endpoint = Uuid::new_v4();

        let first = registry.create(endpoint, 1000, 5000);
        let second = registry.create(endpoint, 1000, 5500);
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(first.expiration_time_millis, 6000);

        assert!(registry.expired(5999).is_empty());
        assert_eq!(registry.expired(6000), vec![1]);

        registry.heartbeat(1, 6000).unwrap();
        assert_eq!(registry.expired(6600), vec![2]);
        assert_eq!(registry.sessions()[0].version, 1);

        assert!(registry.close(2));
        assert!(!registry.close(2));
        assert_eq!(registry.heartbeat(2, 6000), Err(CpError::SessionExpired { session_id: 2 }));

        // Ids are never reused.
        assert_eq!(registry.create(endpoint, 1000, 7000).id, 3);
    }
}
