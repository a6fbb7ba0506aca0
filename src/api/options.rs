use crate::raft::RaftNodeOptions;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Arc;
use tokio::time::Duration;

/// A deterministic function over an AtomicReference's serialized value. `None` is the null
/// reference. Every member must register the same functions under the same names.
pub type ReferenceFunction = Arc<dyn Fn(Option<&[u8]>) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CpOptions {
    /// Number of platform members that become CP members at startup. 0 disables the subsystem.
    pub cp_member_count: Option<usize>,
    pub group_size: Option<usize>,
    pub metadata_group_size: Option<usize>,
    pub max_cp_member_count: Option<usize>,

    pub session_ttl: Option<Duration>,
    pub session_heartbeat_interval: Option<Duration>,

    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub append_entries_timeout: Option<Duration>,
    pub commit_index_advance_count_to_snapshot: Option<u64>,
    pub max_append_entries: Option<usize>,

    pub operation_timeout: Option<Duration>,
    pub retry_backoff: Option<Duration>,
    pub metadata_refresh_interval: Option<Duration>,

    pub reference_functions: HashMap<String, ReferenceFunction>,
}

#[derive(Clone)]
pub(crate) struct CpOptionsValidated {
    pub cp_member_count: usize,
    pub group_size: usize,
    pub metadata_group_size: usize,
    pub max_cp_member_count: usize,

    pub session_ttl: Duration,
    pub session_heartbeat_interval: Duration,

    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub append_entries_timeout: Duration,
    pub commit_index_advance_count_to_snapshot: u64,
    pub max_append_entries: usize,

    pub operation_timeout: Duration,
    pub retry_backoff: Duration,
    pub metadata_refresh_interval: Duration,

    pub reference_functions: Arc<HashMap<String, ReferenceFunction>>,
}

const MIN_GROUP_SIZE: usize = 3;
const MAX_GROUP_SIZE: usize = 7;

impl CpOptionsValidated {
    pub(crate) fn is_enabled(&self) -> bool {
        self.cp_member_count > 0
    }

    pub(crate) fn raft_node_options(&self) -> RaftNodeOptions {
        RaftNodeOptions {
            leader_heartbeat_duration: self.leader_heartbeat_duration,
            follower_min_timeout: self.follower_min_timeout,
            follower_max_timeout: self.follower_max_timeout,
            append_entries_timeout: self.append_entries_timeout,
            max_append_entries: self.max_append_entries,
            commit_index_advance_count_to_snapshot: self.commit_index_advance_count_to_snapshot,
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.is_enabled() {
            if self.cp_member_count < MIN_GROUP_SIZE {
                return Err("CP member count must be 0 or at least 3");
            }
            for size in [self.group_size, self.metadata_group_size].iter() {
                if *size < MIN_GROUP_SIZE || *size > MAX_GROUP_SIZE {
                    return Err("Group sizes must be between 3 and 7");
                }
                if size % 2 == 0 {
                    return Err("Group sizes must be odd");
                }
                if *size > self.cp_member_count {
                    return Err("Group sizes must not exceed the CP member count");
                }
            }
            if self.max_cp_member_count < self.cp_member_count {
                return Err("Max CP member count must not be less than the CP member count");
            }
        }
        if self.session_heartbeat_interval >= self.session_ttl {
            return Err("Session heartbeat interval must be less than the session TTL");
        }
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.max_append_entries == 0 {
            return Err("Max AppendEntries batch size must be positive");
        }
        if self.commit_index_advance_count_to_snapshot == 0 {
            return Err("Snapshot threshold must be positive");
        }

        Ok(())
    }
}

impl TryFrom<CpOptions> for CpOptionsValidated {
    type Error = &'static str;

    fn try_from(options: CpOptions) -> Result<Self, Self::Error> {
        let cp_member_count = options.cp_member_count.unwrap_or(0);
        let group_size = options
            .group_size
            .unwrap_or_else(|| cp_member_count.min(MIN_GROUP_SIZE));
        let values = CpOptionsValidated {
            cp_member_count,
            group_size,
            metadata_group_size: options.metadata_group_size.unwrap_or(group_size),
            max_cp_member_count: options.max_cp_member_count.unwrap_or(usize::MAX),
            session_ttl: options.session_ttl.unwrap_or(Duration::from_secs(60)),
            session_heartbeat_interval: options
                .session_heartbeat_interval
                .unwrap_or(Duration::from_secs(5)),
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            append_entries_timeout: options.append_entries_timeout.unwrap_or(Duration::from_millis(300)),
            commit_index_advance_count_to_snapshot: options.commit_index_advance_count_to_snapshot.unwrap_or(1000),
            max_append_entries: options.max_append_entries.unwrap_or(64),
            operation_timeout: options.operation_timeout.unwrap_or(Duration::from_secs(60)),
            retry_backoff: options.retry_backoff.unwrap_or(Duration::from_millis(50)),
            metadata_refresh_interval: options.metadata_refresh_interval.unwrap_or(Duration::from_secs(1)),
            reference_functions: Arc::new(options.reference_functions),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        let options = CpOptionsValidated::try_from(CpOptions::default()).unwrap();
        assert!(!options.is_enabled());
        assert_eq!(options.group_size, 0);
    }

    #[test]
    fn group_sizes_follow_member_count() {
        let options = CpOptionsValidated::try_from(CpOptions {
            cp_member_count: Some(5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(options.group_size, 3);
        assert_eq!(options.metadata_group_size, 3);
        assert_eq!(options.session_ttl, Duration::from_secs(60));
    }

    #[test]
    fn rejects_bad_sizes() {
        let too_small = CpOptions {
            cp_member_count: Some(2),
            ..Default::default()
        };
        assert!(CpOptionsValidated::try_from(too_small).is_err());

        let even = CpOptions {
            cp_member_count: Some(5),
            group_size: Some(4),
            ..Default::default()
        };
        assert!(CpOptionsValidated::try_from(even).is_err());

        let oversized = CpOptions {
            cp_member_count: Some(3),
            group_size: Some(5),
            ..Default::default()
        };
        assert!(CpOptionsValidated::try_from(oversized).is_err());
    }

    #[test]
    fn rejects_bad_timeouts() {
        let options = CpOptions {
            cp_member_count: Some(3),
            session_ttl: Some(Duration::from_secs(1)),
            session_heartbeat_interval: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        assert!(CpOptionsValidated::try_from(options).is_err());

        let options = CpOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(600)),
            ..Default::default()
        };
        assert!(CpOptionsValidated::try_from(options).is_err());
    }
}
