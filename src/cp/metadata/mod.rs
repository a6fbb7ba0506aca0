use crate::api::CpGroupId;

mod command;
mod state_machine;

pub(crate) use command::GroupMembershipChange;
pub(crate) use command::MetadataCommand;
pub(crate) use command::MetadataResponse;
pub(crate) use command::MetadataState;
pub(crate) use command::MetadataValue;
pub(crate) use state_machine::decode_metadata_response;
pub(crate) use state_machine::MetadataStateMachine;

/// Internal name of the group that holds CP metadata.
pub(crate) const METADATA_GROUP_NAME: &str = "METADATA";

/// Group used when a proxy name carries no `@group` part.
pub(crate) const DEFAULT_GROUP_NAME: &str = "default";

pub(crate) fn is_metadata_group_name(name: &str) -> bool {
    name.eq_ignore_ascii_case(METADATA_GROUP_NAME)
}

/// Data group seeds carry the metadata seed they were created under in their high bits, so ids
/// stay unique across resets.
pub(crate) fn data_group_seed(metadata_seed: u64, index: u64) -> u64 {
    (metadata_seed << 32) | index
}

/// The metadata seed `group_id` was created under.
pub(crate) fn metadata_seed_of(group_id: &CpGroupId) -> u64 {
    if is_metadata_group_name(group_id.name()) {
        group_id.seed()
    } else {
        group_id.seed() >> 32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_record_their_metadata_seed() {
        let before_reset = CpGroupId::new("orders", data_group_seed(0, 9));
        let after_reset = CpGroupId::new("orders", data_group_seed(1, 9));
        assert_eq!(before_reset.seed(), 9);
        assert_eq!(metadata_seed_of(&before_reset), 0);
        assert_eq!(metadata_seed_of(&after_reset), 1);
        assert_eq!(metadata_seed_of(&CpGroupId::new(METADATA_GROUP_NAME, 3)), 3);
    }
}
