use crate::api::{CpError, CpGroup, CpGroupId, CpGroupStatus, CpMember};
use crate::cp::metadata::{
    data_group_seed, is_metadata_group_name, GroupMembershipChange, MetadataCommand, MetadataResponse, MetadataState,
    MetadataValue,
};
use crate::raft::{ApplyContext, ApplyOutcome, SnapshotError, StateMachine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MetadataData {
    initialized: bool,
    group_size: usize,
    metadata_group_size: usize,
    cp_members: Vec<CpMember>,
    groups: BTreeMap<String, CpGroup>,
    destroyed: BTreeSet<CpGroupId>,
    pending_changes: Vec<GroupMembershipChange>,
}

/// MetadataStateMachine owns the CP member list and every group's id, members and status.
pub(crate) struct MetadataStateMachine {
    logger: slog::Logger,
    group_id: CpGroupId,
    data: MetadataData,
}

impl MetadataStateMachine {
    pub(crate) fn new(logger: slog::Logger, group_id: CpGroupId) -> Self {
        MetadataStateMachine {
            logger,
            group_id,
            data: MetadataData {
                initialized: false,
                group_size: 0,
                metadata_group_size: 0,
                cp_members: Vec::new(),
                groups: BTreeMap::new(),
                destroyed: BTreeSet::new(),
                pending_changes: Vec::new(),
            },
        }
    }

    fn apply_command(&mut self, context: &ApplyContext, command: MetadataCommand) -> MetadataResponse {
        if let MetadataCommand::InitMetadata {
            cp_members,
            metadata_members,
            group_size,
        } = command
        {
            return self.init(cp_members, metadata_members, group_size);
        }
        if !self.data.initialized {
            return Err(CpError::DiscoveryIncomplete);
        }

        match command {
            MetadataCommand::InitMetadata { .. } => Err(CpError::IllegalState("Unreachable".into())),
            MetadataCommand::GetState => Ok(MetadataValue::State(self.state())),
            MetadataCommand::GetOrCreateGroup { name } => self.get_or_create_group(context, name),
            MetadataCommand::ForceDestroyGroup { name } => self.force_destroy_group(name),
            MetadataCommand::CompleteDestroyGroup { group_id } => self.complete_destroy_group(group_id),
            MetadataCommand::AddCpMember {
                member,
                max_cp_member_count,
            } => self.add_cp_member(member, max_cp_member_count),
            MetadataCommand::RemoveCpMember { member } => self.remove_cp_member(member),
            MetadataCommand::CompleteMembershipChange { group_id, members } => {
                self.complete_membership_change(group_id, members)
            }
        }
    }

    fn init(
        &mut self,
        cp_members: Vec<CpMember>,
        metadata_members: Vec<CpMember>,
        group_size: usize,
    ) -> MetadataResponse {
        if self.data.initialized {
            // Every discovered CP member proposes the same list. Later proposals are no-ops.
            return Ok(MetadataValue::State(self.state()));
        }
        if metadata_members.is_empty() || metadata_members.iter().any(|m| !cp_members.contains(m)) {
            return Err(CpError::IllegalArgument(
                "Metadata members must be a non-empty subset of the CP members".into(),
            ));
        }

        slog::info!(
            self.logger,
            "Initialized CP metadata with {} CP members and metadata group {:?}",
            cp_members.len(),
            metadata_members.iter().map(|m| m.uuid()).collect::<Vec<_>>()
        );
        self.data.initialized = true;
        self.data.group_size = group_size;
        self.data.metadata_group_size = metadata_members.len();
        self.data.cp_members = cp_members;
        self.data.groups.insert(
            self.group_id.name().to_string(),
            CpGroup::new(self.group_id.clone(), metadata_members, CpGroupStatus::Active),
        );
        Ok(MetadataValue::State(self.state()))
    }

    fn get_or_create_group(&mut self, context: &ApplyContext, name: String) -> MetadataResponse {
        if name.is_empty() || is_metadata_group_name(&name) {
            return Err(CpError::IllegalArgument(format!("'{}' is not a valid CP group name", name)));
        }

        if let Some(group) = self.data.groups.get(&name) {
            match group.status() {
                CpGroupStatus::Active => return Ok(MetadataValue::Group(group.clone())),
                CpGroupStatus::Destroying => {
                    return Err(CpError::IllegalState(format!("CP group {} is being destroyed", group.id())))
                }
                CpGroupStatus::Destroyed => {}
            }
        }

        let members = self.least_loaded_members(self.data.group_size, &[]);
        if members.is_empty() {
            return Err(CpError::IllegalState("No CP members to host the group".into()));
        }

        let seed = data_group_seed(self.group_id.seed(), context.index.as_u64());
        let group = CpGroup::new(CpGroupId::new(name.clone(), seed), members, CpGroupStatus::Active);
        slog::info!(
            self.logger,
            "Created CP group {} on {:?}",
            group.id(),
            group.members().iter().map(|m| m.uuid()).collect::<Vec<_>>()
        );
        self.data.groups.insert(name, group.clone());
        Ok(MetadataValue::Group(group))
    }

    fn force_destroy_group(&mut self, name: String) -> MetadataResponse {
        if is_metadata_group_name(&name) {
            return Err(CpError::IllegalArgument("The metadata group cannot be destroyed".into()));
        }
        let group = self
            .data
            .groups
            .get_mut(&name)
            .ok_or_else(|| CpError::GroupNotFound(name.clone()))?;

        if group.status() == CpGroupStatus::Active {
            slog::warn!(self.logger, "Force destroying CP group {}", group.id());
            *group = CpGroup::new(group.id().clone(), group.members().to_vec(), CpGroupStatus::Destroying);
        }
        let group = group.clone();
        self.data.pending_changes.retain(|c| &c.group_id != group.id());
        Ok(MetadataValue::Group(group))
    }

    fn complete_destroy_group(&mut self, group_id: CpGroupId) -> MetadataResponse {
        if let Some(group) = self.data.groups.get_mut(group_id.name()) {
            if group.id() == &group_id && group.status() != CpGroupStatus::Destroyed {
                *group = CpGroup::new(group_id.clone(), group.members().to_vec(), CpGroupStatus::Destroyed);
                slog::info!(self.logger, "CP group {} is destroyed", group_id);
            }
        }
        self.data.destroyed.insert(group_id);
        Ok(MetadataValue::None)
    }

    fn add_cp_member(&mut self, member: CpMember, max_cp_member_count: usize) -> MetadataResponse {
        if self.data.cp_members.iter().any(|m| m.uuid() == member.uuid()) {
            return Ok(MetadataValue::Changes(self.data.pending_changes.clone()));
        }
        if !self.data.pending_changes.is_empty() {
            return Err(CpError::IllegalState("Another CP membership change is in progress".into()));
        }
        if self.data.cp_members.len() >= max_cp_member_count {
            return Err(CpError::IllegalState(format!(
                "Max CP member count {} is reached",
                max_cp_member_count
            )));
        }

        slog::info!(self.logger, "Adding CP member {:?}", member);
        self.data.cp_members.push(member.clone());

        // Groups left short by an earlier removal get the new member.
        let mut changes = Vec::new();
        for group in self.data.groups.values() {
            let target = if group.id() == &self.group_id {
                self.data.metadata_group_size
            } else {
                self.data.group_size
            };
            if group.status() == CpGroupStatus::Active && group.members().len() < target {
                let mut after = group.members().to_vec();
                after.push(member.clone());
                changes.push(GroupMembershipChange {
                    group_id: group.id().clone(),
                    members_before: group.members().to_vec(),
                    members_after: after,
                });
            }
        }
        self.data.pending_changes = changes.clone();
        Ok(MetadataValue::Changes(changes))
    }

    fn remove_cp_member(&mut self, member: Uuid) -> MetadataResponse {
        if !self.data.cp_members.iter().any(|m| m.uuid() == member) {
            return Ok(MetadataValue::Changes(self.data.pending_changes.clone()));
        }
        if !self.data.pending_changes.is_empty() {
            return Err(CpError::IllegalState("Another CP membership change is in progress".into()));
        }

        slog::info!(self.logger, "Removing CP member {}", member);
        self.data.cp_members.retain(|m| m.uuid() != member);

        let affected: Vec<CpGroup> = self
            .data
            .groups
            .values()
            .filter(|g| g.status() == CpGroupStatus::Active && g.contains(&member))
            .cloned()
            .collect();

        let mut changes = Vec::new();
        for group in affected {
            let mut after: Vec<CpMember> = group.members().iter().filter(|m| m.uuid() != member).cloned().collect();
            let replacement = self.least_loaded_members(1, &after).into_iter().next();
            if let Some(replacement) = replacement {
                after.push(replacement);
            }
            changes.push(GroupMembershipChange {
                group_id: group.id().clone(),
                members_before: group.members().to_vec(),
                members_after: after,
            });
        }
        self.data.pending_changes = changes.clone();
        Ok(MetadataValue::Changes(changes))
    }

    fn complete_membership_change(&mut self, group_id: CpGroupId, members: Vec<CpMember>) -> MetadataResponse {
        if let Some(group) = self.data.groups.get_mut(group_id.name()) {
            if group.id() == &group_id && group.status() == CpGroupStatus::Active {
                *group = CpGroup::new(group_id.clone(), members, CpGroupStatus::Active);
            }
        }
        self.data.pending_changes.retain(|c| c.group_id != group_id);
        Ok(MetadataValue::None)
    }

    /// Up to `count` CP members outside `exclude`, fewest hosted groups first, ties by uuid.
    fn least_loaded_members(&self, count: usize, exclude: &[CpMember]) -> Vec<CpMember> {
        let mut load: HashMap<Uuid, usize> = HashMap::new();
        for group in self.data.groups.values() {
            if group.status() == CpGroupStatus::Destroyed {
                continue;
            }
            for m in group.members() {
                *load.entry(m.uuid()).or_insert(0) += 1;
            }
        }

        let mut candidates: Vec<&CpMember> = self
            .data
            .cp_members
            .iter()
            .filter(|m| !exclude.iter().any(|e| e.uuid() == m.uuid()))
            .collect();
        candidates.sort_by_key(|m| (load.get(&m.uuid()).copied().unwrap_or(0), m.uuid()));
        candidates.into_iter().take(count).cloned().collect()
    }

    fn state(&self) -> MetadataState {
        MetadataState {
            initialized: self.data.initialized,
            cp_members: self.data.cp_members.clone(),
            groups: self.data.groups.values().cloned().collect(),
            destroyed: self.data.destroyed.iter().cloned().collect(),
            pending_changes: self.data.pending_changes.clone(),
        }
    }
}

impl StateMachine for MetadataStateMachine {
    fn apply(&mut self, context: &ApplyContext, command: &[u8]) -> ApplyOutcome {
        let response = match bincode::deserialize(command) {
            Ok(command) => self.apply_command(context, command),
            Err(e) => Err(CpError::from(e)),
        };
        ApplyOutcome::response(encode_response(&response))
    }

    fn take_snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        bincode::serialize(&self.data).map_err(|e| SnapshotError(e.to_string()))
    }

    fn restore_snapshot(&mut self, snapshot: &[u8]) -> Result<(), SnapshotError> {
        self.data = bincode::deserialize(snapshot).map_err(|e| SnapshotError(e.to_string()))?;
        Ok(())
    }
}

fn encode_response(response: &MetadataResponse) -> Bytes {
    bincode::serialize(response).map(Bytes::from).unwrap_or_default()
}

pub(crate) fn decode_metadata_response(bytes: &[u8]) -> MetadataResponse {
    bincode::deserialize(bytes).map_err(CpError::from)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::Index;
    use crate::cp::metadata::METADATA_GROUP_NAME;
    use crate::raft::Applied;

    struct Harness {
        sm: MetadataStateMachine,
        index: u64,
    }

    impl Harness {
        fn new() -> Self {
            let logger = slog::Logger::root(slog::Discard, slog::o!());
            Harness {
                sm: MetadataStateMachine::new(logger, CpGroupId::new(METADATA_GROUP_NAME, 0)),
                index: 0,
            }
        }

        fn apply(&mut self, command: MetadataCommand) -> MetadataResponse {
            self.index += 1;
            let context = ApplyContext {
                index: Index::new(self.index),
                timestamp_millis: 0,
            };
            let outcome = self.sm.apply(&context, &bincode::serialize(&command).unwrap());
            match outcome.applied {
                Applied::Response(bytes) => decode_metadata_response(&bytes),
                Applied::Parked => panic!("metadata commands never park"),
            }
        }

        fn init(&mut self, members: &[CpMember]) {
            self.apply(MetadataCommand::InitMetadata {
                cp_members: members.to_vec(),
                metadata_members: members[..3].to_vec(),
                group_size: 3,
            })
            .unwrap();
        }
    }

    fn members(n: u128) -> Vec<CpMember> {
        (1..=n)
            .map(|i| CpMember::new(Uuid::from_u128(i), format!("127.0.0.1:{}", 5700 + i).parse().unwrap()))
            .collect()
    }

    fn create(h: &mut Harness, name: &str) -> CpGroup {
        h.apply(MetadataCommand::GetOrCreateGroup { name: name.into() })
            .unwrap()
            .into_group()
            .unwrap()
    }

    #[test]
    fn commands_before_init_are_rejected() {
        let mut h = Harness::new();
        assert_eq!(
            h.apply(MetadataCommand::GetOrCreateGroup { name: "a".into() }),
            Err(CpError::DiscoveryIncomplete)
        );
    }

    #[test]
    fn groups_spread_over_least_loaded_members() {
        let members = members(4);
        let mut h = Harness::new();
        h.init(&members);

        // Metadata group lives on 1, 2, 3. Member 4 is idle.
        let group = create(&mut h, "a");
        assert!(group.contains(&members[3].uuid()));
        assert_eq!(group.members().len(), 3);
        assert_eq!(create(&mut h, "a"), group);
    }

    #[test]
    fn destroyed_group_is_recreated_with_new_seed() {
        let members = members(3);
        let mut h = Harness::new();
        h.init(&members);

        let first = create(&mut h, "a");
        let destroying = h
            .apply(MetadataCommand::ForceDestroyGroup { name: "a".into() })
            .unwrap()
            .into_group()
            .unwrap();
        assert_eq!(destroying.status(), CpGroupStatus::Destroying);
        assert!(matches!(
            h.apply(MetadataCommand::GetOrCreateGroup { name: "a".into() }),
            Err(CpError::IllegalState(_))
        ));

        h.apply(MetadataCommand::CompleteDestroyGroup {
            group_id: first.id().clone(),
        })
        .unwrap();
        let second = create(&mut h, "a");
        assert_ne!(first.id(), second.id());
        assert_eq!(first.id().name(), second.id().name());

        let state = h.apply(MetadataCommand::GetState).unwrap().into_state().unwrap();
        assert_eq!(state.destroyed, vec![first.id().clone()]);
    }

    #[test]
    fn metadata_group_is_reserved() {
        let mut h = Harness::new();
        h.init(&members(3));
        assert!(matches!(
            h.apply(MetadataCommand::GetOrCreateGroup {
                name: "Metadata".into()
            }),
            Err(CpError::IllegalArgument(_))
        ));
        assert!(matches!(
            h.apply(MetadataCommand::ForceDestroyGroup {
                name: METADATA_GROUP_NAME.into()
            }),
            Err(CpError::IllegalArgument(_))
        ));
        assert_eq!(
            h.apply(MetadataCommand::ForceDestroyGroup { name: "nope".into() }),
            Err(CpError::GroupNotFound("nope".into()))
        );
    }

    #[test]
    fn removed_member_is_replaced() {
        let members = members(4);
        let mut h = Harness::new();
        h.init(&members);
        let group = create(&mut h, "a");
        let leaving = group.members()[0].clone();

        let changes = h
            .apply(MetadataCommand::RemoveCpMember { member: leaving.uuid() })
            .unwrap()
            .into_changes()
            .unwrap();
        let change = changes.iter().find(|c| c.group_id == *group.id()).unwrap();
        assert_eq!(change.members_after.len(), 3);
        assert!(!change.members_after.contains(&leaving));

        // One membership change at a time.
        assert!(matches!(
            h.apply(MetadataCommand::RemoveCpMember {
                member: members[1].uuid()
            }),
            Err(CpError::IllegalState(_))
        ));

        for change in changes {
            h.apply(MetadataCommand::CompleteMembershipChange {
                group_id: change.group_id,
                members: change.members_after,
            })
            .unwrap();
        }
        let state = h.apply(MetadataCommand::GetState).unwrap().into_state().unwrap();
        assert!(state.pending_changes.is_empty());
        assert_eq!(state.cp_members.len(), 3);
        assert!(!state.group_by_name("a").unwrap().contains(&leaving.uuid()));
    }

    #[test]
    fn promoted_member_fills_short_groups() {
        let members = members(4);
        let mut h = Harness::new();
        h.init(&members[..3]);
        create(&mut h, "a");

        // No replacement available: groups shrink.
        let changes = h
            .apply(MetadataCommand::RemoveCpMember {
                member: members[0].uuid(),
            })
            .unwrap()
            .into_changes()
            .unwrap();
        assert!(changes.iter().all(|c| c.members_after.len() == 2));
        for change in changes {
            h.apply(MetadataCommand::CompleteMembershipChange {
                group_id: change.group_id,
                members: change.members_after,
            })
            .unwrap();
        }

        let changes = h
            .apply(MetadataCommand::AddCpMember {
                member: members[3].clone(),
                max_cp_member_count: 10,
            })
            .unwrap()
            .into_changes()
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.members_after.contains(&members[3])));

        assert!(matches!(
            h.apply(MetadataCommand::AddCpMember {
                member: members[0].clone(),
                max_cp_member_count: 3,
            }),
            Err(CpError::IllegalState(_))
        ));
    }
}
