use crate::api::{CpGroupId, CpGroupStatus, CpMember};
use crate::cp::metadata::{metadata_seed_of, MetadataState};
use crate::cp::operation::MetadataGroupInfo;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Notify;

#[derive(Default)]
struct ViewInner {
    metadata_group: Option<MetadataGroupInfo>,
    state: Option<MetadataState>,
}

/// MetadataView is this member's cached copy of the metadata group's state. It lags the group and
/// is only used to find where to send things. Every decision is made by the groups themselves.
pub(crate) struct MetadataView {
    inner: RwLock<ViewInner>,
    // Groups created under an older metadata seed were wiped by a reset. Survives `clear`.
    retired_before: AtomicU64,
    refresh_requested: Notify,
}

impl MetadataView {
    pub(crate) fn new() -> Self {
        MetadataView {
            inner: RwLock::new(ViewInner::default()),
            retired_before: AtomicU64::new(0),
            refresh_requested: Notify::new(),
        }
    }

    pub(crate) fn metadata_group(&self) -> Option<MetadataGroupInfo> {
        self.read().metadata_group.clone()
    }

    pub(crate) fn set_metadata_group(&self, info: MetadataGroupInfo) {
        self.write().metadata_group = Some(info);
    }

    pub(crate) fn state(&self) -> Option<MetadataState> {
        self.read().state.clone()
    }

    /// Returns the state it replaced.
    pub(crate) fn update_state(&self, state: MetadataState) -> Option<MetadataState> {
        let mut inner = self.write();
        if let Some(metadata) = inner.metadata_group.as_mut() {
            if let Some(group) = state.groups.iter().find(|g| g.id() == &metadata.group_id) {
                metadata.members = group.members().to_vec();
            }
        }
        inner.state.replace(state)
    }

    pub(crate) fn clear(&self) {
        *self.write() = ViewInner::default();
    }

    /// Every group created before `metadata_seed` is gone for good.
    pub(crate) fn retire_before(&self, metadata_seed: u64) {
        self.retired_before.fetch_max(metadata_seed, Ordering::SeqCst);
    }

    /// Members of `group_id`, falling back to the metadata group's known members.
    pub(crate) fn members_of(&self, group_id: &CpGroupId) -> Option<Vec<CpMember>> {
        let inner = self.read();
        if let Some(metadata) = inner.metadata_group.as_ref() {
            if &metadata.group_id == group_id {
                return Some(metadata.members.clone());
            }
        }
        inner
            .state
            .as_ref()
            .and_then(|state| state.groups.iter().find(|g| g.id() == group_id))
            .map(|group| group.members().to_vec())
    }

    pub(crate) fn is_destroyed(&self, group_id: &CpGroupId) -> bool {
        if metadata_seed_of(group_id) < self.retired_before.load(Ordering::SeqCst) {
            return true;
        }
        let inner = self.read();
        let state = match inner.state.as_ref() {
            Some(state) => state,
            None => return false,
        };
        if state.destroyed.contains(group_id) {
            return true;
        }
        match state.group_by_name(group_id.name()) {
            // A newer incarnation under the same name means this one is gone.
            Some(group) => {
                group.id().seed() > group_id.seed()
                    || (group.id() == group_id && group.status() != CpGroupStatus::Active)
            }
            None => false,
        }
    }

    pub(crate) fn cp_members(&self) -> Vec<CpMember> {
        self.read()
            .state
            .as_ref()
            .map(|state| state.cp_members.clone())
            .unwrap_or_default()
    }

    pub(crate) fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    pub(crate) async fn refresh_requested(&self) {
        self.refresh_requested.notified().await
    }

    fn read(&self) -> RwLockReadGuard<'_, ViewInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, ViewInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CpGroup;
    use crate::cp::metadata::{data_group_seed, METADATA_GROUP_NAME};
    use uuid::Uuid;

    #[test]
    fn newer_incarnation_marks_older_destroyed() {
        let member = CpMember::new(Uuid::new_v4(), "127.0.0.1:5701".parse().unwrap());
        let old = CpGroupId::new("a", 1);
        let new = CpGroupId::new("a", 7);

        let view = MetadataView::new();
        assert!(!view.is_destroyed(&old));

        view.update_state(MetadataState {
            initialized: true,
            cp_members: vec![member.clone()],
            groups: vec![CpGroup::new(new.clone(), vec![member.clone()], CpGroupStatus::Active)],
            destroyed: Vec::new(),
            pending_changes: Vec::new(),
        });
        assert!(view.is_destroyed(&old));
        assert!(!view.is_destroyed(&new));
        assert_eq!(view.members_of(&new), Some(vec![member]));
    }

    #[test]
    fn reset_retires_every_older_group() {
        let member = CpMember::new(Uuid::new_v4(), "127.0.0.1:5701".parse().unwrap());
        let old_data = CpGroupId::new("default", data_group_seed(0, 9));
        let old_metadata = CpGroupId::new(METADATA_GROUP_NAME, 0);
        let new_data = CpGroupId::new("default", data_group_seed(1, 4));

        let view = MetadataView::new();
        view.update_state(MetadataState {
            initialized: true,
            cp_members: vec![member.clone()],
            groups: vec![CpGroup::new(old_data.clone(), vec![member], CpGroupStatus::Active)],
            destroyed: Vec::new(),
            pending_changes: Vec::new(),
        });
        assert!(!view.is_destroyed(&old_data));

        view.retire_before(1);
        view.clear();
        assert!(view.is_destroyed(&old_data));
        assert!(view.is_destroyed(&old_metadata));
        assert!(!view.is_destroyed(&new_data));
        assert!(!view.is_destroyed(&CpGroupId::new(METADATA_GROUP_NAME, 1)));

        // A late duplicate of the same reset changes nothing.
        view.retire_before(0);
        assert!(view.is_destroyed(&old_data));
    }
}
