use crate::api::{
    AvailabilityChange, ClusterEvent, ClusterMembership, CpError, CpGroup, CpGroupAvailabilityEvent, CpGroupId,
    CpGroupStatus, CpMember, CpOptionsValidated, ListenerRegistry, MembershipEvent,
};
use crate::cp::invocation::InvocationManager;
use crate::cp::metadata::{
    is_metadata_group_name, GroupMembershipChange, MetadataCommand, MetadataState, METADATA_GROUP_NAME,
};
use crate::cp::operation::{decode, InvokeResult, MetadataGroupInfo, Operation};
use crate::cp::registry::RaftNodeRegistry;
use crate::cp::view::MetadataView;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Duration;
use uuid::Uuid;

/// CpGroupManager runs this member's side of CP metadata: discovery of the metadata group,
/// creation and destruction of groups, CP membership changes, and the events that come out of
/// watching the metadata group's state.
pub(crate) struct CpGroupManager {
    logger: slog::Logger,
    me: CpMember,
    options: CpOptionsValidated,
    cluster: ClusterMembership,
    registry: Arc<RaftNodeRegistry>,
    invocation: Arc<InvocationManager>,
    view: Arc<MetadataView>,
    membership_listeners: ListenerRegistry<MembershipEvent>,
    availability_listeners: ListenerRegistry<CpGroupAvailabilityEvent>,
    discovered: watch::Sender<bool>,
    discovered_rx: watch::Receiver<bool>,
    metadata_seed: AtomicU64,
    // Unreachable members last reported for each group.
    unavailable: Mutex<HashMap<CpGroupId, HashSet<Uuid>>>,
    // One membership change or destroy at a time from this member.
    changing: tokio::sync::Mutex<()>,
}

impl CpGroupManager {
    pub(crate) fn new(
        logger: slog::Logger,
        me: CpMember,
        options: CpOptionsValidated,
        cluster: ClusterMembership,
        registry: Arc<RaftNodeRegistry>,
        invocation: Arc<InvocationManager>,
    ) -> Self {
        let (discovered, discovered_rx) = watch::channel(false);
        let view = invocation.view().clone();
        CpGroupManager {
            logger,
            me,
            options,
            cluster,
            registry,
            invocation,
            view,
            membership_listeners: ListenerRegistry::new(),
            availability_listeners: ListenerRegistry::new(),
            discovered,
            discovered_rx,
            metadata_seed: AtomicU64::new(0),
            unavailable: Mutex::new(HashMap::new()),
            changing: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn membership_listeners(&self) -> &ListenerRegistry<MembershipEvent> {
        &self.membership_listeners
    }

    pub(crate) fn availability_listeners(&self) -> &ListenerRegistry<CpGroupAvailabilityEvent> {
        &self.availability_listeners
    }

    pub(crate) fn is_discovery_completed(&self) -> bool {
        *self.discovered_rx.borrow()
    }

    /// Returns whether discovery completed within `timeout`.
    pub(crate) async fn await_discovery_completed(&self, timeout: Duration) -> bool {
        let mut rx = self.discovered_rx.clone();
        let completed = async {
            loop {
                if *rx.borrow() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, completed).await.unwrap_or(false)
    }

    fn ensure_discovered(&self) -> Result<(), CpError> {
        if self.is_discovery_completed() {
            Ok(())
        } else {
            Err(CpError::DiscoveryIncomplete)
        }
    }

    /// CP members according to the metadata group, read through its leader.
    pub(crate) async fn cp_members(&self) -> Result<Vec<CpMember>, CpError> {
        Ok(self.fetch_state().await?.cp_members)
    }

    pub(crate) fn local_cp_member(&self) -> Option<CpMember> {
        let members = self.view.cp_members();
        members.into_iter().find(|m| m.uuid() == self.me.uuid())
    }

    pub(crate) async fn group_ids(&self) -> Result<Vec<CpGroupId>, CpError> {
        let state = self.fetch_state().await?;
        Ok(state.active_groups().map(|g| g.id().clone()).collect())
    }

    pub(crate) async fn group(&self, name: &str) -> Result<Option<CpGroup>, CpError> {
        let state = self.fetch_state().await?;
        if is_metadata_group_name(name) {
            return Ok(state.group_by_name(METADATA_GROUP_NAME).cloned());
        }
        Ok(state.group_by_name(name).cloned())
    }

    async fn fetch_state(&self) -> Result<MetadataState, CpError> {
        self.ensure_discovered()?;
        let state = self
            .invocation
            .invoke_metadata(&MetadataCommand::GetState)
            .await?
            .into_state()?;
        self.apply_state(state.clone()).await;
        Ok(state)
    }

    /// Returns the active group called `name`, creating it and its RaftNodes if needed.
    pub(crate) async fn get_or_create_group(&self, name: &str) -> Result<CpGroup, CpError> {
        self.ensure_discovered()?;
        let group = self
            .invocation
            .invoke_metadata(&MetadataCommand::GetOrCreateGroup { name: name.to_string() })
            .await?
            .into_group()?;

        for member in group.members() {
            let operation = Operation::CreateRaftNode {
                group_id: group.id().clone(),
                members: group.members().to_vec(),
            };
            // Members that miss this pick the group up from the metadata watcher.
            if let Err(e) = self.invocation.send(member, &operation).await {
                slog::warn!(self.logger, "Could not start {} on {}: {}", group.id(), member.uuid(), e);
            }
        }
        Ok(group)
    }

    pub(crate) async fn force_destroy_group(&self, name: &str) -> Result<(), CpError> {
        self.ensure_discovered()?;
        let _changing = self.changing.lock().await;
        let group = self
            .invocation
            .invoke_metadata(&MetadataCommand::ForceDestroyGroup { name: name.to_string() })
            .await?
            .into_group()?;
        self.complete_destroy(&group).await?;
        self.view.request_refresh();
        Ok(())
    }

    async fn complete_destroy(&self, group: &CpGroup) -> Result<(), CpError> {
        if group.status() == CpGroupStatus::Destroyed {
            return Ok(());
        }
        for member in group.members() {
            let operation = Operation::DestroyRaftNode {
                group_id: group.id().clone(),
            };
            if let Err(e) = self.invocation.send(member, &operation).await {
                slog::warn!(self.logger, "Could not stop {} on {}: {}", group.id(), member.uuid(), e);
            }
        }
        self.invocation
            .invoke_metadata(&MetadataCommand::CompleteDestroyGroup {
                group_id: group.id().clone(),
            })
            .await?;
        Ok(())
    }

    pub(crate) async fn promote_to_cp_member(&self) -> Result<(), CpError> {
        self.ensure_discovered()?;
        let _changing = self.changing.lock().await;
        let changes = self
            .invocation
            .invoke_metadata(&MetadataCommand::AddCpMember {
                member: self.me.clone(),
                max_cp_member_count: self.options.max_cp_member_count,
            })
            .await?
            .into_changes()?;
        slog::info!(self.logger, "Promoted to CP member. {} groups to join.", changes.len());
        self.execute_changes(changes).await?;
        self.view.request_refresh();
        Ok(())
    }

    pub(crate) async fn remove_cp_member(&self, member: Uuid) -> Result<(), CpError> {
        self.ensure_discovered()?;
        let _changing = self.changing.lock().await;
        let changes = self
            .invocation
            .invoke_metadata(&MetadataCommand::RemoveCpMember { member })
            .await?
            .into_changes()?;
        slog::info!(self.logger, "Removing CP member {} from {} groups", member, changes.len());
        self.execute_changes(changes).await?;
        self.view.request_refresh();
        Ok(())
    }

    /// Moves each group to its new member list, one server at a time.
    async fn execute_changes(&self, changes: Vec<GroupMembershipChange>) -> Result<(), CpError> {
        for change in changes {
            let removed: Vec<CpMember> = change
                .members_before
                .iter()
                .filter(|m| !change.members_after.contains(m))
                .cloned()
                .collect();
            let added: Vec<CpMember> = change
                .members_after
                .iter()
                .filter(|m| !change.members_before.contains(m))
                .cloned()
                .collect();

            let mut members = change.members_before.clone();
            for member in added {
                // The new node starts from the old configuration and catches up from the leader.
                let create = Operation::CreateRaftNode {
                    group_id: change.group_id.clone(),
                    members: change.members_before.clone(),
                };
                expect_ok(self.invocation.send(&member, &create).await?)?;
                members.push(member);
                self.invocation
                    .change_membership(&change.group_id, members.clone())
                    .await?;
            }
            for member in removed {
                members.retain(|m| m.uuid() != member.uuid());
                self.invocation
                    .change_membership(&change.group_id, members.clone())
                    .await?;
                let leave = Operation::LeaveRaftNode {
                    group_id: change.group_id.clone(),
                };
                if let Err(e) = self.invocation.send(&member, &leave).await {
                    slog::debug!(self.logger, "{} did not leave {}: {}", member.uuid(), change.group_id, e);
                }
            }

            self.invocation
                .invoke_metadata(&MetadataCommand::CompleteMembershipChange {
                    group_id: change.group_id.clone(),
                    members,
                })
                .await?;
            slog::info!(self.logger, "Membership change of {} completed", change.group_id);
        }
        Ok(())
    }

    /// Wipes all CP state on every platform member and bootstraps a new metadata group.
    pub(crate) async fn reset(&self) -> Result<(), CpError> {
        let seed = self.metadata_seed.load(Ordering::SeqCst) + 1;
        slog::warn!(self.logger, "Resetting CP Subsystem. New metadata seed: {}", seed);
        for member in self.cluster.members() {
            let operation = Operation::Reset { metadata_seed: seed };
            expect_ok(self.invocation.send(&member, &operation).await?)?;
        }
        Ok(())
    }

    /// Discovery, then the metadata watcher. Runs until aborted or the reset channel closes.
    pub(crate) async fn run(self: Arc<Self>, mut resets: mpsc::UnboundedReceiver<u64>) {
        let mut cluster_events = self.cluster.subscribe();
        self.discover(0).await;

        loop {
            tokio::select! {
                seed = resets.recv() => match seed {
                    Some(seed) => self.handle_reset(seed).await,
                    None => return,
                },
                event = cluster_events.recv() => match event {
                    Ok(ClusterEvent::Joined(member)) => {
                        slog::debug!(self.logger, "Platform member joined: {}", member.uuid());
                        self.evaluate_availability();
                    }
                    Ok(ClusterEvent::Left(member)) => {
                        slog::debug!(self.logger, "Platform member left: {}", member.uuid());
                        self.evaluate_availability();
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => self.evaluate_availability(),
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                _ = self.view.refresh_requested() => self.refresh().await,
                _ = tokio::time::sleep(self.options.metadata_refresh_interval) => self.refresh().await,
            }
        }
    }

    async fn handle_reset(&self, seed: u64) {
        if seed <= self.metadata_seed.load(Ordering::SeqCst) {
            slog::info!(self.logger, "Ignoring stale reset to seed {}", seed);
            return;
        }
        let _ = self.discovered.send(false);
        self.view.retire_before(seed);
        self.registry.reset(seed).await;
        self.view.clear();
        self.unavailable_lock().clear();
        self.discover(seed).await;
    }

    /// Finds or bootstraps the metadata group for `seed` and waits until it answers.
    async fn discover(&self, seed: u64) {
        slog::info!(self.logger, "Starting CP discovery with metadata seed {}", seed);
        loop {
            if self.view.metadata_group().is_none() {
                if let Some(info) = self.ask_peers_for_metadata(seed).await {
                    self.adopt_metadata(info).await;
                }
            }
            self.bootstrap_metadata(seed).await;

            if self.view.metadata_group().is_some() {
                match self.invocation.invoke_metadata(&MetadataCommand::GetState).await {
                    Ok(value) => match value.into_state() {
                        Ok(state) if state.initialized => {
                            self.apply_state(state).await;
                            let cp_members = self.view.cp_members().len();
                            slog::info!(self.logger, "CP discovery completed with {} CP members", cp_members);
                            let _ = self.discovered.send(true);
                            return;
                        }
                        _ => {}
                    },
                    Err(e) => slog::debug!(self.logger, "Metadata group is not ready yet: {}", e),
                }
            }
            tokio::time::sleep(self.options.metadata_refresh_interval).await;
        }
    }

    async fn ask_peers_for_metadata(&self, seed: u64) -> Option<MetadataGroupInfo> {
        for member in self.cluster.members() {
            if member.uuid() == self.me.uuid() {
                continue;
            }
            let described = match self.invocation.send(&member, &Operation::DescribeMetadata).await {
                Ok(InvokeResult::Ok(bytes)) => decode::<Option<MetadataGroupInfo>>(&bytes),
                Ok(other) => {
                    slog::debug!(self.logger, "{} cannot describe metadata: {:?}", member.uuid(), other);
                    continue;
                }
                Err(e) => {
                    slog::debug!(self.logger, "{} cannot describe metadata: {}", member.uuid(), e);
                    continue;
                }
            };
            if let Ok(Some(info)) = described {
                if info.group_id.seed() >= seed {
                    return Some(info);
                }
            }
        }
        None
    }

    async fn adopt_metadata(&self, info: MetadataGroupInfo) {
        self.metadata_seed.store(info.group_id.seed(), Ordering::SeqCst);
        if info.members.iter().any(|m| m.uuid() == self.me.uuid()) {
            if let Err(e) = self.registry.create_node(&info.group_id, info.members.clone()) {
                slog::warn!(self.logger, "Could not start {}: {}", info.group_id, e);
            }
        }
        self.view.set_metadata_group(info);
    }

    /// The first `cp_member_count` platform members form the CP member list, and the first of
    /// those form the metadata group. Each of them proposes the same initial metadata.
    async fn bootstrap_metadata(&self, seed: u64) {
        let platform_members = self.cluster.members();
        if platform_members.len() < self.options.cp_member_count {
            slog::debug!(
                self.logger,
                "Waiting for {} platform members, have {}",
                self.options.cp_member_count,
                platform_members.len()
            );
            return;
        }

        let cp_members: Vec<CpMember> = platform_members
            .into_iter()
            .take(self.options.cp_member_count)
            .collect();
        if !cp_members.iter().any(|m| m.uuid() == self.me.uuid()) {
            // Not a CP member. Wait for one of them to publish the metadata group.
            return;
        }
        let metadata_members: Vec<CpMember> = cp_members
            .iter()
            .take(self.options.metadata_group_size)
            .cloned()
            .collect();
        let info = MetadataGroupInfo {
            group_id: CpGroupId::new(METADATA_GROUP_NAME, seed),
            members: metadata_members.clone(),
        };

        match self.view.metadata_group() {
            None => self.adopt_metadata(info).await,
            // Someone else's newer metadata group. They initialize it.
            Some(adopted) if adopted.group_id != info.group_id => return,
            Some(_) => {}
        }

        let init = MetadataCommand::InitMetadata {
            cp_members,
            metadata_members,
            group_size: self.options.group_size,
        };
        if let Err(e) = self.invocation.invoke_metadata(&init).await {
            slog::debug!(self.logger, "Metadata initialization not committed yet: {}", e);
        }
    }

    async fn refresh(&self) {
        if !self.is_discovery_completed() {
            return;
        }
        match self.invocation.invoke_metadata(&MetadataCommand::GetState).await {
            Ok(value) => match value.into_state() {
                Ok(state) => {
                    self.apply_state(state).await;
                    self.finish_leftovers().await;
                }
                Err(e) => slog::warn!(self.logger, "Unexpected metadata reply: {}", e),
            },
            Err(e) => slog::debug!(self.logger, "Metadata refresh failed: {}", e),
        }
    }

    async fn apply_state(&self, state: MetadataState) {
        let previous = self.view.update_state(state.clone());
        if let Some(previous) = previous {
            self.fire_membership_events(&previous, &state);
        }
        self.reconcile_local_nodes(&state).await;
        self.evaluate_availability();
    }

    fn fire_membership_events(&self, previous: &MetadataState, current: &MetadataState) {
        for member in &current.cp_members {
            if !previous.cp_members.iter().any(|m| m.uuid() == member.uuid()) {
                slog::info!(self.logger, "CP member added: {:?}", member);
                self.membership_listeners
                    .fire(&MembershipEvent::MemberAdded(member.clone()));
            }
        }
        for member in &previous.cp_members {
            if !current.cp_members.iter().any(|m| m.uuid() == member.uuid()) {
                slog::info!(self.logger, "CP member removed: {:?}", member);
                self.membership_listeners
                    .fire(&MembershipEvent::MemberRemoved(member.clone()));
            }
        }
    }

    /// Starts nodes for groups this member should host and stops the rest.
    async fn reconcile_local_nodes(&self, state: &MetadataState) {
        let changing: HashSet<&CpGroupId> = state.pending_changes.iter().map(|c| &c.group_id).collect();
        let me = self.me.uuid();

        for group in &state.groups {
            if changing.contains(group.id()) {
                continue;
            }
            let running = self.registry.node(group.id()).is_ok();
            match group.status() {
                CpGroupStatus::Active if group.contains(&me) && !running => {
                    if let Err(e) = self.registry.create_node(group.id(), group.members().to_vec()) {
                        slog::debug!(self.logger, "Not starting {}: {}", group.id(), e);
                    }
                }
                CpGroupStatus::Active if !group.contains(&me) && running => {
                    self.registry.leave_node(group.id()).await;
                }
                CpGroupStatus::Destroying | CpGroupStatus::Destroyed if running => {
                    self.registry.destroy_node(group.id()).await;
                }
                _ => {}
            }
        }

        for group_id in self.registry.group_ids() {
            if state.destroyed.contains(&group_id) || self.view.is_destroyed(&group_id) {
                self.registry.destroy_node(&group_id).await;
            }
        }
    }

    /// The metadata leader finishes destroys and membership changes whose caller gave up.
    async fn finish_leftovers(&self) {
        let metadata = match self.view.metadata_group() {
            Some(metadata) => metadata,
            None => return,
        };
        if !self.registry.is_leader_of(&metadata.group_id) {
            return;
        }
        let _changing = match self.changing.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let state = match self.view.state() {
            Some(state) => state,
            None => return,
        };

        for group in state.groups.iter().filter(|g| g.status() == CpGroupStatus::Destroying) {
            slog::info!(self.logger, "Completing destroy of {}", group.id());
            if let Err(e) = self.complete_destroy(group).await {
                slog::warn!(self.logger, "Could not complete destroy of {}: {}", group.id(), e);
            }
        }
        if !state.pending_changes.is_empty() {
            if let Err(e) = self.execute_changes(state.pending_changes.clone()).await {
                slog::warn!(self.logger, "Could not complete membership changes: {}", e);
            }
        }
    }

    fn evaluate_availability(&self) {
        let state = match self.view.state() {
            Some(state) => state,
            None => return,
        };
        let platform: HashSet<Uuid> = self.cluster.members().iter().map(|m| m.uuid()).collect();

        let mut events = Vec::new();
        {
            let mut reported = self.unavailable_lock();
            for group in state.active_groups() {
                let now: HashSet<Uuid> = group
                    .members()
                    .iter()
                    .map(|m| m.uuid())
                    .filter(|uuid| !platform.contains(uuid))
                    .collect();
                let before = reported.get(group.id()).cloned().unwrap_or_default();
                if let Some(change) = availability_change(group.members().len(), &before, &now) {
                    events.push(CpGroupAvailabilityEvent {
                        group_id: group.id().clone(),
                        members: group.members().to_vec(),
                        unavailable_members: group
                            .members()
                            .iter()
                            .filter(|m| now.contains(&m.uuid()))
                            .cloned()
                            .collect(),
                        change,
                    });
                }
                if now.is_empty() {
                    reported.remove(group.id());
                } else {
                    reported.insert(group.id().clone(), now);
                }
            }
        }

        for event in events {
            slog::warn!(
                self.logger,
                "Availability of {} changed: {:?}, unavailable: {:?}",
                event.group_id,
                event.change,
                event.unavailable_members.iter().map(|m| m.uuid()).collect::<Vec<_>>()
            );
            self.availability_listeners.fire(&event);
        }
    }

    fn unavailable_lock(&self) -> std::sync::MutexGuard<'_, HashMap<CpGroupId, HashSet<Uuid>>> {
        match self.unavailable.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn expect_ok(result: InvokeResult) -> Result<Vec<u8>, CpError> {
    match result {
        InvokeResult::Ok(bytes) => Ok(bytes),
        InvokeResult::Failed(e) => Err(e),
        other => Err(CpError::IllegalState(format!("Unexpected reply {:?}", other))),
    }
}

/// What changed, if anything worth reporting, when a group's unreachable members go from `before`
/// to `now`.
fn availability_change(group_size: usize, before: &HashSet<Uuid>, now: &HashSet<Uuid>) -> Option<AvailabilityChange> {
    if now.is_empty() {
        return if before.is_empty() {
            None
        } else {
            Some(AvailabilityChange::Restored)
        };
    }
    let majority = group_size / 2 + 1;
    let lost_before = group_size.saturating_sub(before.len()) < majority;
    let lost_now = group_size.saturating_sub(now.len()) < majority;
    if lost_before && !lost_now {
        return Some(AvailabilityChange::MajorityRegained);
    }
    if !now.iter().any(|uuid| !before.contains(uuid)) {
        return None;
    }
    if lost_now {
        Some(AvailabilityChange::MajorityLost)
    } else {
        Some(AvailabilityChange::Decreased)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_transitions() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let none = HashSet::new();
        let one: HashSet<Uuid> = [a].iter().copied().collect();
        let two: HashSet<Uuid> = [a, b].iter().copied().collect();

        assert_eq!(availability_change(3, &none, &none), None);
        assert_eq!(availability_change(3, &none, &one), Some(AvailabilityChange::Decreased));
        assert_eq!(availability_change(3, &one, &one), None);
        assert_eq!(availability_change(3, &one, &two), Some(AvailabilityChange::MajorityLost));
        assert_eq!(availability_change(3, &two, &one), Some(AvailabilityChange::MajorityRegained));
        assert_eq!(availability_change(3, &two, &two), None);
        assert_eq!(availability_change(3, &one, &none), Some(AvailabilityChange::Restored));
        assert_eq!(availability_change(3, &two, &none), Some(AvailabilityChange::Restored));

        // Swapping which minority is down is still a decrease.
        let other: HashSet<Uuid> = [b].iter().copied().collect();
        assert_eq!(availability_change(3, &one, &other), Some(AvailabilityChange::Decreased));
    }
}
