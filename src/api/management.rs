use crate::api::{
    CpError, CpGroup, CpGroupAvailabilityEvent, CpGroupId, CpGroupStatus, CpMember, CpSession, MembershipEvent,
};
use crate::cp::{CpClient, CpGroupManager, GroupCommand};
use std::sync::Arc;
use tokio::time::Duration;
use uuid::Uuid;

/// Administrative view of the CP Subsystem: groups, CP members and the listeners that watch
/// them. Obtained from `CpSubsystem::management`.
#[derive(Clone)]
pub struct CpManagement {
    groups: Arc<CpGroupManager>,
}

impl CpManagement {
    pub(crate) fn new(groups: Arc<CpGroupManager>) -> Self {
        CpManagement { groups }
    }

    /// Ids of the active groups, the metadata group included.
    pub async fn get_cp_group_ids(&self) -> Result<Vec<CpGroupId>, CpError> {
        self.groups.group_ids().await
    }

    pub async fn get_cp_group(&self, name: &str) -> Result<Option<CpGroup>, CpError> {
        self.groups.group(name).await
    }

    pub async fn get_cp_members(&self) -> Result<Vec<CpMember>, CpError> {
        self.groups.cp_members().await
    }

    /// None until discovery completes, and on members that are not CP members.
    pub fn get_local_cp_member(&self) -> Option<CpMember> {
        self.groups.local_cp_member()
    }

    /// Makes this member a CP member and adds it to groups running short of members.
    pub async fn promote_to_cp_member(&self) -> Result<(), CpError> {
        self.groups.promote_to_cp_member().await
    }

    /// Retires a CP member, replacing it in every group it belongs to where possible.
    pub async fn remove_cp_member(&self, member: Uuid) -> Result<(), CpError> {
        self.groups.remove_cp_member(member).await
    }

    /// Destroys the group without consensus from its own members. Irreversible: proxies created
    /// against it fail with `GroupDestroyed` from then on.
    pub async fn force_destroy_cp_group(&self, name: &str) -> Result<(), CpError> {
        self.groups.force_destroy_group(name).await
    }

    /// Wipes all CP state in the cluster and bootstraps anew from the current members.
    /// Irreversible.
    pub async fn reset(&self) -> Result<(), CpError> {
        self.groups.reset().await
    }

    pub fn is_discovery_completed(&self) -> bool {
        self.groups.is_discovery_completed()
    }

    pub async fn await_discovery_completed(&self, timeout: Duration) -> bool {
        self.groups.await_discovery_completed(timeout).await
    }

    pub fn add_membership_listener<F>(&self, listener: F) -> Uuid
    where
        F: Fn(&MembershipEvent) + Send + Sync + 'static,
    {
        self.groups.membership_listeners().add(listener)
    }

    pub fn remove_membership_listener(&self, id: Uuid) -> bool {
        self.groups.membership_listeners().remove(id)
    }

    pub fn add_group_availability_listener<F>(&self, listener: F) -> Uuid
    where
        F: Fn(&CpGroupAvailabilityEvent) + Send + Sync + 'static,
    {
        self.groups.availability_listeners().add(listener)
    }

    pub fn remove_group_availability_listener(&self, id: Uuid) -> bool {
        self.groups.availability_listeners().remove(id)
    }
}

/// Sessions held in CP groups, by any endpoint.
#[derive(Clone)]
pub struct CpSessionManagement {
    groups: Arc<CpGroupManager>,
    client: CpClient,
}

impl CpSessionManagement {
    pub(crate) fn new(groups: Arc<CpGroupManager>, client: CpClient) -> Self {
        CpSessionManagement { groups, client }
    }

    pub async fn get_all_sessions(&self, group_name: &str) -> Result<Vec<CpSession>, CpError> {
        let group_id = self.active_group(group_name).await?;
        self.client
            .invoke_group(&group_id, GroupCommand::GetSessions)
            .await?
            .into_sessions()
    }

    /// Closes a session as if it had expired, releasing what it holds. Returns false if there
    /// was no such session.
    pub async fn force_close_session(&self, group_name: &str, session_id: u64) -> Result<bool, CpError> {
        let group_id = self.active_group(group_name).await?;
        self.client
            .invoke_group(&group_id, GroupCommand::CloseSession { session_id })
            .await?
            .into_bool()
    }

    async fn active_group(&self, name: &str) -> Result<CpGroupId, CpError> {
        match self.groups.group(name).await? {
            Some(group) if group.status() == CpGroupStatus::Active => Ok(group.id().clone()),
            Some(group) => Err(CpError::GroupDestroyed(group.id().clone())),
            None => Err(CpError::GroupNotFound(name.to_string())),
        }
    }
}
