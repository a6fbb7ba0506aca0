use crate::api::{CpError, CpGroupId, CpSession};
use crate::cp::group::{GroupCommand, RequestId};
use crate::cp::invocation::{InvocationManager, Wait};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use uuid::Uuid;

/// SessionManager holds this endpoint's session in every CP group it has used a session-bound
/// primitive in. Sessions are created on first use and kept alive by heartbeats.
pub(crate) struct SessionManager {
    logger: slog::Logger,
    endpoint: Uuid,
    invocation: Arc<InvocationManager>,
    session_ttl: Duration,
    sessions: Mutex<HashMap<CpGroupId, u64>>,
    // One creation at a time, so concurrent first calls share a session.
    creating: tokio::sync::Mutex<()>,
    next_call_id: AtomicU64,
}

impl SessionManager {
    pub(crate) fn new(
        logger: slog::Logger,
        endpoint: Uuid,
        invocation: Arc<InvocationManager>,
        session_ttl: Duration,
    ) -> Self {
        SessionManager {
            logger,
            endpoint,
            invocation,
            session_ttl,
            sessions: Mutex::new(HashMap::new()),
            creating: tokio::sync::Mutex::new(()),
            next_call_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_request(&self) -> RequestId {
        RequestId {
            endpoint: self.endpoint,
            call_id: self.next_call_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn session(&self, group_id: &CpGroupId) -> Option<u64> {
        self.lock().get(group_id).copied()
    }

    pub(crate) async fn get_or_create_session(&self, group_id: &CpGroupId) -> Result<u64, CpError> {
        if let Some(session_id) = self.session(group_id) {
            return Ok(session_id);
        }

        let _creating = self.creating.lock().await;
        if let Some(session_id) = self.session(group_id) {
            return Ok(session_id);
        }

        let command = GroupCommand::CreateSession {
            endpoint: self.endpoint,
            ttl_millis: self.session_ttl.as_millis() as u64,
        };
        let session: CpSession = self
            .invocation
            .invoke_group(group_id, &command, Wait::Bounded)
            .await?
            .into_session()?;

        slog::debug!(self.logger, "Created session {} in {}", session.id, group_id);
        self.lock().insert(group_id.clone(), session.id);
        Ok(session.id)
    }

    /// Forgets `session_id` if it is still the one held for `group_id`.
    pub(crate) fn invalidate(&self, group_id: &CpGroupId, session_id: u64) {
        let mut sessions = self.lock();
        if sessions.get(group_id) == Some(&session_id) {
            slog::info!(self.logger, "Session {} in {} is no longer valid", session_id, group_id);
            sessions.remove(group_id);
        }
    }

    pub(crate) async fn heartbeat_all(&self) {
        let sessions: Vec<(CpGroupId, u64)> = self.lock().iter().map(|(g, s)| (g.clone(), *s)).collect();
        for (group_id, session_id) in sessions {
            let command = GroupCommand::HeartbeatSession { session_id };
            match self.invocation.invoke_group(&group_id, &command, Wait::Bounded).await {
                Ok(_) => {}
                Err(CpError::SessionExpired { .. }) | Err(CpError::GroupDestroyed(_)) => {
                    self.invalidate(&group_id, session_id)
                }
                Err(e) => slog::warn!(self.logger, "Heartbeat of session {} in {} failed: {}", session_id, group_id, e),
            }
        }
    }

    /// Closes every session this endpoint holds. Best effort.
    pub(crate) async fn close_all(&self) {
        let sessions: Vec<(CpGroupId, u64)> = self.lock().drain().collect();
        for (group_id, session_id) in sessions {
            let command = GroupCommand::CloseSession { session_id };
            if let Err(e) = self.invocation.invoke_group(&group_id, &command, Wait::Bounded).await {
                slog::warn!(self.logger, "Failed to close session {} in {}: {}", session_id, group_id, e);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CpGroupId, u64>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Heartbeats every held session until the task is aborted.
pub(crate) async fn run_heartbeats(sessions: Arc<SessionManager>, interval: Duration) {
    let mut ticks = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticks.tick().await;
    loop {
        ticks.tick().await;
        sessions.heartbeat_all().await;
    }
}
