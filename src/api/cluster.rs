use crate::api::CpMember;
use crate::transport::LocalNetwork;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    Joined(CpMember),
    Left(CpMember),
}

/// The platform's view of its members. Join order is preserved; the first members to join
/// are the ones promoted to CP members on bootstrap.
///
/// Every member of a process-local cluster can share one instance. Members in separate
/// processes each keep their own and feed it from the platform's membership protocol.
#[derive(Clone)]
pub struct ClusterMembership {
    members: Arc<Mutex<Vec<CpMember>>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl ClusterMembership {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        ClusterMembership {
            members: Arc::new(Mutex::new(Vec::new())),
            events,
        }
    }

    pub fn with_members(members: Vec<CpMember>) -> Self {
        let cluster = Self::new();
        for member in members {
            cluster.member_joined(member);
        }
        cluster
    }

    pub fn member_joined(&self, member: CpMember) {
        {
            let mut members = self.lock();
            if members.iter().any(|m| m.uuid() == member.uuid()) {
                return;
            }
            members.push(member.clone());
        }
        let _ = self.events.send(ClusterEvent::Joined(member));
    }

    pub fn member_left(&self, uuid: Uuid) {
        let removed = {
            let mut members = self.lock();
            match members.iter().position(|m| m.uuid() == uuid) {
                Some(position) => members.remove(position),
                None => return,
            }
        };
        let _ = self.events.send(ClusterEvent::Left(removed));
    }

    pub fn members(&self) -> Vec<CpMember> {
        self.lock().clone()
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.lock().iter().any(|m| m.uuid() == uuid)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CpMember>> {
        // A panic while holding this lock can only come from Vec itself.
        match self.members.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ClusterMembership {
    fn default() -> Self {
        Self::new()
    }
}

/// How members talk to each other.
#[derive(Clone)]
pub enum Network {
    /// tonic gRPC. Each member serves on its own address.
    Grpc,
    /// In-process delivery between members sharing the same `LocalNetwork`.
    Local(LocalNetwork),
}
