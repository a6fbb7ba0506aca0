use cp_subsystem::{
    AvailabilityChange, ClusterMembership, CpError, CpGroupAvailabilityEvent, CpGroupId, CpMember, CpOptions,
    CpSubsystem, CpSubsystemConfig, LocalNetwork, MembershipEvent, Network,
};
use futures::future;
use slog::Drain;
use std::error::Error;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

struct TestCluster {
    network: LocalNetwork,
    membership: ClusterMembership,
    members: Vec<CpMember>,
    subsystems: Vec<CpSubsystem>,
}

impl TestCluster {
    async fn start(num_members: usize, cp_member_count: usize) -> Result<TestCluster, Box<dyn Error>> {
        Self::start_with(num_members, fast_options(cp_member_count)).await
    }

    async fn start_with(num_members: usize, options: CpOptions) -> Result<TestCluster, Box<dyn Error>> {
        let network = LocalNetwork::new();
        let members: Vec<CpMember> = (0..num_members).map(|i| member(6000, i)).collect();
        let cluster = ClusterMembership::with_members(members.clone());

        let mut subsystems = Vec::with_capacity(num_members);
        for member in members.iter() {
            let config = CpSubsystemConfig {
                me: member.clone(),
                cluster: cluster.clone(),
                network: Network::Local(network.clone()),
                info_logger: create_root_logger_for_stdout(),
                options: options.clone(),
            };
            subsystems.push(CpSubsystem::start(config).await?);
        }

        for subsystem in subsystems.iter() {
            let completed = subsystem
                .management()?
                .await_discovery_completed(Duration::from_secs(20))
                .await;
            assert!(completed, "Discovery did not complete on {}", subsystem.local_member().uuid());
        }

        Ok(TestCluster {
            network,
            membership: cluster,
            members,
            subsystems,
        })
    }

    fn node(&self, i: usize) -> &CpSubsystem {
        &self.subsystems[i]
    }

    fn disconnect(&self, i: usize) {
        self.network.disconnect(self.members[i].uuid());
    }

    fn reconnect(&self, i: usize) {
        self.network.reconnect(self.members[i].uuid());
    }

    async fn shutdown(self) {
        for subsystem in self.subsystems {
            subsystem.shutdown().await;
        }
    }
}

fn fast_options(cp_member_count: usize) -> CpOptions {
    CpOptions {
        cp_member_count: Some(cp_member_count),
        session_ttl: Some(Duration::from_millis(1500)),
        session_heartbeat_interval: Some(Duration::from_millis(200)),
        leader_heartbeat_duration: Some(Duration::from_millis(50)),
        follower_min_timeout: Some(Duration::from_millis(200)),
        follower_max_timeout: Some(Duration::from_millis(400)),
        append_entries_timeout: Some(Duration::from_millis(100)),
        operation_timeout: Some(Duration::from_secs(3)),
        retry_backoff: Some(Duration::from_millis(20)),
        metadata_refresh_interval: Some(Duration::from_millis(200)),
        ..CpOptions::default()
    }
}

fn member(port_base: u16, i: usize) -> CpMember {
    CpMember::new(
        Uuid::new_v4(),
        SocketAddr::from((Ipv4Addr::LOCALHOST, port_base + i as u16)),
    )
}

#[tokio::test]
async fn lock_passes_to_waiter_when_holder_dies() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(3, 3).await?;

    let lock_a = cluster.node(0).get_lock("L").await?;
    let lock_b = cluster.node(1).get_lock("L").await?;

    assert_eq!(lock_a.lock().await?, 1);
    assert!(lock_a.is_locked_by_current_session().await?);
    assert_eq!(lock_b.try_lock().await?, None);
    assert!(!lock_b.is_locked_by_current_session().await?);

    // Member 0 crashes. Its session stops heartbeating and expires.
    cluster.disconnect(0);
    let fence = tokio::time::timeout(Duration::from_secs(15), lock_b.lock()).await??;
    assert_eq!(fence, 2);
    assert_eq!(lock_b.get_fence().await?, 2);

    lock_b.unlock().await?;
    assert!(!lock_b.is_locked().await?);
    cluster.reconnect(0);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn force_closed_session_releases_lock_and_permits() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(3, 3).await?;

    let lock_a = cluster.node(0).get_lock("L").await?;
    let lock_b = cluster.node(1).get_lock("L").await?;
    let semaphore_a = cluster.node(0).get_semaphore("permits").await?;
    let semaphore_b = cluster.node(1).get_semaphore("permits").await?;

    assert!(semaphore_a.init(2).await?);
    assert!(!semaphore_b.init(5).await?);
    semaphore_a.acquire(2).await?;
    assert_eq!(semaphore_b.available_permits().await?, 0);
    assert!(!semaphore_b.try_acquire(1).await?);

    assert_eq!(lock_a.lock().await?, 1);
    // Reentrant: same fence, higher count.
    assert_eq!(lock_a.lock().await?, 1);
    assert_eq!(lock_a.get_lock_count().await?, 2);

    let waiter = {
        let lock_b = lock_b.clone();
        tokio::spawn(async move { lock_b.lock().await })
    };

    let sessions = cluster.node(2).session_management()?;
    let session = sessions
        .get_all_sessions("default")
        .await?
        .into_iter()
        .find(|s| s.endpoint == cluster.node(0).local_member().uuid())
        .expect("Member 0 should hold a session");
    assert!(sessions.force_close_session("default", session.id).await?);
    assert!(!sessions.force_close_session("default", session.id).await?);

    let fence = tokio::time::timeout(Duration::from_secs(10), waiter).await???;
    assert_eq!(fence, 2);
    assert_eq!(semaphore_b.available_permits().await?, 2);
    assert!(semaphore_b.try_acquire_for(2, Duration::from_secs(1)).await?);

    // The old holder's session is gone, whether or not a heartbeat noticed yet.
    assert!(matches!(
        lock_a.unlock().await,
        Err(CpError::SessionExpired { .. }) | Err(CpError::IllegalState(_))
    ));
    assert!(!lock_a.is_locked_by_current_session().await?);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_get_and_add() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(3, 3).await?;

    let mut counters = Vec::new();
    for i in 0..3 {
        counters.push(cluster.node(i).get_atomic_long("counter").await?);
    }

    let calls = (0..100).map(|i| counters[i % counters.len()].get_and_add(1));
    let mut previous: Vec<i64> = future::try_join_all(calls).await?;
    previous.sort();

    assert_eq!(previous, (0..100).collect::<Vec<i64>>());
    assert_eq!(counters[0].get().await?, 100);
    assert_eq!(counters[2].get().await?, 100);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn destroyed_group_is_never_reached_through_old_proxies() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(3, 3).await?;

    let old = cluster.node(0).get_atomic_long("x@orders").await?;
    old.set(5).await?;
    let old_id = old.group_id().clone();

    let management = cluster.node(1).management()?;
    management.force_destroy_cp_group("orders").await?;
    assert_eq!(old.get().await, Err(CpError::GroupDestroyed(old_id.clone())));

    let recreated = cluster.node(2).get_atomic_long("x@orders").await?;
    assert_eq!(recreated.group_id().name(), "orders");
    assert_ne!(recreated.group_id().seed(), old_id.seed());
    assert_eq!(recreated.get().await?, 0);

    // Still gone, even with a group of the same name running.
    assert_eq!(old.add_and_get(1).await, Err(CpError::GroupDestroyed(old_id)));
    assert_eq!(recreated.get().await?, 0);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn lost_quorum_reports_unavailable() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(3, 3).await?;

    let counter = cluster.node(0).get_atomic_long("counter").await?;
    assert_eq!(counter.increment_and_get().await?, 1);

    cluster.disconnect(1);
    cluster.disconnect(2);
    let group_id = counter.group_id().clone();
    assert_eq!(counter.get().await, Err(CpError::GroupUnavailable(group_id)));

    cluster.reconnect(1);
    cluster.reconnect(2);
    let value = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match counter.get().await {
                Ok(value) => return value,
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    })
    .await?;
    assert_eq!(value, 1);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn survives_minority_failure() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(3, 3).await?;

    let counter = cluster.node(1).get_atomic_long("counter").await?;
    let reference = cluster.node(2).get_atomic_reference::<String>("ref").await?;
    counter.set(41).await?;
    reference.set(Some(&"before".to_string())).await?;

    // Whoever led, a majority remains.
    cluster.disconnect(0);
    assert_eq!(counter.increment_and_get().await?, 42);
    assert!(
        reference
            .compare_and_set(Some(&"before".to_string()), Some(&"after".to_string()))
            .await?
    );
    assert_eq!(reference.get().await?, Some("after".to_string()));
    reference.clear().await?;
    assert!(reference.is_null().await?);

    cluster.reconnect(0);
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn latch_releases_waiters_on_other_members() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(3, 3).await?;

    let latch = cluster.node(0).get_count_down_latch("latch").await?;
    assert!(latch.try_set_count(2).await?);
    assert!(!latch.try_set_count(5).await?);
    assert_eq!(latch.get_round().await?, 1);
    assert!(!latch.wait(Duration::from_millis(200)).await?);

    let waiter = {
        let latch = cluster.node(1).get_count_down_latch("latch").await?;
        tokio::spawn(async move { latch.wait(Duration::from_secs(10)).await })
    };

    let other = cluster.node(2).get_count_down_latch("latch").await?;
    other.count_down().await?;
    assert_eq!(other.get_count().await?, 1);
    other.count_down().await?;
    assert_eq!(other.get_count().await?, 0);

    assert!(waiter.await??);
    assert!(latch.try_set_count(1).await?);
    assert_eq!(latch.get_round().await?, 2);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn management_reports_groups_and_members() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(4, 3).await?;
    let management = cluster.node(0).management()?;

    let members = management.get_cp_members().await?;
    assert_eq!(members.len(), 3);
    assert!(management.get_local_cp_member().is_some());
    assert!(cluster.node(3).management()?.get_local_cp_member().is_none());

    cluster.node(0).get_atomic_long("counter").await?.set(7).await?;
    let group = management.get_cp_group("default").await?.expect("default group exists");
    assert_eq!(group.members().len(), 3);
    let names: Vec<String> = management
        .get_cp_group_ids()
        .await?
        .into_iter()
        .map(|id| id.name().to_string())
        .collect();
    assert!(names.contains(&"default".to_string()));
    assert!(names.contains(&"METADATA".to_string()));

    let added: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));
    let listener_id = {
        let added = added.clone();
        management.add_membership_listener(move |event: &MembershipEvent| {
            if let MembershipEvent::MemberAdded(member) = event {
                added.lock().unwrap().push(member.uuid());
            }
        })
    };

    let promoted = cluster.node(3).local_member().uuid();
    cluster.node(3).management()?.promote_to_cp_member().await?;
    assert_eq!(management.get_cp_members().await?.len(), 4);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !added.lock().unwrap().contains(&promoted) {
        assert!(Instant::now() < deadline, "Membership listener was not called");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(management.remove_membership_listener(listener_id));
    assert!(!management.remove_membership_listener(listener_id));

    // Retiring a member of the default group moves the group onto the promoted member.
    let caller = cluster.node(0).local_member().uuid();
    let retired = group
        .members()
        .iter()
        .map(|m| m.uuid())
        .find(|uuid| *uuid != caller)
        .expect("default group has other members");
    management.remove_cp_member(retired).await?;
    let group = management.get_cp_group("default").await?.expect("default group exists");
    assert_eq!(group.members().len(), 3);
    assert!(!group.contains(&retired));
    let survivor = cluster
        .subsystems
        .iter()
        .find(|s| s.local_member().uuid() != retired)
        .expect("three members remain");
    assert_eq!(survivor.get_atomic_long("counter").await?.get().await?, 7);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn reset_retires_every_old_group() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(3, 3).await?;

    let old = cluster.node(0).get_atomic_long("counter").await?;
    old.set(5).await?;
    let old_id = old.group_id().clone();

    cluster.node(1).management()?.reset().await?;

    // Fails at once, reads included, instead of waiting out the operation timeout.
    let started = Instant::now();
    assert_eq!(old.get().await, Err(CpError::GroupDestroyed(old_id.clone())));
    assert_eq!(old.set(6).await, Err(CpError::GroupDestroyed(old_id.clone())));
    assert!(started.elapsed() < Duration::from_secs(1));

    // Rediscovery happens in the background. Keep asking until the new incarnation answers.
    let deadline = Instant::now() + Duration::from_secs(20);
    let fresh = loop {
        match cluster.node(2).get_atomic_long("counter").await {
            Ok(fresh) if fresh.group_id() != &old_id => match fresh.get().await {
                Ok(value) => {
                    assert_eq!(value, 0);
                    break fresh;
                }
                Err(e) => assert!(Instant::now() < deadline, "New group never answered: {}", e),
            },
            Ok(_) => assert!(Instant::now() < deadline, "Proxy still resolves the old group"),
            Err(e) => assert!(Instant::now() < deadline, "Group was not recreated: {}", e),
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    assert_eq!(fresh.group_id().name(), "default");
    assert!(fresh.group_id().seed() > old_id.seed());
    assert_eq!(fresh.increment_and_get().await?, 1);
    assert_eq!(old.get().await, Err(CpError::GroupDestroyed(old_id)));

    for subsystem in cluster.subsystems.iter() {
        assert!(
            subsystem
                .management()?
                .await_discovery_completed(Duration::from_secs(20))
                .await
        );
    }
    assert_eq!(cluster.node(0).management()?.get_cp_members().await?.len(), 3);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn availability_listener_follows_platform_membership() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(3, 3).await?;
    let counter = cluster.node(0).get_atomic_long("counter").await?;
    counter.set(1).await?;
    let group_id = counter.group_id().clone();

    let events: Arc<Mutex<Vec<CpGroupAvailabilityEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let management = cluster.node(0).management()?;
    let listener_id = {
        let events = events.clone();
        management.add_group_availability_listener(move |event: &CpGroupAvailabilityEvent| {
            events.lock().unwrap().push(event.clone());
        })
    };

    cluster.membership.member_left(cluster.members[1].uuid());
    await_availability(&events, &group_id, AvailabilityChange::Decreased, 1).await;
    cluster.membership.member_left(cluster.members[2].uuid());
    await_availability(&events, &group_id, AvailabilityChange::MajorityLost, 2).await;

    cluster.membership.member_joined(cluster.members[2].clone());
    await_availability(&events, &group_id, AvailabilityChange::MajorityRegained, 1).await;
    cluster.membership.member_joined(cluster.members[1].clone());
    await_availability(&events, &group_id, AvailabilityChange::Restored, 0).await;

    let changes: Vec<AvailabilityChange> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| event.group_id == group_id)
        .map(|event| event.change)
        .collect();
    assert_eq!(
        changes,
        vec![
            AvailabilityChange::Decreased,
            AvailabilityChange::MajorityLost,
            AvailabilityChange::MajorityRegained,
            AvailabilityChange::Restored,
        ]
    );
    assert!(management.remove_group_availability_listener(listener_id));

    cluster.shutdown().await;
    Ok(())
}

async fn await_availability(
    events: &Arc<Mutex<Vec<CpGroupAvailabilityEvent>>>,
    group_id: &CpGroupId,
    change: AvailabilityChange,
    unavailable: usize,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let seen = events
            .lock()
            .unwrap()
            .iter()
            .any(|event| &event.group_id == group_id && event.change == change);
        if seen {
            let events = events.lock().unwrap();
            let last = events
                .iter()
                .filter(|event| &event.group_id == group_id)
                .last()
                .expect("an event for the group");
            assert_eq!(last.change, change);
            assert_eq!(last.unavailable_members.len(), unavailable);
            return;
        }
        assert!(Instant::now() < deadline, "No {:?} event for {}", change, group_id);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn lagging_member_catches_up_from_a_snapshot() -> Result<(), Box<dyn Error>> {
    let options = CpOptions {
        commit_index_advance_count_to_snapshot: Some(5),
        ..fast_options(3)
    };
    let cluster = TestCluster::start_with(3, options).await?;
    let counter = cluster.node(0).get_atomic_long("counter").await?;

    // Member 2 misses far more entries than the log keeps.
    cluster.disconnect(2);
    for _ in 0..40 {
        counter.increment_and_get().await?;
    }
    cluster.reconnect(2);
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Without member 1, commits need member 2, which only has what the snapshot gave it.
    cluster.disconnect(1);
    let value = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match counter.get().await {
                Ok(value) => return value,
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    })
    .await?;
    assert_eq!(value, 40);
    assert_eq!(counter.increment_and_get().await?, 41);

    cluster.reconnect(1);
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn names_are_validated() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(3, 3).await?;

    assert!(matches!(
        cluster.node(0).get_lock("lock@METADATA").await,
        Err(CpError::IllegalArgument(_))
    ));
    assert!(matches!(
        cluster.node(0).get_semaphore("").await,
        Err(CpError::IllegalArgument(_))
    ));
    assert!(matches!(
        cluster.node(0).get_map("map"),
        Err(CpError::NotImplemented(_))
    ));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn disabled_subsystem_fails_fast() -> Result<(), Box<dyn Error>> {
    let me = member(6100, 0);
    let subsystem = CpSubsystem::start(CpSubsystemConfig {
        me: me.clone(),
        cluster: ClusterMembership::with_members(vec![me]),
        network: Network::Local(LocalNetwork::new()),
        info_logger: create_root_logger_for_stdout(),
        options: CpOptions::default(),
    })
    .await?;

    assert!(!subsystem.is_enabled());
    assert!(matches!(
        subsystem.get_atomic_long("counter").await,
        Err(CpError::CpSubsystemDisabled)
    ));
    assert!(matches!(subsystem.get_map("map"), Err(CpError::CpSubsystemDisabled)));
    assert!(matches!(subsystem.management(), Err(CpError::CpSubsystemDisabled)));

    subsystem.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn grpc_cluster_hands_out_increasing_fences() -> Result<(), Box<dyn Error>> {
    let members: Vec<CpMember> = (0..3).map(|i| member(17300, i)).collect();
    let cluster = ClusterMembership::with_members(members.clone());

    let mut subsystems = Vec::new();
    for me in members {
        subsystems.push(
            CpSubsystem::start(CpSubsystemConfig {
                me,
                cluster: cluster.clone(),
                network: Network::Grpc,
                info_logger: create_root_logger_for_stdout(),
                options: fast_options(3),
            })
            .await?,
        );
    }
    for subsystem in subsystems.iter() {
        assert!(
            subsystem
                .management()?
                .await_discovery_completed(Duration::from_secs(20))
                .await
        );
    }

    let mut fences = Vec::new();
    for subsystem in subsystems.iter() {
        let lock = subsystem.get_lock("grpc-lock").await?;
        fences.push(lock.lock().await?);
        lock.unlock().await?;
    }
    assert_eq!(fences, vec![1, 2, 3]);

    for subsystem in subsystems {
        subsystem.shutdown().await;
    }
    Ok(())
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator)
        .use_file_location()
        .build()
        .filter_level(slog::Level::Info)
        .fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
