use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use meshsignal::bluetooth::{
    ConnectionCoordinator, ConnectionState, MeshLink, ProtocolKind, SimulatedProvider,
    SimulatedRadio,
};
use meshsignal::clock::{Clock, ManualClock};
use meshsignal::cloud::{CloudContent, MemoryCloud};
use meshsignal::config::{AppConfig, JobSettings, SignalSettings};
use meshsignal::protocol::{Contact, MeshPacket};
use meshsignal::signal::{
    codec, AuthorRef, EngineDeps, FeedSnapshot, MeshIngest, NewSignal, Signal, SignalKind,
    SignalOrigin, SignalPhase, SignalSyncEngine, SignalSyncHandle,
};
use meshsignal::storage::{KeyValueStore, MemoryStore, PacketDedupeStore, SqliteStore};

const RADIO_NODE: u32 = 0x00C0FFEE;
const FAR_NODE: u32 = 0x0000BEEF;

fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn quiet_jobs() -> JobSettings {
    JobSettings {
        cleanup_interval_secs: 3_600,
        refresh_interval_secs: 3_600,
        countdown_interval_ms: 3_600_000,
    }
}

fn spawn_engine(
    clock: &ManualClock,
    dedupe_store: Arc<dyn KeyValueStore>,
    mesh: Option<Arc<dyn MeshLink>>,
) -> (SignalSyncHandle, watch::Sender<bool>) {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let retention = ChronoDuration::hours(24);
    let dedupe = Arc::new(PacketDedupeStore::new(dedupe_store, clock.clone(), retention));
    let (online, connectivity) = watch::channel(false);
    let handle = SignalSyncEngine::spawn(
        SignalSettings::default(),
        quiet_jobs(),
        EngineDeps {
            mesh,
            dedupe,
            cache: Some(Arc::new(MemoryStore::new())),
            cloud: None,
            clock,
            connectivity,
            push_events: None,
            cloud_user: None,
        },
    );
    (handle, online)
}

fn connected_radio() -> (ConnectionCoordinator, Arc<SimulatedRadio>) {
    let provider = Arc::new(SimulatedProvider::new());
    let radio = SimulatedRadio::new(ProtocolKind::Meshtastic, "Ridge Relay", RADIO_NODE);
    provider.add(radio.clone());
    (ConnectionCoordinator::new(provider, &AppConfig::default()), radio)
}

fn mesh_signal(id: &str, author: u32, created_at: DateTime<Utc>, ttl: ChronoDuration) -> Signal {
    Signal {
        id: id.to_string(),
        author: AuthorRef {
            mesh_node: Some(author),
            cloud_user: None,
        },
        content: format!("{id} says hello"),
        created_at,
        expires_at: created_at + ttl,
        location: None,
        media: None,
        hop_count: None,
        presence: None,
        kind: SignalKind::Text,
        origin: SignalOrigin::Mesh,
        cloud_synced: false,
    }
}

fn packet(signal: &Signal, packet_id: u32, hop_count: Option<u8>) -> MeshPacket {
    MeshPacket {
        from: signal.author.mesh_node.unwrap_or(FAR_NODE),
        packet_id: Some(packet_id),
        channel: 0,
        hop_count,
        payload: codec::encode(signal).unwrap(),
    }
}

async fn wait_until(
    handle: &SignalSyncHandle,
    check: impl Fn(&FeedSnapshot) -> bool,
) -> Arc<FeedSnapshot> {
    let mut feed = handle.subscribe();
    let reached = feed.wait_for(|s| check(s.as_ref()));
    let snapshot = tokio::time::timeout(Duration::from_secs(2), reached)
        .await
        .expect("feed did not reach the expected state")
        .expect("engine stopped");
    Arc::clone(&snapshot)
}

#[tokio::test]
async fn local_signal_fades_at_ttl_and_is_removed_after_the_fade() {
    let clock = ManualClock::new(start_time());
    let (engine, _online) = spawn_engine(&clock, Arc::new(MemoryStore::new()), None);
    let fade = SignalSettings::default().fade_duration();

    let signal = engine
        .create_signal(NewSignal::text("avalanche debris on the east gully").with_ttl(60))
        .await
        .unwrap();
    assert!(signal.expires_at > signal.created_at);

    clock.set(start_time() + ChronoDuration::seconds(61));
    engine.run_countdown_tick().await.unwrap();
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.phase_of(&signal.id), Some(SignalPhase::Fading));

    clock.set(start_time() + ChronoDuration::seconds(61) + fade);
    let report = engine.run_countdown_tick().await.unwrap();
    assert_eq!(report.removed, vec![signal.id.clone()]);
    assert!(engine.snapshot().get(&signal.id).is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn dedupe_ledger_survives_a_database_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meshsignal.db");
    let clock = ManualClock::new(start_time());
    let relayed = mesh_signal("relayed", FAR_NODE, start_time(), ChronoDuration::minutes(30));

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let (engine, _online) = spawn_engine(&clock, store, None);
        assert_eq!(
            engine.add_mesh_signal(packet(&relayed, 41, Some(2))).await.unwrap(),
            MeshIngest::Accepted
        );
        engine.shutdown().await;
    }

    clock.advance(ChronoDuration::minutes(5));
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let (engine, _online) = spawn_engine(&clock, store, None);
    assert_eq!(
        engine.add_mesh_signal(packet(&relayed, 41, Some(3))).await.unwrap(),
        MeshIngest::Duplicate
    );
    assert!(engine.snapshot().entries.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn mesh_traffic_flows_between_radio_and_feed() {
    let (coordinator, radio) = connected_radio();
    coordinator.connect(&radio.advertisement()).await.unwrap();
    let clock = ManualClock::new(start_time());
    let mesh: Arc<dyn MeshLink> = Arc::new(coordinator.clone());
    let (engine, _online) = spawn_engine(&clock, Arc::new(MemoryStore::new()), Some(mesh));
    // Round trip so the engine is subscribed to mesh packets
    engine.run_countdown_tick().await.unwrap();

    let heard = mesh_signal("heard", FAR_NODE, start_time(), ChronoDuration::minutes(10));
    radio.inject_mesh_packet(&packet(&heard, 7, Some(2))).unwrap();
    radio.inject_mesh_packet(&packet(&heard, 7, Some(2))).unwrap();
    let snapshot = wait_until(&engine, |s| s.get("heard").is_some()).await;
    assert_eq!(snapshot.get("heard").unwrap().signal.hop_count, Some(2));

    let own = engine
        .create_signal(NewSignal::text("heading down before dark"))
        .await
        .unwrap();
    assert_eq!(own.author.mesh_node, Some(RADIO_NODE));

    for _ in 0..200 {
        if !radio.sent_payloads().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let sent = radio.sent_payloads();
    assert_eq!(sent.len(), 1);
    assert_eq!(codec::decode(&sent[0].1, RADIO_NODE, None).unwrap().id, own.id);

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.ids(), vec![own.id.as_str(), "heard"]);

    engine.shutdown().await;
    coordinator.dispose().await;
}

#[tokio::test]
async fn own_node_outranks_closer_and_more_urgent_signals() {
    let (coordinator, radio) = connected_radio();
    coordinator.connect(&radio.advertisement()).await.unwrap();
    let clock = ManualClock::new(start_time());
    let mesh: Arc<dyn MeshLink> = Arc::new(coordinator.clone());
    let (engine, _online) = spawn_engine(&clock, Arc::new(MemoryStore::new()), Some(mesh));

    // A: our own node, hop count unknown, five minutes left
    let a = mesh_signal("A", RADIO_NODE, start_time(), ChronoDuration::minutes(5));
    // B: another node one hop away, one minute left
    let b = mesh_signal("B", FAR_NODE, start_time(), ChronoDuration::minutes(1));
    assert_eq!(engine.add_mesh_signal(packet(&b, 1, Some(1))).await.unwrap(), MeshIngest::Accepted);
    assert_eq!(engine.add_mesh_signal(packet(&a, 2, None)).await.unwrap(), MeshIngest::Accepted);

    assert_eq!(engine.snapshot().ids(), vec!["A", "B"]);

    engine.shutdown().await;
    coordinator.dispose().await;
}

#[tokio::test]
async fn mesh_signals_are_accepted_before_the_radio_connects() {
    let (coordinator, radio) = connected_radio();
    let clock = ManualClock::new(start_time());
    let mesh: Arc<dyn MeshLink> = Arc::new(coordinator.clone());
    let (engine, _online) = spawn_engine(&clock, Arc::new(MemoryStore::new()), Some(mesh));
    assert_eq!(coordinator.state(), ConnectionState::Disconnected);

    let early = mesh_signal("early", FAR_NODE, start_time(), ChronoDuration::minutes(10));
    assert_eq!(
        engine.add_mesh_signal(packet(&early, 9, Some(1))).await.unwrap(),
        MeshIngest::Accepted
    );

    coordinator.connect(&radio.advertisement()).await.unwrap();
    assert_eq!(
        engine.add_mesh_signal(packet(&early, 9, Some(1))).await.unwrap(),
        MeshIngest::Duplicate
    );
    assert_eq!(engine.snapshot().entries.len(), 1);

    engine.shutdown().await;
    coordinator.dispose().await;
}

#[tokio::test]
async fn identity_refresh_picks_up_battery_changes() {
    let (coordinator, radio) = connected_radio();
    let info = coordinator.connect(&radio.advertisement()).await.unwrap();
    assert_eq!(info.node_num, radio.node_num());
    assert_eq!(info.battery.as_ref().and_then(|b| b.percent), Some(92));

    radio.set_battery_percent(Some(41));
    let info = coordinator.refresh_identity().await.unwrap();
    assert_eq!(info.battery.as_ref().and_then(|b| b.percent), Some(41));
    assert_eq!(coordinator.device_info().unwrap().node_id(), "!00c0ffee");

    coordinator.dispose().await;
}

#[tokio::test]
async fn contacts_pass_through_the_coordinator() {
    let (coordinator, radio) = connected_radio();
    radio.add_contact(Contact {
        node_num: FAR_NODE,
        name: "Hut Warden".to_string(),
        hops_away: Some(1),
        last_heard: None,
    });
    coordinator.connect(&radio.advertisement()).await.unwrap();

    let contacts = coordinator.contacts().await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].name, "Hut Warden");

    coordinator.dispose().await;
}

#[tokio::test]
async fn cloud_copy_carries_only_the_coarse_location() {
    let clock = ManualClock::new(start_time());
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let cloud = Arc::new(MemoryCloud::new());
    let cloud_dyn: Arc<dyn CloudContent> = cloud.clone();
    let (_online, connectivity) = watch::channel(true);
    let engine = SignalSyncEngine::spawn(
        SignalSettings::default(),
        quiet_jobs(),
        EngineDeps {
            mesh: None,
            dedupe: Arc::new(PacketDedupeStore::new(
                Arc::new(MemoryStore::new()),
                shared_clock.clone(),
                ChronoDuration::hours(24),
            )),
            cache: None,
            cloud: Some(cloud_dyn),
            clock: shared_clock,
            connectivity,
            push_events: None,
            cloud_user: Some("walker-17".to_string()),
        },
    );

    let signal = engine
        .create_signal(
            NewSignal::text("cornice looks unstable")
                .with_ttl(60)
                .with_location(46.519_712, 6.632_301)
                .with_cloud(true),
        )
        .await
        .unwrap();

    for _ in 0..200 {
        if cloud.upload_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cloud.upload_count(), 1);
    let stored = cloud.get(&signal.id).unwrap();
    assert_eq!(stored.author.cloud_user.as_deref(), Some("walker-17"));
    let location = stored.location.unwrap();
    assert_eq!(location.radius_m, 500.0);
    assert_ne!(location.latitude, 46.519_712);
    assert!((location.latitude - 46.519_712).abs() < 0.01);

    clock.set(start_time() + ChronoDuration::seconds(61));
    let report = engine.run_cleanup().await.unwrap();
    assert_eq!(report.fading, vec![signal.id.clone()]);
    assert!(report.removed.is_empty());

    let fade = SignalSettings::default().fade_duration();
    clock.set(start_time() + ChronoDuration::seconds(61) + fade);
    let report = engine.run_cleanup().await.unwrap();
    assert_eq!(report.removed, vec![signal.id.clone()]);

    engine.shutdown().await;
}
