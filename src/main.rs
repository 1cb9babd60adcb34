//! MeshSignal - Mesh Radio Signals
//!
//! Command line front end: scan for radios, or connect to one and run the
//! signal feed with stdin as the composer.

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use uuid::Uuid;

use meshsignal::bluetooth::{
    classify, BleScanner, ConnectionCoordinator, ConnectionState, DeviceAdvertisement, MeshLink,
    ProtocolKind, SimulatedProvider, SimulatedRadio,
};
use meshsignal::clock::{Clock, SystemClock};
use meshsignal::cloud::{CloudContent, MemoryCloud};
use meshsignal::config::AppConfig;
use meshsignal::protocol::MeshPacket;
use meshsignal::signal::{
    codec, AuthorRef, EngineDeps, NewSignal, Signal, SignalKind, SignalOrigin, SignalPhase,
    SignalSyncEngine,
};
use meshsignal::storage::{KeyValueStore, MemoryStore, PacketDedupeStore, SqliteStore};

const SIMULATED_NODE: u32 = 0x5EED_0001;
const NEIGHBOUR_NODE: u32 = 0x5EED_0002;

#[derive(Parser)]
#[command(name = "meshsignal", version, about = "Mesh radio discovery and ephemeral signal sync")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan for mesh radios and print how each one classifies
    Scan {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Connect to a radio and run the signal feed
    Run {
        /// Use an in-process radio and cloud instead of Bluetooth
        #[arg(long)]
        simulate: bool,
        /// Radio name or id to connect to; the first recognised radio otherwise
        #[arg(long)]
        device: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(cli.config.as_deref())?;

    let filter = env_logger::Env::default().default_filter_or(config.logging.level.as_str());
    env_logger::Builder::from_env(filter).init();
    info!("=== MeshSignal: mesh radio signals ===");

    match cli.command {
        Command::Scan { seconds } => scan(Duration::from_secs(seconds)).await,
        Command::Run { simulate, device } => run(config, simulate, device).await,
    }
}

async fn scan(window: Duration) -> Result<()> {
    let scanner = BleScanner::new().await?;
    let mut advertisements = scanner.start().await?;
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    let mut reported = HashSet::new();
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            advertisement = advertisements.recv() => {
                let Some(advertisement) = advertisement else { break };
                let classification = classify(&advertisement);
                if classification.kind == ProtocolKind::Unknown {
                    debug!("Ignoring {}", advertisement.display_name());
                    continue;
                }
                if !reported.insert(advertisement.id.clone()) {
                    continue;
                }
                let rssi = advertisement
                    .rssi
                    .map(|rssi| format!("{rssi} dBm"))
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "{:<24} {:<10} {:>8}  confidence {:.2}  {:?}",
                    advertisement.display_name(),
                    classification.kind.to_string(),
                    rssi,
                    classification.confidence,
                    classification.evidence
                );
            }
        }
    }

    scanner.stop().await?;
    info!("Scan finished, {} radios found", reported.len());
    Ok(())
}

async fn run(config: AppConfig, simulate: bool, device: Option<String>) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (coordinator, advertisement, store, cloud, radio, scanner) = if simulate {
        let provider = Arc::new(SimulatedProvider::new());
        let radio = SimulatedRadio::new(
            ProtocolKind::Meshtastic,
            device.as_deref().unwrap_or("Simulated Base"),
            SIMULATED_NODE,
        );
        provider.add(radio.clone());
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cloud: Arc<dyn CloudContent> = Arc::new(MemoryCloud::new());
        (
            ConnectionCoordinator::new(provider, &config),
            radio.advertisement(),
            store,
            Some(cloud),
            Some(radio),
            None,
        )
    } else {
        let path = &config.storage.database_path;
        let store: Arc<dyn KeyValueStore> = Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("Failed to open database {}", path.display()))?,
        );
        let scanner = Arc::new(BleScanner::new().await?);
        let wait = config.coordinator.connect_timeout();
        let advertisement = find_radio(&scanner, device.as_deref(), wait).await?;
        let provider = Arc::new(scanner.transport_provider());
        let coordinator = ConnectionCoordinator::new(provider, &config);
        (coordinator, advertisement, store, None, None, Some(scanner))
    };

    let info = coordinator
        .connect(&advertisement)
        .await
        .with_context(|| format!("Failed to connect to {}", advertisement.display_name()))?;
    info!(
        "Connected to {} ({}, {}, firmware {})",
        info.name,
        info.kind,
        info.node_id(),
        info.firmware.as_deref().unwrap_or("unknown")
    );

    let dedupe = Arc::new(PacketDedupeStore::new(
        store.clone(),
        clock.clone(),
        config.dedupe.retention(),
    ));
    let (_online, connectivity) = watch::channel(cloud.is_some());
    let mesh: Arc<dyn MeshLink> = Arc::new(coordinator.clone());
    let engine = SignalSyncEngine::spawn(
        config.signals.clone(),
        config.jobs.clone(),
        EngineDeps {
            mesh: Some(mesh),
            dedupe,
            cache: Some(store),
            cloud: cloud.clone(),
            clock: clock.clone(),
            connectivity,
            push_events: None,
            cloud_user: None,
        },
    );
    if cloud.is_some() {
        info!("Initial cloud refresh: {:?}", engine.refresh().await?);
    }

    if let Some(radio) = &radio {
        radio
            .inject_mesh_packet(&neighbour_packet(clock.as_ref())?)
            .context("Failed to inject simulated mesh traffic")?;
    }

    let tracker = scanner
        .map(|scanner| tokio::spawn(track_lost_radio(coordinator.clone(), scanner)));

    let mut feed = engine.subscribe();
    let printer = tokio::spawn(async move {
        let mut shown: Vec<String> = Vec::new();
        while feed.changed().await.is_ok() {
            let snapshot = feed.borrow_and_update().clone();
            let ids: Vec<String> = snapshot.entries.iter().map(|e| e.signal.id.clone()).collect();
            if ids == shown {
                continue;
            }
            shown = ids;
            println!(
                "--- feed v{} ({} signals) ---",
                snapshot.version,
                snapshot.entries.len()
            );
            for entry in &snapshot.entries {
                let marker = match entry.phase {
                    SignalPhase::Active => " ",
                    SignalPhase::Fading => "~",
                };
                println!(
                    "{} {:<40} hops {:<4} expires {}",
                    marker,
                    entry.signal.content,
                    entry
                        .signal
                        .hop_count
                        .map(|h| h.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    entry.signal.expires_at.format("%H:%M:%S")
                );
            }
        }
    });

    println!("Type a message and press enter to post it. Ctrl-C quits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let draft = NewSignal::text(line).with_cloud(cloud.is_some());
                    match engine.create_signal(draft).await {
                        Ok(signal) => info!("Posted signal {}", signal.id),
                        Err(e) => warn!("Signal rejected: {}", e),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    }

    engine.shutdown().await;
    printer.abort();
    if let Some(tracker) = tracker {
        tracker.abort();
    }
    if let Some(log) = coordinator.capture_log().await {
        debug!("Session capture:\n{}", log);
    }
    coordinator.dispose().await;
    Ok(())
}

/// Scan until a recognised radio (optionally with a given name or id) shows up.
async fn find_radio(
    scanner: &BleScanner,
    wanted: Option<&str>,
    wait: Duration,
) -> Result<DeviceAdvertisement> {
    let mut advertisements = scanner.start().await?;
    let found = tokio::time::timeout(wait, async {
        while let Some(advertisement) = advertisements.recv().await {
            if classify(&advertisement).kind == ProtocolKind::Unknown {
                continue;
            }
            let matches = match wanted {
                Some(wanted) => {
                    advertisement.id == wanted
                        || advertisement.display_name().eq_ignore_ascii_case(wanted)
                }
                None => true,
            };
            if matches {
                return Some(advertisement);
            }
        }
        None
    })
    .await;
    scanner.stop().await?;

    match found {
        Ok(Some(advertisement)) => {
            info!("Found {} ({})", advertisement.display_name(), advertisement.id);
            Ok(advertisement)
        }
        Ok(None) => bail!("Scan stopped before a radio was found"),
        Err(_) => bail!("No matching radio found within {:?}", wait),
    }
}

/// While the link is down, scan and feed the lost radio's advertisements
/// into the reconnection bearing.
async fn track_lost_radio(coordinator: ConnectionCoordinator, scanner: Arc<BleScanner>) {
    let mut states = coordinator.subscribe_state();
    loop {
        let closed = states
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await
            .is_err();
        if closed {
            return;
        }
        let mut advertisements = match scanner.start().await {
            Ok(advertisements) => advertisements,
            Err(e) => {
                warn!("Cannot scan for the lost radio: {}", e);
                return;
            }
        };
        info!("Link lost, scanning for the radio");

        let scanning = coordinator.track_lost_radio(&mut advertisements).await;
        if let Err(e) = scanner.stop().await {
            warn!("Failed to stop scanning: {}", e);
        }
        if !scanning {
            debug!("Scan stream closed while tracking the lost radio");
            return;
        }
    }
}

/// A signal from a neighbouring node, so simulation mode has mesh traffic.
fn neighbour_packet(clock: &dyn Clock) -> Result<MeshPacket> {
    let now = clock.now();
    let signal = Signal {
        id: Uuid::new_v4().to_string(),
        author: AuthorRef {
            mesh_node: Some(NEIGHBOUR_NODE),
            cloud_user: None,
        },
        content: "Neighbour here, reading you two hops out".to_string(),
        created_at: now,
        expires_at: now + ChronoDuration::minutes(10),
        location: None,
        media: None,
        hop_count: None,
        presence: None,
        kind: SignalKind::Text,
        origin: SignalOrigin::Mesh,
        cloud_synced: false,
    };

    Ok(MeshPacket {
        from: NEIGHBOUR_NODE,
        packet_id: Some(rand::random()),
        channel: 0,
        hop_count: Some(2),
        payload: codec::encode(&signal)?,
    })
}
