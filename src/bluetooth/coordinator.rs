//! Connection Coordinator
//!
//! Owns the one active radio link. Classifies the advertisement, opens a
//! transport, starts the matching protocol session and performs the
//! identity handshake. State changes are published on a watch channel and
//! mesh packets from the session are re-broadcast to subscribers, so
//! dependents never need to touch the session directly.
//!
//! Every failure path releases the session and the transport before the
//! state returns to `Disconnected`.

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::advertisement::{DeviceAdvertisement, ProtocolKind};
use super::classifier::classify;
use super::direction::{DirectionEstimate, DirectionEstimator};
use super::transport::{RawTransport, TransportProvider};
use crate::config::{AppConfig, CoordinatorSettings, SessionSettings};
use crate::error::{ConnectionError, ProtocolError};
use crate::protocol::{
    codec_for, ChannelInfo, Contact, FrameCodec, MeshPacket, ProtocolSession, SelfInfo,
    SessionEvent,
};

/// Channel used for signal broadcasts.
pub const PRIMARY_CHANNEL: u8 = 0;

const MESH_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    pub millivolts: Option<u16>,
    pub percent: Option<u8>,
}

/// Protocol independent view of the connected radio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub kind: ProtocolKind,
    pub name: String,
    pub node_num: u32,
    pub firmware: Option<String>,
    pub hardware: Option<String>,
    pub battery: Option<BatteryReading>,
}

impl DeviceInfo {
    fn from_self_info(
        kind: ProtocolKind,
        info: &SelfInfo,
        advertisement: &DeviceAdvertisement,
    ) -> Self {
        let name = if info.long_name.trim().is_empty() {
            advertisement.display_name().to_string()
        } else {
            info.long_name.clone()
        };
        let reported = info.battery_millivolts.is_some() || info.battery_percent.is_some();
        let battery = reported.then(|| BatteryReading {
            millivolts: info.battery_millivolts,
            percent: info.battery_percent,
        });

        Self {
            kind,
            name,
            node_num: info.node_num,
            firmware: info.firmware_version.clone(),
            hardware: info.hardware_model.clone(),
            battery,
        }
    }

    /// Node number in the usual `!xxxxxxxx` form.
    pub fn node_id(&self) -> String {
        format!("!{:08x}", self.node_num)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessEvidence {
    /// The radio answered an explicit probe.
    Probe,
    /// The family has no probe; the link being up is all we know.
    ConnectionEstablished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingReport {
    pub latency: Option<Duration>,
    pub evidence: LivenessEvidence,
}

/// What the signal engine needs from the mesh side.
#[async_trait]
pub trait MeshLink: Send + Sync {
    fn local_node(&self) -> Option<u32>;

    fn is_connected(&self) -> bool;

    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), ConnectionError>;

    fn subscribe_packets(&self) -> broadcast::Receiver<MeshPacket>;
}

struct ActiveLink {
    generation: u64,
    advertisement: DeviceAdvertisement,
    session: Arc<ProtocolSession>,
    transport: Arc<dyn RawTransport>,
    monitor: Option<JoinHandle<()>>,
}

/// What a connect attempt has opened so far. Released on drop unless the
/// attempt succeeded and took ownership with `disarm`.
struct PendingLink {
    inner: Arc<Inner>,
    attempt: u64,
    armed: bool,
    transport: Option<Arc<dyn RawTransport>>,
    session: Option<Arc<ProtocolSession>>,
}

impl PendingLink {
    fn new(inner: Arc<Inner>, attempt: u64) -> Self {
        Self {
            inner,
            attempt,
            armed: true,
            transport: None,
            session: None,
        }
    }

    fn disarm(&mut self) -> Option<(Arc<ProtocolSession>, Arc<dyn RawTransport>)> {
        if self.session.is_none() || self.transport.is_none() {
            return None;
        }
        self.armed = false;
        self.session.take().zip(self.transport.take())
    }

    /// Release after an ordinary failure, waiting for the disconnect.
    async fn release(mut self) {
        self.armed = false;
        if let Some(session) = self.session.take() {
            session.close();
        }
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.disconnect().await {
                debug!("Disconnect after failed connect: {}", e);
            }
        }
        self.settle_state();
    }

    fn settle_state(&self) {
        // A newer attempt or dispose owns the state now
        if self.inner.generation.load(Ordering::SeqCst) == self.attempt {
            self.inner.set_state(ConnectionState::Disconnected);
        }
    }
}

impl Drop for PendingLink {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        if let Some(transport) = self.transport.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if let Err(e) = transport.disconnect().await {
                            debug!("Disconnect after abandoned connect: {}", e);
                        }
                    });
                }
                Err(_) => warn!("No runtime to release an abandoned transport"),
            }
        }
        self.settle_state();
    }
}

struct Inner {
    provider: Arc<dyn TransportProvider>,
    settings: CoordinatorSettings,
    session_settings: SessionSettings,
    state: watch::Sender<ConnectionState>,
    device_info: RwLock<Option<Arc<DeviceInfo>>>,
    mesh: broadcast::Sender<MeshPacket>,
    active: tokio::sync::Mutex<Option<ActiveLink>>,
    generation: AtomicU64,
    direction: Mutex<DirectionEstimator>,
    last_device: Mutex<Option<String>>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Connection state: {:?} -> {:?}", previous, state);
        }
    }

    /// Release everything a link holds. Leaves the monitor running when
    /// called from the monitor itself.
    async fn teardown(&self, mut link: ActiveLink, abort_monitor: bool) {
        link.session.close();
        if let Err(e) = link.transport.disconnect().await {
            warn!("Failed to disconnect from {}: {}", link.advertisement.id, e);
        }
        if let Some(monitor) = link.monitor.take() {
            if abort_monitor {
                monitor.abort();
            }
        }
        *self.device_info.write() = None;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn link_lost(&self, generation: u64) {
        let mut active = self.active.lock().await;
        if active.as_ref().map(|link| link.generation) != Some(generation) {
            return;
        }
        if let Some(link) = active.take() {
            warn!("Link to {} lost", link.advertisement.display_name());
            self.direction.lock().reset();
            self.teardown(link, false).await;
        }
    }
}

/// Cheap to clone; clones share the same link.
#[derive(Clone)]
pub struct ConnectionCoordinator {
    inner: Arc<Inner>,
}

impl ConnectionCoordinator {
    pub fn new(provider: Arc<dyn TransportProvider>, config: &AppConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (mesh, _) = broadcast::channel(MESH_BUFFER);

        Self {
            inner: Arc::new(Inner {
                provider,
                settings: config.coordinator.clone(),
                session_settings: config.session.clone(),
                state,
                device_info: RwLock::new(None),
                mesh,
                active: tokio::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
                direction: Mutex::new(DirectionEstimator::new(config.direction.clone())),
                last_device: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_mesh(&self) -> broadcast::Receiver<MeshPacket> {
        self.inner.mesh.subscribe()
    }

    /// Current device view, `None` unless connected.
    pub fn device_info(&self) -> Option<Arc<DeviceInfo>> {
        self.inner.device_info.read().clone()
    }

    pub fn local_node(&self) -> Option<u32> {
        self.device_info().map(|info| info.node_num)
    }

    /// Classify, open, start the session and handshake. Any existing link
    /// is torn down first. Dropping the returned future mid-handshake, or a
    /// later `connect`/`dispose`, abandons the attempt and releases what it
    /// opened.
    pub async fn connect(
        &self,
        advertisement: &DeviceAdvertisement,
    ) -> Result<Arc<DeviceInfo>, ConnectionError> {
        let classification = classify(advertisement);
        let Some(codec) = codec_for(classification.kind) else {
            warn!(
                "No protocol driver for {} ({:?})",
                advertisement.display_name(),
                classification.evidence
            );
            return Err(ConnectionError::ProtocolMismatch);
        };
        info!(
            "Connecting to {} as {} (confidence {:.2})",
            advertisement.display_name(),
            classification.kind,
            classification.confidence
        );

        let attempt = {
            let mut active = self.inner.active.lock().await;
            if let Some(link) = active.take() {
                self.inner.teardown(link, true).await;
            }
            self.inner.set_state(ConnectionState::Connecting);
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        let mut pending = PendingLink::new(self.inner.clone(), attempt);

        let transport = self.inner.provider.open(advertisement, classification.kind)?;
        pending.transport = Some(transport.clone());

        let handshake = self.handshake(advertisement, codec, transport, &mut pending).await;
        let (info, events) = match handshake {
            Ok(handshake) => handshake,
            Err(err) => {
                warn!("Connection to {} failed: {}", advertisement.display_name(), err);
                pending.release().await;
                return Err(err);
            }
        };

        let mut active = self.inner.active.lock().await;
        if self.inner.generation.load(Ordering::SeqCst) != attempt {
            drop(active);
            info!("Connection to {} was superseded", advertisement.display_name());
            pending.release().await;
            return Err(ConnectionError::Cancelled);
        }
        let Some((session, transport)) = pending.disarm() else {
            return Err(ConnectionError::NotConnected);
        };

        let monitor = tokio::spawn(monitor_link(Arc::downgrade(&self.inner), events, attempt));
        *active = Some(ActiveLink {
            generation: attempt,
            advertisement: advertisement.clone(),
            session,
            transport,
            monitor: Some(monitor),
        });
        *self.inner.device_info.write() = Some(info.clone());
        *self.inner.last_device.lock() = Some(advertisement.id.clone());
        self.inner.direction.lock().reset();
        self.inner.set_state(ConnectionState::Connected);

        info!("Connected to {} ({})", info.name, info.node_id());
        Ok(info)
    }

    async fn handshake(
        &self,
        advertisement: &DeviceAdvertisement,
        codec: Arc<dyn FrameCodec>,
        transport: Arc<dyn RawTransport>,
        pending: &mut PendingLink,
    ) -> Result<(Arc<DeviceInfo>, broadcast::Receiver<SessionEvent>), ConnectionError> {
        let kind = codec.kind();

        tokio::time::timeout(self.inner.settings.connect_timeout(), transport.connect())
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        let session =
            ProtocolSession::start(codec, transport, &self.inner.session_settings).await?;
        let events = session.subscribe();
        pending.session = Some(session.clone());

        let self_info =
            tokio::time::timeout(self.inner.settings.handshake_timeout(), session.get_self_info())
                .await
                .map_err(|_| ConnectionError::Timeout)?
                .map_err(map_protocol)?;

        let info = DeviceInfo::from_self_info(kind, &self_info, advertisement);
        Ok((Arc::new(info), events))
    }

    async fn current_link(
        &self,
    ) -> Result<(Arc<ProtocolSession>, Arc<dyn RawTransport>), ConnectionError> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|link| (link.session.clone(), link.transport.clone()))
            .ok_or(ConnectionError::NotConnected)
    }

    /// Re-read identity from the radio and rebuild the device view.
    pub async fn refresh_identity(&self) -> Result<Arc<DeviceInfo>, ConnectionError> {
        let (session, advertisement) = {
            let active = self.inner.active.lock().await;
            let link = active.as_ref().ok_or(ConnectionError::NotConnected)?;
            (link.session.clone(), link.advertisement.clone())
        };

        let self_info = session.get_self_info().await.map_err(map_protocol)?;
        let info = Arc::new(DeviceInfo::from_self_info(session.kind(), &self_info, &advertisement));
        *self.inner.device_info.write() = Some(info.clone());
        Ok(info)
    }

    /// Liveness check. Families without a probe report the established link
    /// as weak evidence instead.
    pub async fn ping(&self) -> Result<PingReport, ConnectionError> {
        let (session, transport) = self.current_link().await?;

        if !session.capabilities().ping {
            return if self.state() == ConnectionState::Connected && transport.is_connected().await {
                Ok(PingReport {
                    latency: None,
                    evidence: LivenessEvidence::ConnectionEstablished,
                })
            } else {
                Err(ConnectionError::NotConnected)
            };
        }

        let latency = tokio::time::timeout(self.inner.settings.ping_timeout(), session.ping())
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(map_protocol)?;
        debug!("Ping round trip {:?}", latency);

        Ok(PingReport {
            latency: Some(latency),
            evidence: LivenessEvidence::Probe,
        })
    }

    pub async fn discover_debug_topology(&self) -> Result<Vec<String>, ConnectionError> {
        let (session, _) = self.current_link().await?;
        session.debug_topology().await.map_err(map_protocol)
    }

    pub async fn contacts(&self) -> Result<Vec<Contact>, ConnectionError> {
        let (session, _) = self.current_link().await?;
        session.get_contacts().await.map_err(map_protocol)
    }

    pub async fn channels(&self) -> Result<Vec<ChannelInfo>, ConnectionError> {
        let (session, _) = self.current_link().await?;
        session.get_channels().await.map_err(map_protocol)
    }

    pub async fn set_channel(&self, channel: ChannelInfo) -> Result<(), ConnectionError> {
        let (session, _) = self.current_link().await?;
        session.set_channel(channel).await.map_err(map_protocol)
    }

    /// Compact hex dump of the active session's capture ring.
    pub async fn capture_log(&self) -> Option<String> {
        let (session, _) = self.current_link().await.ok()?;
        Some(session.capture().to_compact_hex_log())
    }

    /// Feed a scan result into the bearing estimate. Only samples for the
    /// last connected device are used, and only while disconnected.
    pub fn observe_rssi(&self, advertisement: &DeviceAdvertisement, heading: Option<f64>) -> bool {
        if self.state() == ConnectionState::Connected {
            return false;
        }
        let Some(strength) = advertisement.rssi else {
            return false;
        };
        if self.inner.last_device.lock().as_deref() != Some(advertisement.id.as_str()) {
            return false;
        }
        self.inner.direction.lock().add_sample(strength, heading);
        true
    }

    pub fn reconnection_bearing(&self) -> DirectionEstimate {
        self.inner.direction.lock().estimate()
    }

    /// Feed scan results into the bearing for as long as the link stays
    /// down. Returns `true` once a connect starts, `false` if the scan
    /// ends first.
    pub async fn track_lost_radio(
        &self,
        advertisements: &mut mpsc::Receiver<DeviceAdvertisement>,
    ) -> bool {
        let mut states = self.subscribe_state();
        loop {
            if *states.borrow_and_update() != ConnectionState::Disconnected {
                return true;
            }
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                advertisement = advertisements.recv() => {
                    let Some(advertisement) = advertisement else {
                        return false;
                    };
                    if !self.observe_rssi(&advertisement, None) {
                        continue;
                    }
                    let bearing = self.reconnection_bearing();
                    info!(
                        "{} at {} dBm, heading {}, confidence {:.2} over {} samples",
                        advertisement.display_name(),
                        bearing
                            .last_strength
                            .map(|rssi| rssi.to_string())
                            .unwrap_or_else(|| "?".to_string()),
                        bearing
                            .heading
                            .map(|heading| format!("{heading:.0} deg"))
                            .unwrap_or_else(|| "unknown".to_string()),
                        bearing.confidence,
                        bearing.sample_count
                    );
                }
            }
        }
    }

    /// Tear down the active link, if any, and abandon any connect still in
    /// progress. Safe to call repeatedly.
    pub async fn dispose(&self) {
        let mut active = self.inner.active.lock().await;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = active.take() {
            info!("Disposing link to {}", link.advertisement.display_name());
            self.inner.teardown(link, true).await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl MeshLink for ConnectionCoordinator {
    fn local_node(&self) -> Option<u32> {
        ConnectionCoordinator::local_node(self)
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        let (session, _) = self.current_link().await?;
        session
            .send_mesh_payload(PRIMARY_CHANNEL, payload)
            .await
            .map_err(map_protocol)
    }

    fn subscribe_packets(&self) -> broadcast::Receiver<MeshPacket> {
        self.subscribe_mesh()
    }
}

fn map_protocol(err: ProtocolError) -> ConnectionError {
    match err {
        ProtocolError::Timeout { .. } => ConnectionError::Timeout,
        ProtocolError::Unsupported(operation) => ConnectionError::Unsupported(operation),
        other => ConnectionError::Protocol(other),
    }
}

async fn monitor_link(
    inner: Weak<Inner>,
    mut events: broadcast::Receiver<SessionEvent>,
    generation: u64,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::MeshPacket(packet)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                debug!("Mesh packet from !{:08x}, {} bytes", packet.from, packet.payload.len());
                let _ = inner.mesh.send(packet);
            }
            Ok(SessionEvent::ProtocolViolation(e)) => debug!("Session reported violation: {}", e),
            Ok(SessionEvent::LinkLost) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Link monitor skipped {} session events", skipped)
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.link_lost(generation).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::simulated::{RadioBehavior, SimulatedProvider, SimulatedRadio};
    use crate::error::TransportError;

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.session.request_timeout_ms = 200;
        config.coordinator.connect_timeout_ms = 200;
        config.coordinator.handshake_timeout_ms = 300;
        config.coordinator.ping_timeout_ms = 200;
        config
    }

    fn setup(kind: ProtocolKind) -> (ConnectionCoordinator, Arc<SimulatedRadio>) {
        let provider = Arc::new(SimulatedProvider::new());
        let radio = SimulatedRadio::new(kind, "Summit", 0x00C0FFEE);
        provider.add(radio.clone());
        (ConnectionCoordinator::new(provider, &fast_config()), radio)
    }

    async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .expect("state change timed out")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn connect_builds_device_info() {
        let (coordinator, radio) = setup(ProtocolKind::Meshtastic);
        assert!(coordinator.device_info().is_none());

        let info = coordinator.connect(&radio.advertisement()).await.unwrap();
        assert_eq!(info.kind, ProtocolKind::Meshtastic);
        assert_eq!(info.name, "Summit");
        assert_eq!(info.node_id(), "!00c0ffee");
        assert_eq!(info.battery.as_ref().and_then(|b| b.percent), Some(92));
        assert_eq!(coordinator.state(), ConnectionState::Connected);
        assert_eq!(coordinator.local_node(), Some(0x00C0FFEE));
    }

    #[tokio::test]
    async fn unknown_advertisement_is_a_protocol_mismatch() {
        let (coordinator, _) = setup(ProtocolKind::Meshtastic);
        let adv = DeviceAdvertisement::new("headphones").with_name("Buds Pro");

        assert_eq!(coordinator.connect(&adv).await.unwrap_err(), ConnectionError::ProtocolMismatch);
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn handshake_timeout_releases_transport() {
        let (coordinator, radio) = setup(ProtocolKind::MeshCore);
        radio.set_behavior(RadioBehavior::Silent);

        assert_eq!(
            coordinator.connect(&radio.advertisement()).await.unwrap_err(),
            ConnectionError::Timeout
        );
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert!(!radio.is_connected().await);
        assert!(coordinator.device_info().is_none());
    }

    #[tokio::test]
    async fn dropped_connect_releases_the_radio() {
        let (coordinator, radio) = setup(ProtocolKind::Meshtastic);
        radio.set_behavior(RadioBehavior::Silent);

        let adv = radio.advertisement();
        let attempt =
            tokio::time::timeout(Duration::from_millis(50), coordinator.connect(&adv)).await;
        assert!(attempt.is_err());
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);

        tokio::time::timeout(Duration::from_secs(2), async {
            while radio.is_connected().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("transport was never released");

        tokio::time::timeout(Duration::from_millis(100), coordinator.dispose())
            .await
            .expect("dispose blocked");

        radio.set_behavior(RadioBehavior::Normal);
        coordinator.connect(&adv).await.unwrap();
        assert_eq!(coordinator.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn dispose_abandons_a_pending_connect() {
        let (coordinator, radio) = setup(ProtocolKind::Meshtastic);
        radio.set_behavior(RadioBehavior::Silent);
        let mut states = coordinator.subscribe_state();

        let pending = {
            let coordinator = coordinator.clone();
            let adv = radio.advertisement();
            tokio::spawn(async move { coordinator.connect(&adv).await })
        };
        wait_for_state(&mut states, ConnectionState::Connecting).await;

        tokio::time::timeout(Duration::from_millis(100), coordinator.dispose())
            .await
            .expect("dispose waited on the handshake");
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);

        assert!(pending.await.unwrap().is_err());
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert!(!radio.is_connected().await);
        assert!(coordinator.device_info().is_none());
    }

    #[tokio::test]
    async fn refused_transport_surfaces_transport_error() {
        let (coordinator, radio) = setup(ProtocolKind::Meshtastic);
        radio.set_behavior(RadioBehavior::RefuseConnect);

        assert!(matches!(
            coordinator.connect(&radio.advertisement()).await,
            Err(ConnectionError::Transport(TransportError::Io(_)))
        ));
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn ping_uses_probe_when_available() {
        let (coordinator, radio) = setup(ProtocolKind::Meshtastic);
        assert_eq!(coordinator.ping().await.unwrap_err(), ConnectionError::NotConnected);

        coordinator.connect(&radio.advertisement()).await.unwrap();
        let report = coordinator.ping().await.unwrap();
        assert_eq!(report.evidence, LivenessEvidence::Probe);
        assert!(report.latency.is_some());
    }

    #[tokio::test]
    async fn ping_falls_back_to_link_state() {
        let (coordinator, radio) = setup(ProtocolKind::MeshCore);
        coordinator.connect(&radio.advertisement()).await.unwrap();

        let report = coordinator.ping().await.unwrap();
        assert_eq!(report.evidence, LivenessEvidence::ConnectionEstablished);
        assert_eq!(report.latency, None);
    }

    #[tokio::test]
    async fn debug_topology_is_capability_gated() {
        let (coordinator, radio) = setup(ProtocolKind::MeshCore);
        coordinator.connect(&radio.advertisement()).await.unwrap();

        assert_eq!(
            coordinator.discover_debug_topology().await.unwrap_err(),
            ConnectionError::Unsupported("debug_topology")
        );
    }

    #[tokio::test]
    async fn link_loss_moves_to_disconnected() {
        let (coordinator, radio) = setup(ProtocolKind::Meshtastic);
        let mut states = coordinator.subscribe_state();
        coordinator.connect(&radio.advertisement()).await.unwrap();
        wait_for_state(&mut states, ConnectionState::Connected).await;

        radio.drop_link();
        wait_for_state(&mut states, ConnectionState::Disconnected).await;
        assert!(coordinator.device_info().is_none());
    }

    #[tokio::test]
    async fn mesh_packets_reach_subscribers() {
        let (coordinator, radio) = setup(ProtocolKind::Meshtastic);
        let mut packets = coordinator.subscribe_mesh();
        coordinator.connect(&radio.advertisement()).await.unwrap();

        let packet = MeshPacket {
            from: 0x10,
            packet_id: Some(5),
            channel: PRIMARY_CHANNEL,
            hop_count: Some(3),
            payload: b"hello".to_vec(),
        };
        radio.inject_mesh_packet(&packet).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), packets.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, packet);
    }

    #[tokio::test]
    async fn broadcast_goes_through_the_radio() {
        let (coordinator, radio) = setup(ProtocolKind::MeshCore);
        assert_eq!(
            MeshLink::broadcast(&coordinator, vec![1]).await.unwrap_err(),
            ConnectionError::NotConnected
        );

        coordinator.connect(&radio.advertisement()).await.unwrap();
        MeshLink::broadcast(&coordinator, vec![0x53, 0x01]).await.unwrap();
        assert_eq!(radio.sent_payloads(), vec![(PRIMARY_CHANNEL, vec![0x53, 0x01])]);
    }

    #[tokio::test]
    async fn rssi_is_only_tracked_for_the_lost_device() {
        let (coordinator, radio) = setup(ProtocolKind::Meshtastic);
        let adv = radio.advertisement();
        assert!(!coordinator.observe_rssi(&adv, Some(90.0)));

        coordinator.connect(&adv).await.unwrap();
        assert!(!coordinator.observe_rssi(&adv, Some(90.0)));

        coordinator.dispose().await;
        assert!(coordinator.observe_rssi(&adv, Some(90.0)));
        let other = DeviceAdvertisement::new("other").with_rssi(-40);
        assert!(!coordinator.observe_rssi(&other, Some(90.0)));
        assert_eq!(coordinator.reconnection_bearing().sample_count, 1);
    }

    #[tokio::test]
    async fn scan_results_steer_the_bearing_until_reconnect() {
        let (coordinator, radio) = setup(ProtocolKind::Meshtastic);
        let adv = radio.advertisement();
        coordinator.connect(&adv).await.unwrap();
        coordinator.dispose().await;

        let (scan, mut advertisements) = mpsc::channel(8);
        scan.send(adv.clone().with_rssi(-71)).await.unwrap();
        scan.send(DeviceAdvertisement::new("other").with_rssi(-40)).await.unwrap();
        scan.send(adv.clone().with_rssi(-64)).await.unwrap();

        let tracker = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.track_lost_radio(&mut advertisements).await })
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while coordinator.reconnection_bearing().sample_count < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scan results never reached the bearing");
        assert_eq!(coordinator.reconnection_bearing().last_strength, Some(-64));

        coordinator.connect(&adv).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(2), tracker).await.unwrap().unwrap());
        drop(scan);
    }

    #[tokio::test]
    async fn tracking_stops_when_the_scan_ends() {
        let (coordinator, _) = setup(ProtocolKind::Meshtastic);
        let (scan, mut advertisements) = mpsc::channel(1);
        drop(scan);

        assert!(!coordinator.track_lost_radio(&mut advertisements).await);
        assert_eq!(coordinator.reconnection_bearing().sample_count, 0);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let (coordinator, radio) = setup(ProtocolKind::Meshtastic);
        coordinator.connect(&radio.advertisement()).await.unwrap();

        coordinator.dispose().await;
        coordinator.dispose().await;
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert!(!radio.is_connected().await);
        assert!(coordinator.capture_log().await.is_none());
    }
}
