//! In-process companion radio.
//!
//! Answers app requests with the family codec's radio-side functions, so the
//! whole session stack can run without hardware. Used by the `--simulate`
//! mode of the binary and by tests.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::advertisement::{DeviceAdvertisement, ProtocolKind};
use super::classifier::{MESHCORE_SERVICE_UUID, MESHTASTIC_SERVICE_UUID};
use super::transport::{GattProfile, RawTransport, TransportProvider};
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{
    codec_for, ChannelInfo, Contact, FrameCodec, MeshPacket, MeshtasticCodec, Reply, ReplyKind,
    Request, SelfInfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioBehavior {
    Normal,
    /// Accepts writes, never answers.
    Silent,
    /// Answers with a reply of the wrong kind.
    WrongReply,
    /// Answers every request with a device error.
    Reject { code: u8 },
    RefuseConnect,
}

pub struct SimulatedRadio {
    codec: Arc<dyn FrameCodec>,
    identity: Mutex<SelfInfo>,
    advertisement: DeviceAdvertisement,
    behavior: Mutex<RadioBehavior>,
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    contacts: Mutex<Vec<Contact>>,
    channels: Mutex<Vec<ChannelInfo>>,
    sent: Mutex<Vec<(u8, Vec<u8>)>>,
    requests_seen: AtomicUsize,
}

impl SimulatedRadio {
    /// An `Unknown` kind falls back to a Meshtastic radio.
    pub fn new(kind: ProtocolKind, name: &str, node_num: u32) -> Arc<Self> {
        let codec =
            codec_for(kind).unwrap_or_else(|| Arc::new(MeshtasticCodec) as Arc<dyn FrameCodec>);
        let kind = codec.kind();

        let id = format!("sim-{node_num:08x}");
        let advertisement = match kind {
            ProtocolKind::MeshCore => {
                DeviceAdvertisement::new(id).with_service(MESHCORE_SERVICE_UUID)
            }
            _ => DeviceAdvertisement::new(id).with_service(MESHTASTIC_SERVICE_UUID),
        }
        .with_name(name)
        .with_rssi(-60);

        Arc::new(Self {
            codec,
            identity: Mutex::new(SelfInfo {
                node_num,
                long_name: name.to_string(),
                short_name: Some(name.chars().take(4).collect()),
                firmware_version: Some("sim-1.0".to_string()),
                hardware_model: Some("SIMULATOR".to_string()),
                battery_millivolts: Some(4100),
                battery_percent: Some(92),
            }),
            advertisement,
            behavior: Mutex::new(RadioBehavior::Normal),
            connected: AtomicBool::new(false),
            outbound: Mutex::new(None),
            contacts: Mutex::new(Vec::new()),
            channels: Mutex::new(vec![ChannelInfo {
                index: 0,
                name: "primary".to_string(),
                psk: None,
            }]),
            sent: Mutex::new(Vec::new()),
            requests_seen: AtomicUsize::new(0),
        })
    }

    pub fn kind(&self) -> ProtocolKind {
        self.codec.kind()
    }

    pub fn advertisement(&self) -> DeviceAdvertisement {
        self.advertisement.clone()
    }

    pub fn node_num(&self) -> u32 {
        self.identity.lock().node_num
    }

    pub fn set_behavior(&self, behavior: RadioBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn add_contact(&self, contact: Contact) {
        self.contacts.lock().push(contact);
    }

    pub fn set_battery_percent(&self, percent: Option<u8>) {
        self.identity.lock().battery_percent = percent;
    }

    /// Payloads the app broadcast through this radio, with their channel.
    pub fn sent_payloads(&self) -> Vec<(u8, Vec<u8>)> {
        self.sent.lock().clone()
    }

    pub fn requests_seen(&self) -> usize {
        self.requests_seen.load(Ordering::SeqCst)
    }

    /// Push a packet as if it had been heard on the mesh.
    pub fn inject_mesh_packet(&self, packet: &MeshPacket) -> Result<(), ProtocolError> {
        let frame = self.codec.encode_mesh_packet(packet)?;
        self.push(frame);
        Ok(())
    }

    /// End the notification stream as a lost link would.
    pub fn drop_link(&self) {
        info!("simulated radio {} dropping link", self.advertisement.id);
        self.connected.store(false, Ordering::SeqCst);
        self.outbound.lock().take();
    }

    fn push(&self, frame: Vec<u8>) {
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    fn answer(&self, request: Request) -> Option<Reply> {
        let behavior = *self.behavior.lock();
        match behavior {
            RadioBehavior::Silent | RadioBehavior::RefuseConnect => None,
            RadioBehavior::Reject { code } => Some(Reply::Error { code }),
            RadioBehavior::WrongReply => Some(match request.expected_reply() {
                ReplyKind::Ack => Reply::Channels(self.channels.lock().clone()),
                _ => Reply::Ack,
            }),
            RadioBehavior::Normal => Some(match request {
                Request::GetSelfInfo => Reply::SelfInfo(self.identity.lock().clone()),
                Request::GetContacts => Reply::Contacts(self.contacts.lock().clone()),
                Request::GetChannels => Reply::Channels(self.channels.lock().clone()),
                Request::SetChannel(channel) => {
                    let mut channels = self.channels.lock();
                    channels.retain(|c| c.index != channel.index);
                    channels.push(channel);
                    channels.sort_by_key(|c| c.index);
                    Reply::Ack
                }
                Request::Ping => Reply::Pong,
                Request::SendPayload { channel, payload } => {
                    self.sent.lock().push((channel, payload));
                    Reply::Ack
                }
            }),
        }
    }
}

#[async_trait]
impl RawTransport for SimulatedRadio {
    async fn connect(&self) -> Result<(), TransportError> {
        if *self.behavior.lock() == RadioBehavior::RefuseConnect {
            return Err(TransportError::Io("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.outbound.lock().take();
        Ok(())
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.requests_seen.fetch_add(1, Ordering::SeqCst);

        let (tag, request) = match self.codec.decode_request(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("simulated radio ignoring frame: {}", e);
                return Ok(());
            }
        };

        if let Some(reply) = self.answer(request) {
            match self.codec.encode_reply(tag, &reply) {
                Ok(frame) => self.push(frame),
                Err(e) => debug!("simulated radio cannot encode reply: {}", e),
            }
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed())
    }

    async fn endpoints(&self) -> Result<Vec<String>, TransportError> {
        GattProfile::for_kind(self.kind())
            .map(|profile| profile.endpoints())
            .ok_or_else(|| TransportError::MissingEndpoint(self.kind().to_string()))
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Hands out registered simulated radios by advertisement id.
#[derive(Default)]
pub struct SimulatedProvider {
    radios: DashMap<String, Arc<SimulatedRadio>>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, radio: Arc<SimulatedRadio>) {
        self.radios.insert(radio.advertisement.id.clone(), radio);
    }

    pub fn radio(&self, id: &str) -> Option<Arc<SimulatedRadio>> {
        self.radios.get(id).map(|r| r.value().clone())
    }

    pub fn advertisements(&self) -> Vec<DeviceAdvertisement> {
        self.radios.iter().map(|r| r.value().advertisement()).collect()
    }
}

impl TransportProvider for SimulatedProvider {
    fn open(
        &self,
        advertisement: &DeviceAdvertisement,
        _kind: ProtocolKind,
    ) -> Result<Arc<dyn RawTransport>, TransportError> {
        self.radio(&advertisement.id)
            .map(|radio| radio as Arc<dyn RawTransport>)
            .ok_or_else(|| TransportError::MissingEndpoint(advertisement.id.clone()))
    }
}
