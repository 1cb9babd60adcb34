//! Correlated request/response over a raw transport.
//!
//! Each request gets a `u16` tag. Replies are matched to the oldest pending
//! request with the same tag; anything else is a protocol violation that is
//! both returned to the waiter (if any) and published on the event stream.

use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use super::capture::{DebugCapture, FrameDirection};
use super::{
    ChannelInfo, Contact, FrameCodec, Inbound, MeshPacket, Reply, ReplyKind, Request, SelfInfo,
    SessionCapabilities, UNSOLICITED_TAG,
};
use crate::bluetooth::{ProtocolKind, RawTransport};
use crate::config::SessionSettings;
use crate::error::ProtocolError;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MeshPacket(MeshPacket),
    /// The transport's notification stream ended.
    LinkLost,
    ProtocolViolation(ProtocolError),
}

struct PendingRequest {
    id: u64,
    expected: ReplyKind,
    reply_tx: oneshot::Sender<Result<Reply, ProtocolError>>,
}

/// State shared between the session handle and its reader task.
struct Shared {
    kind: ProtocolKind,
    codec: Arc<dyn FrameCodec>,
    pending: Mutex<HashMap<u16, VecDeque<PendingRequest>>>,
    capture: Arc<DebugCapture>,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn dispatch(&self, tag: u16, reply: Reply) {
        let waiter = {
            let mut pending = self.pending.lock();
            let waiter = pending.get_mut(&tag).and_then(VecDeque::pop_front);
            if pending.get(&tag).is_some_and(VecDeque::is_empty) {
                pending.remove(&tag);
            }
            waiter
        };

        let Some(waiter) = waiter else {
            self.violation(ProtocolError::UnexpectedReply {
                tag,
                expected: "no pending request".to_string(),
                got: reply.kind().to_string(),
            });
            return;
        };

        let result = match reply {
            Reply::Error { code } => Err(ProtocolError::Device { code }),
            reply if reply.kind() == waiter.expected => Ok(reply),
            reply => {
                let err = ProtocolError::UnexpectedReply {
                    tag,
                    expected: waiter.expected.to_string(),
                    got: reply.kind().to_string(),
                };
                self.violation(err.clone());
                Err(err)
            }
        };

        // Waiter may have timed out already
        let _ = waiter.reply_tx.send(result);
    }

    fn violation(&self, err: ProtocolError) {
        warn!("{} session protocol violation: {}", self.kind, err);
        let _ = self.events.send(SessionEvent::ProtocolViolation(err));
    }

    fn remove_pending(&self, tag: u16, id: u64) {
        let mut pending = self.pending.lock();
        if let Some(queue) = pending.get_mut(&tag) {
            queue.retain(|p| p.id != id);
            if queue.is_empty() {
                pending.remove(&tag);
            }
        }
    }

    fn fail_all(&self, err: ProtocolError) {
        let drained: Vec<PendingRequest> = self
            .pending
            .lock()
            .drain()
            .flat_map(|(_, queue)| queue)
            .collect();
        for waiter in drained {
            let _ = waiter.reply_tx.send(Err(err.clone()));
        }
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().values().map(VecDeque::len).sum()
    }
}

pub struct ProtocolSession {
    shared: Arc<Shared>,
    transport: Arc<dyn RawTransport>,
    next_tag: AtomicU16,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Receiver created with the channel, handed to the first subscriber
    first_events: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
}

impl ProtocolSession {
    /// Subscribe to the transport and start the reader task.
    pub async fn start(
        codec: Arc<dyn FrameCodec>,
        transport: Arc<dyn RawTransport>,
        settings: &SessionSettings,
    ) -> Result<Arc<Self>, ProtocolError> {
        let frames = transport.notifications().await?;
        let (events, first_events) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            kind: codec.kind(),
            codec,
            pending: Mutex::new(HashMap::new()),
            capture: Arc::new(DebugCapture::new(settings.capture_capacity)),
            events,
        });

        let reader = tokio::spawn(read_loop(shared.clone(), frames));
        info!("{} session started", shared.kind);

        Ok(Arc::new(Self {
            shared,
            transport,
            next_tag: AtomicU16::new(rand::thread_rng().gen_range(1..=u16::MAX)),
            next_id: AtomicU64::new(1),
            request_timeout: settings.request_timeout(),
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
            first_events: Mutex::new(Some(first_events)),
        }))
    }

    pub fn kind(&self) -> ProtocolKind {
        self.shared.kind
    }

    pub fn capabilities(&self) -> SessionCapabilities {
        self.shared.codec.capabilities()
    }

    /// The first subscriber sees every event since `start`; later ones only
    /// see events published after they subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        match self.first_events.lock().take() {
            Some(events) => events,
            None => self.shared.events.subscribe(),
        }
    }

    pub fn capture(&self) -> Arc<DebugCapture> {
        self.shared.capture.clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending_count()
    }

    pub async fn get_self_info(&self) -> Result<SelfInfo, ProtocolError> {
        self.call(Request::GetSelfInfo, |reply| match reply {
            Reply::SelfInfo(info) => Some(info),
            _ => None,
        })
        .await
    }

    pub async fn get_contacts(&self) -> Result<Vec<Contact>, ProtocolError> {
        self.call(Request::GetContacts, |reply| match reply {
            Reply::Contacts(contacts) => Some(contacts),
            _ => None,
        })
        .await
    }

    pub async fn get_channels(&self) -> Result<Vec<ChannelInfo>, ProtocolError> {
        self.call(Request::GetChannels, |reply| match reply {
            Reply::Channels(channels) => Some(channels),
            _ => None,
        })
        .await
    }

    pub async fn set_channel(&self, channel: ChannelInfo) -> Result<(), ProtocolError> {
        self.call(Request::SetChannel(channel), |reply| match reply {
            Reply::Ack => Some(()),
            _ => None,
        })
        .await
    }

    /// Round trip of an explicit liveness probe.
    pub async fn ping(&self) -> Result<Duration, ProtocolError> {
        if !self.capabilities().ping {
            return Err(ProtocolError::Unsupported("ping"));
        }
        let started = Instant::now();
        self.call(Request::Ping, |reply| match reply {
            Reply::Pong => Some(()),
            _ => None,
        })
        .await?;
        Ok(started.elapsed())
    }

    pub async fn send_mesh_payload(
        &self,
        channel: u8,
        payload: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        self.call(Request::SendPayload { channel, payload }, |reply| match reply {
            Reply::Ack => Some(()),
            _ => None,
        })
        .await
    }

    pub async fn debug_topology(&self) -> Result<Vec<String>, ProtocolError> {
        if !self.capabilities().debug_topology {
            return Err(ProtocolError::Unsupported("debug_topology"));
        }
        Ok(self.transport.endpoints().await?)
    }

    /// Stop the reader, fail whatever is still waiting and drop captured frames.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.fail_all(ProtocolError::Closed);
        self.shared.capture.clear();
        info!("{} session closed", self.shared.kind);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn call<T>(
        &self,
        request: Request,
        extract: impl FnOnce(Reply) -> Option<T>,
    ) -> Result<T, ProtocolError> {
        let (tag, reply) = self.request(&request).await?;
        let kind = reply.kind();
        extract(reply).ok_or_else(|| ProtocolError::UnexpectedReply {
            tag,
            expected: request.expected_reply().to_string(),
            got: kind.to_string(),
        })
    }

    /// One request, one reply, bounded by the request timeout. Never retries.
    async fn request(&self, request: &Request) -> Result<(u16, Reply), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }

        let tag = self.allocate_tag();
        let frame = self.shared.codec.encode_request(tag, request)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        // Registered before the write so a fast reply can't race us
        self.shared
            .pending
            .lock()
            .entry(tag)
            .or_default()
            .push_back(PendingRequest {
                id,
                expected: request.expected_reply(),
                reply_tx,
            });

        self.shared.capture.record(FrameDirection::Tx, &frame);
        debug!(
            "{} tx {} tag={} {}",
            self.shared.kind,
            request.operation(),
            tag,
            hex::encode(&frame)
        );

        if let Err(e) = self.transport.write(&frame).await {
            self.shared.remove_pending(tag, id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result.map(|reply| (tag, reply)),
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Err(_) => {
                self.shared.remove_pending(tag, id);
                warn!(
                    "{} request {} (tag {}) timed out after {:?}",
                    self.shared.kind,
                    request.operation(),
                    tag,
                    self.request_timeout
                );
                Err(ProtocolError::Timeout {
                    operation: request.operation(),
                })
            }
        }
    }

    fn allocate_tag(&self) -> u16 {
        loop {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            if tag != UNSOLICITED_TAG {
                return tag;
            }
        }
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut frames: BoxStream<'static, Vec<u8>>) {
    while let Some(frame) = frames.next().await {
        shared.capture.record(FrameDirection::Rx, &frame);
        debug!("{} rx {}", shared.kind, hex::encode(&frame));

        match shared.codec.decode_inbound(&frame) {
            Ok(Inbound::MeshPacket(packet)) => {
                let _ = shared.events.send(SessionEvent::MeshPacket(packet));
            }
            Ok(Inbound::Reply { tag, reply }) => shared.dispatch(tag, reply),
            Err(e) => shared.violation(e),
        }
    }

    info!("{} notification stream ended", shared.kind);
    shared.fail_all(ProtocolError::Closed);
    let _ = shared.events.send(SessionEvent::LinkLost);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::simulated::{RadioBehavior, SimulatedRadio};
    use crate::protocol::{MeshCoreCodec, MeshtasticCodec};

    fn settings(timeout_ms: u64) -> SessionSettings {
        SessionSettings {
            request_timeout_ms: timeout_ms,
            capture_capacity: 16,
        }
    }

    async fn session_for(radio: &Arc<SimulatedRadio>, timeout_ms: u64) -> Arc<ProtocolSession> {
        radio.connect().await.unwrap();
        let codec = crate::protocol::codec_for(radio.kind()).unwrap();
        ProtocolSession::start(codec, radio.clone(), &settings(timeout_ms))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn self_info_round_trip() {
        let radio = SimulatedRadio::new(ProtocolKind::Meshtastic, "Hilltop", 0x0BADCAFE);
        let session = session_for(&radio, 1000).await;

        let info = session.get_self_info().await.unwrap();
        assert_eq!(info.node_num, 0x0BADCAFE);
        assert_eq!(info.long_name, "Hilltop");
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn silent_radio_times_out_without_retry() {
        let radio = SimulatedRadio::new(ProtocolKind::Meshtastic, "Mute", 1);
        radio.set_behavior(RadioBehavior::Silent);
        let session = session_for(&radio, 50).await;

        let err = session.get_channels().await.unwrap_err();
        assert_eq!(err, ProtocolError::Timeout { operation: "get_channels" });
        assert_eq!(radio.requests_seen(), 1);
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn mismatched_reply_is_surfaced() {
        let radio = SimulatedRadio::new(ProtocolKind::MeshCore, "Crossed", 2);
        radio.set_behavior(RadioBehavior::WrongReply);
        let session = session_for(&radio, 1000).await;
        let mut events = session.subscribe();

        let err = session
            .set_channel(ChannelInfo {
                index: 0,
                name: "public".to_string(),
                psk: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedReply { .. }), "{err:?}");

        match events.recv().await.unwrap() {
            SessionEvent::ProtocolViolation(ProtocolError::UnexpectedReply {
                expected, got, ..
            }) => {
                assert_eq!(expected, "ack");
                assert_eq!(got, "channels");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn device_error_code_is_returned() {
        let radio = SimulatedRadio::new(ProtocolKind::Meshtastic, "Grumpy", 3);
        radio.set_behavior(RadioBehavior::Reject { code: 7 });
        let session = session_for(&radio, 1000).await;

        assert_eq!(
            session.get_contacts().await.unwrap_err(),
            ProtocolError::Device { code: 7 }
        );
    }

    #[tokio::test]
    async fn meshcore_has_no_ping() {
        let radio = SimulatedRadio::new(ProtocolKind::MeshCore, "Companion", 4);
        let session = session_for(&radio, 1000).await;

        assert_eq!(session.ping().await.unwrap_err(), ProtocolError::Unsupported("ping"));
        assert_eq!(
            session.debug_topology().await.unwrap_err(),
            ProtocolError::Unsupported("debug_topology")
        );
    }

    #[tokio::test]
    async fn meshtastic_ping_and_topology() {
        let radio = SimulatedRadio::new(ProtocolKind::Meshtastic, "Beacon", 5);
        let session = session_for(&radio, 1000).await;

        assert!(session.ping().await.is_ok());
        let endpoints = session.debug_topology().await.unwrap();
        assert!(endpoints.iter().any(|e| e.contains("6ba1b218")));
    }

    #[tokio::test]
    async fn unsolicited_packets_and_link_loss_are_published() {
        let radio = SimulatedRadio::new(ProtocolKind::Meshtastic, "Relay", 6);
        let session = session_for(&radio, 1000).await;
        let mut events = session.subscribe();

        let packet = MeshPacket {
            from: 99,
            packet_id: Some(1),
            channel: 0,
            hop_count: Some(1),
            payload: vec![1, 2, 3],
        };
        radio.inject_mesh_packet(&packet).unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::MeshPacket(packet));

        radio.drop_link();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LinkLost);
    }

    #[tokio::test]
    async fn first_subscriber_sees_events_from_before_it_subscribed() {
        let radio = SimulatedRadio::new(ProtocolKind::Meshtastic, "Early", 8);
        let session = session_for(&radio, 1000).await;

        radio.drop_link();
        tokio::time::timeout(Duration::from_secs(2), async {
            while session.shared.events.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("link loss was never published");

        let mut events = session.subscribe();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LinkLost);
    }

    #[tokio::test]
    async fn capture_records_both_directions_and_close_clears_it() {
        let radio = SimulatedRadio::new(ProtocolKind::Meshtastic, "Chatty", 7);
        let session = session_for(&radio, 1000).await;
        session.get_self_info().await.unwrap();

        let capture = session.capture();
        if capture.is_enabled() {
            let frames = capture.snapshot();
            assert_eq!(frames.len(), 2);
            assert_eq!(frames[0].direction, FrameDirection::Tx);
            assert_eq!(frames[1].direction, FrameDirection::Rx);
        }

        session.close();
        assert!(capture.is_empty());
        assert_eq!(session.get_self_info().await.unwrap_err(), ProtocolError::Closed);
    }

    #[tokio::test]
    async fn codecs_share_session_behaviour() {
        for codec in [
            Arc::new(MeshtasticCodec) as Arc<dyn FrameCodec>,
            Arc::new(MeshCoreCodec) as Arc<dyn FrameCodec>,
        ] {
            let radio = SimulatedRadio::new(codec.kind(), "Either", 8);
            radio.connect().await.unwrap();
            let session = ProtocolSession::start(codec, radio.clone(), &settings(1000))
                .await
                .unwrap();

            assert_eq!(session.get_channels().await.unwrap().len(), 1);
        }
    }
}
