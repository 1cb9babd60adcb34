//! Signal Sync Engine
//!
//! One task owns the feed. Local drafts, mesh packets, cloud results, push
//! events and timer ticks all arrive as commands on a single queue and are
//! applied in order. Every change publishes a fresh [`FeedSnapshot`].
//!
//! Cloud calls and mesh broadcasts run in spawned tasks; their results come
//! back through the same loop so the feed only ever has one writer. Work that
//! needs the cloud while offline is queued and retried when connectivity
//! returns or the app is foregrounded, never on a timer.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use super::codec;
use super::feed::{FeedLoadState, FeedSnapshot, SignalFeedState, SignalPhase, Upsert};
use super::policy::SignalPolicy;
use super::types::{
    AuthorRef, LocalMedia, MediaRef, MediaState, NewSignal, Signal, SignalKind, SignalOrigin,
};
use crate::bluetooth::MeshLink;
use crate::clock::Clock;
use crate::cloud::{CloudContent, PushEvent, NEW_SIGNAL_EVENT};
use crate::config::{JobSettings, SignalSettings};
use crate::error::{CloudError, SignalError, StoreError};
use crate::protocol::MeshPacket;
use crate::storage::{KeyValueStore, PacketDedupeStore};

const COMMAND_QUEUE: usize = 256;
const SIGNAL_KEY_PREFIX: &str = "signal:";
const ORDER_KEY: &str = "feed:order";

/// Result of handing a mesh packet to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshIngest {
    Accepted,
    Duplicate,
    Malformed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    Expired,
    WrongCategory,
    NotReturned,
}

/// A locally held signal that the cloud did not return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    pub id: String,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Refreshed {
        inserted: usize,
        updated: usize,
        excluded: Vec<Exclusion>,
    },
    /// Offline or no cloud; retried when connectivity returns
    Deferred,
    Failed(CloudError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fading: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub fading: Vec<String>,
    pub removed: Vec<String>,
    pub pruned: usize,
}

/// Collaborators handed to the engine at construction.
pub struct EngineDeps {
    /// `None` runs the engine without a radio
    pub mesh: Option<Arc<dyn MeshLink>>,
    pub dedupe: Arc<PacketDedupeStore>,
    /// Write-through cache of the feed; `None` keeps it in memory only
    pub cache: Option<Arc<dyn KeyValueStore>>,
    /// `None` runs the engine in mesh-only mode
    pub cloud: Option<Arc<dyn CloudContent>>,
    pub clock: Arc<dyn Clock>,
    pub connectivity: watch::Receiver<bool>,
    pub push_events: Option<mpsc::Receiver<PushEvent>>,
    pub cloud_user: Option<String>,
}

enum Command {
    Create {
        draft: NewSignal,
        reply: oneshot::Sender<Result<Signal, SignalError>>,
    },
    MeshPacket {
        packet: MeshPacket,
        reply: Option<oneshot::Sender<MeshIngest>>,
    },
    Refresh {
        reply: Option<oneshot::Sender<RefreshOutcome>>,
    },
    RefreshCompleted {
        result: Result<Vec<Signal>, CloudError>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<Result<(), SignalError>>,
    },
    DeleteCompleted {
        id: String,
        result: Result<(), CloudError>,
    },
    UploadMedia {
        id: String,
        media: LocalMedia,
        reply: oneshot::Sender<Result<Signal, SignalError>>,
    },
    MediaUploaded {
        id: String,
        media: LocalMedia,
        result: Result<String, CloudError>,
        reply: oneshot::Sender<Result<Signal, SignalError>>,
    },
    UploadCompleted {
        id: String,
        /// Media URL when the upload carried media
        result: Result<Option<String>, CloudError>,
    },
    BindingResolved {
        id: String,
        result: Result<Option<Signal>, CloudError>,
    },
    RemoteDelete(String),
    Push(PushEvent),
    ConnectivityChanged(bool),
    Foregrounded {
        reply: oneshot::Sender<()>,
    },
    CountdownTick {
        reply: Option<oneshot::Sender<TickReport>>,
    },
    Cleanup {
        reply: Option<oneshot::Sender<CleanupReport>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Wake {
    Command(Option<Command>),
    Completed(Result<Option<Command>, JoinError>),
}

pub struct SignalSyncEngine {
    settings: SignalSettings,
    job_settings: JobSettings,
    policy: SignalPolicy,
    mesh: Option<Arc<dyn MeshLink>>,
    dedupe: Arc<PacketDedupeStore>,
    cache: Option<Arc<dyn KeyValueStore>>,
    cloud: Option<Arc<dyn CloudContent>>,
    clock: Arc<dyn Clock>,
    cloud_user: Option<String>,
    connectivity: Option<watch::Receiver<bool>>,
    push_events: Option<mpsc::Receiver<PushEvent>>,
    online: bool,

    state: SignalFeedState,
    load_state: FeedLoadState,
    version: u64,
    feed: watch::Sender<Arc<FeedSnapshot>>,
    persisted_order: Vec<String>,

    /// Media still on the device, by signal id
    local_media: HashMap<String, LocalMedia>,
    /// Deleted ids and when they would have expired
    tombstones: HashMap<String, DateTime<Utc>>,
    pending_uploads: HashSet<String>,
    pending_deletes: HashSet<String>,
    pending_bindings: HashSet<String>,
    deferred_refresh: bool,
    refresh_in_flight: bool,
    refresh_waiters: Vec<oneshot::Sender<RefreshOutcome>>,

    inflight: JoinSet<Option<Command>>,
    jobs: JoinSet<()>,
    commands: mpsc::WeakSender<Command>,
}

impl SignalSyncEngine {
    /// Start the engine task. Must be called from within a tokio runtime.
    pub fn spawn(
        settings: SignalSettings,
        job_settings: JobSettings,
        deps: EngineDeps,
    ) -> SignalSyncHandle {
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE);
        let (feed, feed_rx) = watch::channel(Arc::new(FeedSnapshot::empty(deps.clock.now())));
        let online = *deps.connectivity.borrow();

        let engine = SignalSyncEngine {
            policy: SignalPolicy::new(settings.clone()),
            settings,
            job_settings,
            mesh: deps.mesh,
            dedupe: deps.dedupe,
            cache: deps.cache,
            cloud: deps.cloud,
            clock: deps.clock,
            cloud_user: deps.cloud_user,
            connectivity: Some(deps.connectivity),
            push_events: deps.push_events,
            online,
            state: SignalFeedState::new(),
            load_state: FeedLoadState::Idle,
            version: 0,
            feed,
            persisted_order: Vec::new(),
            local_media: HashMap::new(),
            tombstones: HashMap::new(),
            pending_uploads: HashSet::new(),
            pending_deletes: HashSet::new(),
            pending_bindings: HashSet::new(),
            deferred_refresh: false,
            refresh_in_flight: false,
            refresh_waiters: Vec::new(),
            inflight: JoinSet::new(),
            jobs: JoinSet::new(),
            commands: commands.downgrade(),
        };
        tokio::spawn(engine.run(receiver));

        SignalSyncHandle { commands, feed: feed_rx }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.restore_cache().await;
        self.publish().await;
        self.spawn_jobs();
        info!(
            "Signal sync engine started ({} cached signals, cloud {})",
            self.state.len(),
            if self.cloud.is_some() { "enabled" } else { "disabled" }
        );

        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                Some(done) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    Wake::Completed(done)
                }
            };

            match wake {
                Wake::Command(Some(Command::Shutdown { reply })) => {
                    self.stop();
                    let _ = reply.send(());
                    break;
                }
                Wake::Command(Some(command)) => self.handle(command).await,
                Wake::Command(None) => {
                    self.stop();
                    break;
                }
                Wake::Completed(Ok(Some(command))) => self.handle(command).await,
                Wake::Completed(Ok(None)) => {}
                Wake::Completed(Err(err)) => error!("Signal engine task failed: {}", err),
            }
        }
        info!("Signal sync engine stopped");
    }

    fn stop(&mut self) {
        self.jobs.abort_all();
        self.inflight.abort_all();
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Create { draft, reply } => {
                let result = self.create(draft).await;
                let _ = reply.send(result);
            }
            Command::MeshPacket { packet, reply } => {
                let outcome = self.ingest_mesh(packet).await;
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Command::Refresh { reply } => self.start_refresh(reply).await,
            Command::RefreshCompleted { result } => self.finish_refresh(result).await,
            Command::Delete { id, reply } => {
                let result = self.delete(&id).await;
                let _ = reply.send(result);
            }
            Command::DeleteCompleted { id, result } => match result {
                Ok(()) => debug!("Cloud copy of signal {} deleted", id),
                Err(err) => {
                    warn!("Remote delete of signal {} failed, will retry: {}", id, err);
                    self.pending_deletes.insert(id);
                }
            },
            Command::UploadMedia { id, media, reply } => self.upload_media(id, media, reply),
            Command::MediaUploaded {
                id,
                media,
                result,
                reply,
            } => {
                let result = self.media_uploaded(id, media, result).await;
                let _ = reply.send(result);
            }
            Command::UploadCompleted { id, result } => self.upload_completed(id, result).await,
            Command::BindingResolved { id, result } => self.binding_resolved(id, result).await,
            Command::RemoteDelete(id) => self.remote_delete(id).await,
            Command::Push(event) => self.push(event).await,
            Command::ConnectivityChanged(online) => self.connectivity_changed(online).await,
            Command::Foregrounded { reply } => {
                debug!("App foregrounded");
                self.retry_deferred().await;
                let _ = reply.send(());
            }
            Command::CountdownTick { reply } => {
                let report = self.countdown_tick().await;
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            Command::Cleanup { reply } => {
                let report = self.cleanup().await;
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // Local creation

    async fn create(&mut self, draft: NewSignal) -> Result<Signal, SignalError> {
        let content = self.policy.check_content(&draft.content)?;
        let ttl = self.policy.ttl(draft.ttl_secs)?;
        let now = self.clock.now();

        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            author: AuthorRef {
                mesh_node: self.own_node(),
                cloud_user: self.cloud_user.clone(),
            },
            content,
            created_at: now,
            expires_at: now + ttl,
            location: draft
                .location
                .map(|(latitude, longitude)| self.policy.coarsen(latitude, longitude)),
            media: draft.media.as_ref().map(|media| MediaRef {
                state: MediaState::PendingCloud,
                local_path: Some(media.path.clone()),
                url: None,
            }),
            hop_count: Some(0),
            presence: draft.presence,
            kind: draft.kind,
            origin: SignalOrigin::Local,
            cloud_synced: false,
        };

        if let Err(err) = self.dedupe.record(&content_key(&signal.id)).await {
            warn!("Could not record signal {} in dedupe store: {}", signal.id, err);
        }
        if let Some(media) = draft.media {
            self.local_media.insert(signal.id.clone(), media);
        }
        self.state.insert_new(signal.clone(), now);
        self.persist_signal(&signal).await;
        self.publish().await;
        info!("Created signal {} expiring at {}", signal.id, signal.expires_at);

        if draft.broadcast_mesh {
            self.broadcast(&signal);
        }
        if draft.use_cloud {
            if signal.kind == SignalKind::Text {
                self.upload_or_defer(signal.clone());
            } else {
                debug!("Signal {} is not a text signal, keeping it off the cloud", signal.id);
            }
        }
        Ok(signal)
    }

    fn broadcast(&mut self, signal: &Signal) {
        let Some(mesh) = self.mesh.clone() else {
            return;
        };
        if !mesh.is_connected() {
            debug!("No radio connected, signal {} stays local", signal.id);
            return;
        }
        let payload = match codec::encode(signal) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Failed to encode signal {} for the mesh: {}", signal.id, err);
                return;
            }
        };

        let id = signal.id.clone();
        self.inflight.spawn(async move {
            match mesh.broadcast(payload).await {
                Ok(()) => debug!("Broadcast signal {} over the mesh", id),
                Err(err) => warn!("Mesh broadcast of signal {} failed: {}", id, err),
            }
            None
        });
    }

    fn upload_or_defer(&mut self, signal: Signal) {
        if self.cloud.is_none() {
            return;
        }
        let Some(cloud) = self.cloud_ready() else {
            debug!("Offline, deferring upload of signal {}", signal.id);
            self.pending_uploads.insert(signal.id);
            return;
        };

        self.pending_uploads.remove(&signal.id);
        let media = if signal.has_pending_media() {
            self.local_media.get(&signal.id).cloned()
        } else {
            None
        };
        let limit = self.settings.cloud_timeout();
        self.inflight.spawn(async move {
            let id = signal.id.clone();
            let result = upload(cloud.as_ref(), limit, signal, media).await;
            Some(Command::UploadCompleted { id, result })
        });
    }

    async fn upload_completed(&mut self, id: String, result: Result<Option<String>, CloudError>) {
        match result {
            Ok(url) => {
                if self.tombstones.contains_key(&id) {
                    debug!("Signal {} was deleted during its upload", id);
                    self.remote_delete_or_defer(id);
                    return;
                }
                let Some(signal) = self.state.get_mut(&id) else {
                    return;
                };
                signal.cloud_synced = true;
                if let Some(url) = url {
                    let local_path = signal.media.take().and_then(|media| media.local_path);
                    signal.media = Some(MediaRef {
                        state: MediaState::CloudResolved,
                        local_path,
                        url: Some(url),
                    });
                    self.local_media.remove(&id);
                }
                let signal = signal.clone();
                info!("Signal {} synced to the cloud", id);
                self.persist_signal(&signal).await;
                self.publish().await;
            }
            Err(err) => {
                warn!("Upload of signal {} failed, will retry: {}", id, err);
                if self.state.contains(&id) {
                    self.pending_uploads.insert(id);
                }
            }
        }
    }

    // Mesh ingest

    async fn ingest_mesh(&mut self, packet: MeshPacket) -> MeshIngest {
        let now = self.clock.now();
        let mut signal = match codec::decode(&packet.payload, packet.from, packet.hop_count) {
            Ok(signal) => signal,
            Err(err) => {
                debug!("Dropping mesh packet from !{:08x}: {}", packet.from, err);
                return MeshIngest::Malformed;
            }
        };
        match self.admissible(&signal) {
            Ok(content) => signal.content = content,
            Err(err) => {
                warn!("Rejecting mesh signal {} from !{:08x}: {}", signal.id, packet.from, err);
                return MeshIngest::Malformed;
            }
        }

        if self.state.contains(&signal.id) || self.tombstones.contains_key(&signal.id) {
            return MeshIngest::Duplicate;
        }
        let packet_key = PacketDedupeStore::packet_identifier(&packet);
        let content_key = content_key(&signal.id);
        if self.dedupe.seen(&packet_key).await || self.dedupe.seen(&content_key).await {
            debug!("Mesh signal {} already processed", signal.id);
            return MeshIngest::Duplicate;
        }
        for key in [&packet_key, &content_key] {
            if let Err(err) = self.dedupe.record(key).await {
                warn!("Could not record {} in dedupe store: {}", key, err);
            }
        }

        if signal.is_expired_at(now) {
            debug!("Mesh signal {} arrived after expiring", signal.id);
            return MeshIngest::Expired;
        }

        let id = signal.id.clone();
        let pending_media = signal.has_pending_media();
        info!(
            "Accepted mesh signal {} from !{:08x} (hops {:?})",
            id, packet.from, signal.hop_count
        );
        self.state.insert_new(signal.clone(), now);
        self.persist_signal(&signal).await;
        self.publish().await;

        if pending_media {
            self.lookup_binding(id);
        }
        MeshIngest::Accepted
    }

    /// Signals from other nodes obey the same content and TTL rules as
    /// local ones. Returns the trimmed content.
    fn admissible(&self, signal: &Signal) -> Result<String, SignalError> {
        let content = self.policy.check_content(&signal.content)?;
        let ttl = signal.expires_at - signal.created_at;
        self.policy.ttl(Some(ttl.num_seconds()))?;
        Ok(content)
    }

    fn lookup_binding(&mut self, id: String) {
        if self.cloud.is_none() {
            return;
        }
        let Some(cloud) = self.cloud_ready() else {
            self.pending_bindings.insert(id);
            return;
        };

        self.pending_bindings.remove(&id);
        let limit = self.settings.cloud_timeout();
        self.inflight.spawn(async move {
            let result = with_timeout(limit, cloud.fetch_signal(&id)).await;
            Some(Command::BindingResolved { id, result })
        });
    }

    async fn binding_resolved(&mut self, id: String, result: Result<Option<Signal>, CloudError>) {
        match result {
            Ok(Some(remote)) => {
                if !self.state.contains(&id) || remote.kind != SignalKind::Text {
                    return;
                }
                let now = self.clock.now();
                if self.state.upsert(remote, now) != Upsert::Updated {
                    return;
                }
                if let Some(signal) = self.state.get(&id).cloned() {
                    info!("Bound signal {} to its cloud copy", id);
                    self.persist_signal(&signal).await;
                    self.publish().await;
                }
            }
            Ok(None) => {
                debug!("Cloud has no copy of signal {} yet", id);
                self.pending_bindings.insert(id);
            }
            Err(err) => {
                warn!("Cloud lookup for signal {} failed, will retry: {}", id, err);
                self.pending_bindings.insert(id);
            }
        }
    }

    // Cloud refresh

    async fn start_refresh(&mut self, reply: Option<oneshot::Sender<RefreshOutcome>>) {
        let Some(cloud) = self.cloud.clone() else {
            if let Some(reply) = reply {
                let _ = reply.send(RefreshOutcome::Deferred);
            }
            return;
        };
        if !self.online {
            debug!("Offline, deferring cloud refresh");
            self.deferred_refresh = true;
            if let Some(reply) = reply {
                let _ = reply.send(RefreshOutcome::Deferred);
            }
            return;
        }

        if let Some(reply) = reply {
            self.refresh_waiters.push(reply);
        }
        if self.refresh_in_flight {
            return;
        }
        self.refresh_in_flight = true;
        self.deferred_refresh = false;
        self.load_state = FeedLoadState::Loading;
        self.publish().await;

        let limit = self.settings.cloud_timeout();
        self.inflight.spawn(async move {
            let result = if cloud.is_available().await {
                with_timeout(limit, cloud.fetch_active_signals()).await
            } else {
                Err(CloudError::Unavailable)
            };
            Some(Command::RefreshCompleted { result })
        });
    }

    async fn finish_refresh(&mut self, result: Result<Vec<Signal>, CloudError>) {
        self.refresh_in_flight = false;
        let outcome = match result {
            Ok(fetched) => self.apply_refresh(fetched).await,
            Err(CloudError::Unavailable) => {
                info!("Cloud unavailable, refresh deferred");
                self.deferred_refresh = true;
                self.load_state = FeedLoadState::Idle;
                RefreshOutcome::Deferred
            }
            Err(err) => {
                warn!("Cloud refresh failed: {}", err);
                self.deferred_refresh = true;
                self.load_state = FeedLoadState::Failed(err.to_string());
                RefreshOutcome::Failed(err)
            }
        };
        self.publish().await;

        for waiter in self.refresh_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn apply_refresh(&mut self, fetched: Vec<Signal>) -> RefreshOutcome {
        let now = self.clock.now();
        let mut returned = HashSet::new();
        let mut changed = Vec::new();
        let mut fresh = Vec::new();
        let (mut inserted, mut updated) = (0, 0);

        for mut signal in fetched {
            if signal.kind != SignalKind::Text
                || signal.is_expired_at(now)
                || self.tombstones.contains_key(&signal.id)
            {
                continue;
            }
            returned.insert(signal.id.clone());
            let id = signal.id.clone();
            if !self.state.contains(&id) {
                signal.origin = SignalOrigin::Cloud;
                signal.cloud_synced = true;
            }
            match self.state.upsert(signal, now) {
                Upsert::Inserted => {
                    inserted += 1;
                    fresh.push(id.clone());
                    changed.push(id);
                }
                Upsert::Updated => {
                    updated += 1;
                    changed.push(id);
                }
                Upsert::Skipped => {}
            }
        }

        let absent: Vec<(String, ExclusionReason, SignalOrigin)> = self
            .state
            .signals()
            .filter(|s| {
                !returned.contains(&s.id) && self.state.phase(&s.id) == Some(SignalPhase::Active)
            })
            .map(|s| {
                let reason = if s.is_expired_at(now) {
                    ExclusionReason::Expired
                } else if s.kind != SignalKind::Text {
                    ExclusionReason::WrongCategory
                } else {
                    ExclusionReason::NotReturned
                };
                (s.id.clone(), reason, s.origin)
            })
            .collect();

        let mut excluded = Vec::with_capacity(absent.len());
        for (id, reason, origin) in absent {
            info!("Signal {} excluded from cloud refresh: {:?}", id, reason);
            if origin == SignalOrigin::Cloud && self.state.begin_fading(&id, now) {
                debug!("Cloud signal {} no longer active, fading out", id);
            }
            excluded.push(Exclusion { id, reason });
        }
        excluded.sort_by(|a, b| a.id.cmp(&b.id));

        for id in &fresh {
            if let Err(err) = self.dedupe.record(&content_key(id)).await {
                warn!("Could not record signal {} in dedupe store: {}", id, err);
            }
        }
        for id in &changed {
            if let Some(signal) = self.state.get(id).cloned() {
                self.persist_signal(&signal).await;
            }
        }

        self.load_state = FeedLoadState::Idle;
        info!(
            "Cloud refresh: {} inserted, {} updated, {} excluded",
            inserted,
            updated,
            excluded.len()
        );
        RefreshOutcome::Refreshed {
            inserted,
            updated,
            excluded,
        }
    }

    // Deletion and media

    async fn delete(&mut self, id: &str) -> Result<(), SignalError> {
        let Some(signal) = self.state.remove(id) else {
            return Err(SignalError::NotFound(id.to_string()));
        };
        self.forget(id, signal.expires_at).await;
        if let Err(err) = self.dedupe.record(&content_key(id)).await {
            warn!("Could not record deleted signal {} in dedupe store: {}", id, err);
        }
        self.publish().await;
        info!("Deleted signal {}", id);

        if self.cloud.is_some() {
            self.remote_delete_or_defer(id.to_string());
        }
        Ok(())
    }

    fn remote_delete_or_defer(&mut self, id: String) {
        let Some(cloud) = self.cloud_ready() else {
            self.pending_deletes.insert(id);
            return;
        };

        self.pending_deletes.remove(&id);
        let limit = self.settings.cloud_timeout();
        self.inflight.spawn(async move {
            let result = with_timeout(limit, cloud.delete_signal(&id)).await;
            Some(Command::DeleteCompleted { id, result })
        });
    }

    async fn remote_delete(&mut self, id: String) {
        self.pending_deletes.remove(&id);
        match self.state.remove(&id) {
            Some(signal) => {
                self.forget(&id, signal.expires_at).await;
                self.publish().await;
                info!("Signal {} deleted remotely", id);
            }
            None => {
                let retention = chrono::Duration::seconds(self.settings.ttl_max_secs);
                let horizon = self.clock.now() + retention;
                self.tombstones.insert(id, horizon);
            }
        }
    }

    fn upload_media(
        &mut self,
        id: String,
        media: LocalMedia,
        reply: oneshot::Sender<Result<Signal, SignalError>>,
    ) {
        let Some(signal) = self.state.get(&id) else {
            let _ = reply.send(Err(SignalError::NotFound(id)));
            return;
        };
        if !signal.has_pending_media() {
            let _ = reply.send(Err(SignalError::MediaNotPending(id)));
            return;
        }
        let Some(cloud) = self.cloud_ready() else {
            let _ = reply.send(Err(SignalError::Cloud(CloudError::Unavailable)));
            return;
        };

        let limit = self.settings.cloud_timeout();
        self.inflight.spawn(async move {
            let result = with_timeout(limit, cloud.upload_media(&id, &media)).await;
            Some(Command::MediaUploaded {
                id,
                media,
                result,
                reply,
            })
        });
    }

    async fn media_uploaded(
        &mut self,
        id: String,
        media: LocalMedia,
        result: Result<String, CloudError>,
    ) -> Result<Signal, SignalError> {
        let url = match result {
            Ok(url) => url,
            Err(err) => {
                warn!("Media upload for signal {} failed: {}", id, err);
                return Err(err.into());
            }
        };
        let Some(signal) = self.state.get_mut(&id) else {
            return Err(SignalError::NotFound(id));
        };
        signal.media = Some(MediaRef {
            state: MediaState::CloudResolved,
            local_path: Some(media.path),
            url: Some(url),
        });
        let signal = signal.clone();
        self.local_media.remove(&id);
        info!("Media for signal {} uploaded", id);
        self.persist_signal(&signal).await;
        self.publish().await;

        // Point the cloud copy at the uploaded media
        if signal.cloud_synced {
            self.upload_or_defer(signal.clone());
        }
        Ok(signal)
    }

    // Push and connectivity

    async fn push(&mut self, event: PushEvent) {
        if event.content_type != NEW_SIGNAL_EVENT {
            debug!("Ignoring push event of type {}", event.content_type);
            return;
        }
        let id = event.target_id;
        let bound = self.state.get(&id).map(|signal| signal.cloud_synced);
        match bound {
            Some(true) => debug!("Signal {} already bound to the cloud", id),
            Some(false) => self.lookup_binding(id),
            None if self.tombstones.contains_key(&id) => {}
            None => self.start_refresh(None).await,
        }
    }

    async fn connectivity_changed(&mut self, online: bool) {
        let was_online = std::mem::replace(&mut self.online, online);
        if online && !was_online {
            info!("Connectivity restored, retrying deferred cloud work");
            self.retry_deferred().await;
        } else if !online && was_online {
            info!("Connectivity lost, deferring cloud work");
        }
    }

    async fn retry_deferred(&mut self) {
        if self.cloud_ready().is_none() {
            return;
        }

        let uploads: Vec<String> = self.pending_uploads.drain().collect();
        for id in uploads {
            if let Some(signal) = self.state.get(&id).cloned() {
                self.upload_or_defer(signal);
            }
        }
        let deletes: Vec<String> = self.pending_deletes.drain().collect();
        for id in deletes {
            self.remote_delete_or_defer(id);
        }
        let bindings: Vec<String> = self.pending_bindings.drain().collect();
        for id in bindings {
            if self.state.contains(&id) {
                self.lookup_binding(id);
            }
        }
        if self.deferred_refresh {
            self.start_refresh(None).await;
        }
    }

    // Timers

    async fn countdown_tick(&mut self) -> TickReport {
        let now = self.clock.now();
        let fading = self.state.begin_fading_expired(now);
        let removed = self.state.remove_faded(now, self.settings.fade_duration());
        let settled = self.state.settle_entrances(now, self.settings.entrance_duration());

        for id in &fading {
            debug!("Signal {} expired, fading out", id);
        }
        for id in &removed {
            debug!("Signal {} removed after fading", id);
            self.discard_pending(id);
            self.unpersist(id).await;
        }
        if !fading.is_empty() || !removed.is_empty() || settled > 0 {
            self.publish().await;
        }
        TickReport { fading, removed }
    }

    async fn cleanup(&mut self) -> CleanupReport {
        let TickReport { fading, removed } = self.countdown_tick().await;

        let now = self.clock.now();
        self.tombstones.retain(|_, expires_at| *expires_at > now);
        self.pending_uploads.retain(|id| self.state.contains(id));
        self.pending_bindings.retain(|id| self.state.contains(id));

        let pruned = match self.dedupe.prune().await {
            Ok(pruned) => pruned,
            Err(err) => {
                error!("Dedupe prune failed: {}", err);
                0
            }
        };
        if !removed.is_empty() || pruned > 0 {
            info!("Cleanup removed {} signals and {} dedupe records", removed.len(), pruned);
        }
        CleanupReport {
            fading,
            removed,
            pruned,
        }
    }

    fn spawn_jobs(&mut self) {
        let jobs = self.job_settings.clone();
        self.spawn_ticker("countdown", Duration::from_millis(jobs.countdown_interval_ms), || {
            Command::CountdownTick { reply: None }
        });
        self.spawn_ticker("cleanup", Duration::from_secs(jobs.cleanup_interval_secs), || {
            Command::Cleanup { reply: None }
        });
        if self.cloud.is_some() {
            self.spawn_ticker("refresh", Duration::from_secs(jobs.refresh_interval_secs), || {
                Command::Refresh { reply: None }
            });
        }

        if let Some(mut online) = self.connectivity.take() {
            let commands = self.commands.clone();
            self.jobs.spawn(async move {
                while online.changed().await.is_ok() {
                    let value = *online.borrow_and_update();
                    if !forward(&commands, Command::ConnectivityChanged(value)).await {
                        return;
                    }
                }
            });
        }

        if let Some(mut events) = self.push_events.take() {
            let commands = self.commands.clone();
            self.jobs.spawn(async move {
                while let Some(event) = events.recv().await {
                    if !forward(&commands, Command::Push(event)).await {
                        return;
                    }
                }
            });
        }

        if let Some(cloud) = &self.cloud {
            let mut deletes = cloud.watch_remote_deletes();
            let commands = self.commands.clone();
            self.jobs.spawn(async move {
                while let Some(id) = deletes.next().await {
                    if !forward(&commands, Command::RemoteDelete(id)).await {
                        return;
                    }
                }
            });
        }

        if let Some(mesh) = &self.mesh {
            let mut packets = mesh.subscribe_packets();
            let commands = self.commands.clone();
            self.jobs.spawn(async move {
                loop {
                    match packets.recv().await {
                        Ok(packet) => {
                            if !codec::is_signal_payload(&packet.payload) {
                                continue;
                            }
                            let command = Command::MeshPacket { packet, reply: None };
                            if !forward(&commands, command).await {
                                return;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Signal engine missed {} mesh packets", skipped)
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            });
        }
    }

    fn spawn_ticker(&mut self, name: &'static str, period: Duration, make: fn() -> Command) {
        let commands = self.commands.clone();
        self.jobs.spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !forward(&commands, make()).await {
                    debug!("{} job stopped", name);
                    return;
                }
            }
        });
    }

    // Snapshot and cache

    async fn publish(&mut self) {
        self.version += 1;
        let snapshot = FeedSnapshot::build(
            &self.state,
            self.own_node(),
            self.load_state.clone(),
            self.version,
            self.clock.now(),
        );
        let order: Vec<String> = snapshot.entries.iter().map(|e| e.signal.id.clone()).collect();
        self.feed.send_replace(Arc::new(snapshot));

        if order != self.persisted_order {
            self.persist_order(&order).await;
            self.persisted_order = order;
        }
    }

    async fn restore_cache(&mut self) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let entries = match cache.scan_prefix(SIGNAL_KEY_PREFIX).await {
            Ok(entries) => entries,
            Err(err) => {
                self.degrade_cache(err);
                return;
            }
        };

        let now = self.clock.now();
        let mut stale = Vec::new();
        for (key, bytes) in entries {
            match serde_json::from_slice::<Signal>(&bytes) {
                Ok(signal) if !signal.is_expired_at(now) => {
                    self.state.restore(signal);
                }
                Ok(_) => stale.push(key),
                Err(err) => {
                    warn!("Discarding unreadable cached signal {}: {}", key, err);
                    stale.push(key);
                }
            }
        }
        for key in stale {
            if let Err(err) = cache.remove(&key).await {
                self.degrade_cache(err);
                return;
            }
        }
    }

    async fn persist_signal(&mut self, signal: &Signal) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let result = match serde_json::to_vec(signal) {
            Ok(bytes) => cache.put(&signal_key(&signal.id), bytes).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            self.degrade_cache(err);
        }
    }

    async fn persist_order(&mut self, order: &[String]) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let result = match serde_json::to_vec(order) {
            Ok(bytes) => cache.put(ORDER_KEY, bytes).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            self.degrade_cache(err);
        }
    }

    async fn unpersist(&mut self, id: &str) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        if let Err(err) = cache.remove(&signal_key(id)).await {
            self.degrade_cache(err);
        }
    }

    fn degrade_cache(&mut self, err: StoreError) {
        warn!("Signal cache failed, continuing in memory only: {}", err);
        self.cache = None;
    }

    /// Explicit removal: tombstone the id and drop everything queued for it.
    async fn forget(&mut self, id: &str, expires_at: DateTime<Utc>) {
        self.tombstones.insert(id.to_string(), expires_at);
        self.discard_pending(id);
        self.unpersist(id).await;
    }

    fn discard_pending(&mut self, id: &str) {
        self.local_media.remove(id);
        self.pending_uploads.remove(id);
        self.pending_bindings.remove(id);
    }

    fn own_node(&self) -> Option<u32> {
        self.mesh.as_ref().and_then(|mesh| mesh.local_node())
    }

    fn cloud_ready(&self) -> Option<Arc<dyn CloudContent>> {
        if self.online {
            self.cloud.clone()
        } else {
            None
        }
    }
}

fn content_key(id: &str) -> String {
    format!("content:{id}")
}

fn signal_key(id: &str) -> String {
    format!("{SIGNAL_KEY_PREFIX}{id}")
}

async fn forward(commands: &mpsc::WeakSender<Command>, command: Command) -> bool {
    match commands.upgrade() {
        Some(sender) => sender.send(command).await.is_ok(),
        None => false,
    }
}

async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, CloudError>>,
) -> Result<T, CloudError> {
    match time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CloudError::Timeout),
    }
}

async fn upload(
    cloud: &dyn CloudContent,
    limit: Duration,
    mut signal: Signal,
    media: Option<LocalMedia>,
) -> Result<Option<String>, CloudError> {
    let mut media_url = None;
    if let Some(media) = media {
        let url = with_timeout(limit, cloud.upload_media(&signal.id, &media)).await?;
        signal.media = Some(MediaRef {
            state: MediaState::CloudResolved,
            local_path: None,
            url: Some(url.clone()),
        });
        media_url = Some(url);
    }
    with_timeout(limit, cloud.upload_signal(&signal)).await?;
    Ok(media_url)
}

/// Cloneable front end to a running [`SignalSyncEngine`].
#[derive(Clone)]
pub struct SignalSyncHandle {
    commands: mpsc::Sender<Command>,
    feed: watch::Receiver<Arc<FeedSnapshot>>,
}

impl SignalSyncHandle {
    pub fn subscribe(&self) -> watch::Receiver<Arc<FeedSnapshot>> {
        self.feed.clone()
    }

    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        Arc::clone(&self.feed.borrow())
    }

    pub async fn create_signal(&self, draft: NewSignal) -> Result<Signal, SignalError> {
        self.call(|reply| Command::Create { draft, reply }).await?
    }

    pub async fn add_mesh_signal(&self, packet: MeshPacket) -> Result<MeshIngest, SignalError> {
        self.call(|reply| Command::MeshPacket {
            packet,
            reply: Some(reply),
        })
        .await
    }

    pub async fn refresh(&self) -> Result<RefreshOutcome, SignalError> {
        self.call(|reply| Command::Refresh { reply: Some(reply) }).await
    }

    /// Remove locally and ask the cloud to delete its copy. A failed remote
    /// delete is retried later and does not fail this call.
    pub async fn delete_signal(&self, id: &str) -> Result<(), SignalError> {
        let id = id.to_string();
        self.call(|reply| Command::Delete { id, reply }).await?
    }

    pub async fn upload_media(&self, id: &str, media: LocalMedia) -> Result<Signal, SignalError> {
        let id = id.to_string();
        self.call(|reply| Command::UploadMedia { id, media, reply }).await?
    }

    pub async fn run_countdown_tick(&self) -> Result<TickReport, SignalError> {
        self.call(|reply| Command::CountdownTick { reply: Some(reply) }).await
    }

    pub async fn run_cleanup(&self) -> Result<CleanupReport, SignalError> {
        self.call(|reply| Command::Cleanup { reply: Some(reply) }).await
    }

    pub async fn app_foregrounded(&self) -> Result<(), SignalError> {
        self.call(|reply| Command::Foregrounded { reply }).await
    }

    /// Stop the engine and every background job. Later calls fail with
    /// [`SignalError::EngineStopped`].
    pub async fn shutdown(&self) {
        if self.call(|reply| Command::Shutdown { reply }).await.is_err() {
            debug!("Signal engine already stopped");
        }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SignalError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SignalError::EngineStopped)?;
        response.await.map_err(|_| SignalError::EngineStopped)
    }
}
