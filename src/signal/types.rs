//! Signal records and drafts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Text,
    /// Short lived "I am here" beacons. Never stored in the cloud.
    Presence,
}

/// Where the engine first learned about a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalOrigin {
    Local,
    Mesh,
    Cloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaState {
    None,
    PendingCloud,
    CloudResolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub state: MediaState,
    pub local_path: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthorRef {
    pub mesh_node: Option<u32>,
    pub cloud_user: Option<String>,
}

/// Location snapped to the centre of a privacy grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoarseLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub author: AuthorRef,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub location: Option<CoarseLocation>,
    pub media: Option<MediaRef>,
    /// Mesh relays between the author and us, `None` when unknown
    pub hop_count: Option<u8>,
    pub presence: Option<serde_json::Value>,
    pub kind: SignalKind,
    pub origin: SignalOrigin,
    pub cloud_synced: bool,
}

impl Signal {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn has_pending_media(&self) -> bool {
        self.media
            .as_ref()
            .is_some_and(|m| m.state == MediaState::PendingCloud)
    }

    /// Fold the cloud's copy of this signal into ours. Fields the cloud
    /// does not know (hop count, mesh author) are kept.
    pub fn merge_from_cloud(&mut self, cloud: Signal) {
        self.content = cloud.content;
        self.expires_at = cloud.expires_at;
        if cloud.location.is_some() {
            self.location = cloud.location;
        }
        if cloud.author.cloud_user.is_some() {
            self.author.cloud_user = cloud.author.cloud_user;
        }
        if self.author.mesh_node.is_none() {
            self.author.mesh_node = cloud.author.mesh_node;
        }
        if let Some(media) = cloud.media {
            if media.state == MediaState::CloudResolved || self.media.is_none() {
                let local_path = self.media.take().and_then(|m| m.local_path);
                self.media = Some(MediaRef {
                    local_path: media.local_path.or(local_path),
                    ..media
                });
            }
        }
        if self.hop_count.is_none() {
            self.hop_count = cloud.hop_count;
        }
        self.cloud_synced = true;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMedia {
    pub path: String,
    pub mime_type: String,
}

/// What a user asks for when creating a signal.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSignal {
    pub content: String,
    /// Falls back to the configured default
    pub ttl_secs: Option<i64>,
    /// Precise (latitude, longitude); coarsened before storage
    pub location: Option<(f64, f64)>,
    pub media: Option<LocalMedia>,
    pub kind: SignalKind,
    pub presence: Option<serde_json::Value>,
    pub broadcast_mesh: bool,
    pub use_cloud: bool,
}

impl NewSignal {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ttl_secs: None,
            location: None,
            media: None,
            kind: SignalKind::Text,
            presence: None,
            broadcast_mesh: true,
            use_cloud: false,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    pub fn with_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.location = Some((latitude, longitude));
        self
    }

    pub fn with_media(mut self, media: LocalMedia) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_cloud(mut self, use_cloud: bool) -> Self {
        self.use_cloud = use_cloud;
        self
    }

    pub fn with_mesh(mut self, broadcast_mesh: bool) -> Self {
        self.broadcast_mesh = broadcast_mesh;
        self
    }
}
