//! Cloud relay and push collaborators
//!
//! The engine only depends on [`CloudContent`]. [`MemoryCloud`] is the
//! in-process implementation used by simulation mode and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::CloudError;
use crate::signal::{LocalMedia, Signal, SignalKind, SignalOrigin};

/// Push content type announcing a new cloud signal.
pub const NEW_SIGNAL_EVENT: &str = "new_signal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub content_type: String,
    pub target_id: String,
}

impl PushEvent {
    pub fn new_signal(target_id: impl Into<String>) -> Self {
        Self {
            content_type: NEW_SIGNAL_EVENT.to_string(),
            target_id: target_id.into(),
        }
    }
}

#[async_trait]
pub trait CloudContent: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Text signals the cloud currently considers active.
    async fn fetch_active_signals(&self) -> Result<Vec<Signal>, CloudError>;

    async fn fetch_signal(&self, id: &str) -> Result<Option<Signal>, CloudError>;

    async fn upload_signal(&self, signal: &Signal) -> Result<(), CloudError>;

    async fn delete_signal(&self, id: &str) -> Result<(), CloudError>;

    /// Upload media for a signal and return its public URL.
    async fn upload_media(&self, id: &str, media: &LocalMedia) -> Result<String, CloudError>;

    /// Ids deleted by other clients.
    fn watch_remote_deletes(&self) -> BoxStream<'static, String>;
}

pub struct MemoryCloud {
    signals: DashMap<String, Signal>,
    available: AtomicBool,
    failure: Mutex<Option<CloudError>>,
    deletes: broadcast::Sender<String>,
    uploads: AtomicUsize,
}

impl MemoryCloud {
    pub fn new() -> Self {
        let (deletes, _) = broadcast::channel(64);
        Self {
            signals: DashMap::new(),
            available: AtomicBool::new(true),
            failure: Mutex::new(None),
            deletes,
            uploads: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every call fail with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<CloudError>) {
        *self.failure.lock() = error;
    }

    /// Seed a signal as if another client had posted it.
    pub fn insert(&self, mut signal: Signal) {
        signal.origin = SignalOrigin::Cloud;
        signal.cloud_synced = true;
        self.signals.insert(signal.id.clone(), signal);
    }

    pub fn get(&self, id: &str) -> Option<Signal> {
        self.signals.get(id).map(|s| s.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.signals.contains_key(id)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Delete as another client would, notifying watchers.
    pub fn remote_delete(&self, id: &str) {
        self.signals.remove(id);
        let _ = self.deletes.send(id.to_string());
    }

    fn check(&self) -> Result<(), CloudError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CloudError::Unavailable);
        }
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudContent for MemoryCloud {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn fetch_active_signals(&self) -> Result<Vec<Signal>, CloudError> {
        self.check()?;
        Ok(self
            .signals
            .iter()
            .filter(|s| s.kind == SignalKind::Text)
            .map(|s| s.value().clone())
            .collect())
    }

    async fn fetch_signal(&self, id: &str) -> Result<Option<Signal>, CloudError> {
        self.check()?;
        Ok(self.get(id))
    }

    async fn upload_signal(&self, signal: &Signal) -> Result<(), CloudError> {
        self.check()?;
        if signal.kind != SignalKind::Text {
            return Err(CloudError::Rejected("only text signals are stored".to_string()));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let mut stored = signal.clone();
        if let Some(media) = stored.media.as_mut() {
            media.local_path = None;
        }
        self.insert(stored);
        debug!("cloud stored signal {}", signal.id);
        Ok(())
    }

    async fn delete_signal(&self, id: &str) -> Result<(), CloudError> {
        self.check()?;
        self.signals.remove(id);
        Ok(())
    }

    async fn upload_media(&self, id: &str, media: &LocalMedia) -> Result<String, CloudError> {
        self.check()?;
        let file_name = media.path.rsplit('/').next().unwrap_or(media.path.as_str());
        Ok(format!("memory://media/{id}/{file_name}"))
    }

    fn watch_remote_deletes(&self) -> BoxStream<'static, String> {
        stream::unfold(self.deletes.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(id) => return Some((id, rx)),
                    Err(RecvError::Lagged(skipped)) => warn!("Missed {} remote deletes", skipped),
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn signal(id: &str, kind: SignalKind) -> Signal {
        let now = Utc::now();
        Signal {
            id: id.to_string(),
            author: Default::default(),
            content: "hello".to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(5),
            location: None,
            media: None,
            hop_count: None,
            presence: None,
            kind,
            origin: SignalOrigin::Local,
            cloud_synced: false,
        }
    }

    #[tokio::test]
    async fn only_text_signals_are_returned() {
        let cloud = MemoryCloud::new();
        cloud.insert(signal("t", SignalKind::Text));
        cloud.insert(signal("p", SignalKind::Presence));

        let ids: Vec<_> = cloud
            .fetch_active_signals()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["t"]);
    }

    #[tokio::test]
    async fn outage_fails_calls() {
        let cloud = MemoryCloud::new();
        cloud.set_available(false);
        assert_eq!(cloud.fetch_active_signals().await.unwrap_err(), CloudError::Unavailable);

        cloud.set_available(true);
        cloud.fail_with(Some(CloudError::Timeout));
        assert_eq!(cloud.delete_signal("x").await.unwrap_err(), CloudError::Timeout);
    }

    #[tokio::test]
    async fn remote_deletes_are_streamed() {
        let cloud = MemoryCloud::new();
        cloud.insert(signal("gone", SignalKind::Text));
        let mut deletes = cloud.watch_remote_deletes();

        cloud.remote_delete("gone");
        assert_eq!(deletes.next().await.as_deref(), Some("gone"));
        assert!(!cloud.contains("gone"));
    }
}
