//! Packet Dedupe Ledger
//!
//! Durable record of every mesh packet or content identifier already
//! processed. Records live for the retention window; expired records read
//! as unseen and are removed lazily with compare-and-delete, so a record
//! written concurrently with the sweep is never lost.
//!
//! Lookups fail open: if the backing store is down, `seen` answers `false`
//! and logs a warning rather than stalling the mesh feed.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::KeyValueStore;
use crate::clock::Clock;
use crate::error::StoreError;
use crate::protocol::MeshPacket;

const KEY_PREFIX: &str = "dedupe:";

/// Full sweep after this many inserts.
const PRUNE_EVERY: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeRecord {
    pub identifier: String,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    AlreadySeen,
}

pub struct PacketDedupeStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    inserts: AtomicU64,
}

impl PacketDedupeStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention,
            inserts: AtomicU64::new(0),
        }
    }

    /// Identifier for a mesh packet: sender plus packet id when the radio
    /// reports one, otherwise a digest of sender and payload.
    pub fn packet_identifier(packet: &MeshPacket) -> String {
        match packet.packet_id {
            Some(id) => format!("pkt:{:08x}:{:08x}", packet.from, id),
            None => {
                let mut hasher = Sha256::new();
                hasher.update(packet.from.to_be_bytes());
                hasher.update(&packet.payload);
                format!("sha256:{}", hex::encode(hasher.finalize()))
            }
        }
    }

    pub async fn seen(&self, identifier: &str) -> bool {
        match self.lookup(identifier).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!("Dedupe lookup for {} failed, treating as unseen: {}", identifier, e);
                false
            }
        }
    }

    async fn lookup(&self, identifier: &str) -> Result<bool, StoreError> {
        let key = key_for(identifier);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(false);
        };

        if self.is_live(&raw) {
            return Ok(true);
        }
        // Expired or unreadable. Only delete the exact bytes we looked at.
        self.store.remove_if(&key, &raw).await?;
        Ok(false)
    }

    /// Durably record `identifier`. A live record already present makes
    /// this a no-op.
    pub async fn record(&self, identifier: &str) -> Result<RecordOutcome, StoreError> {
        let key = key_for(identifier);
        let value = serde_json::to_vec(&DedupeRecord {
            identifier: identifier.to_string(),
            first_seen: self.clock.now(),
        })?;

        if self.store.put_if_absent(&key, value.clone()).await? {
            self.after_insert().await;
            return Ok(RecordOutcome::Inserted);
        }

        if let Some(raw) = self.store.get(&key).await? {
            if self.is_live(&raw) {
                return Ok(RecordOutcome::AlreadySeen);
            }
            self.store.remove_if(&key, &raw).await?;
        }

        if self.store.put_if_absent(&key, value).await? {
            self.after_insert().await;
            Ok(RecordOutcome::Inserted)
        } else {
            Ok(RecordOutcome::AlreadySeen)
        }
    }

    /// Remove every record older than the retention window.
    pub async fn prune(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (key, raw) in self.store.scan_prefix(KEY_PREFIX).await? {
            if !self.is_live(&raw) && self.store.remove_if(&key, &raw).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Pruned {} dedupe records", removed);
        }
        Ok(removed)
    }

    async fn after_insert(&self) {
        let inserts = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts % PRUNE_EVERY == 0 {
            if let Err(e) = self.prune().await {
                warn!("Dedupe prune failed: {}", e);
            }
        }
    }

    fn is_live(&self, raw: &[u8]) -> bool {
        match serde_json::from_slice::<DedupeRecord>(raw) {
            Ok(record) => record.first_seen >= self.clock.now() - self.retention,
            Err(e) => {
                warn!("Unreadable dedupe record: {}", e);
                false
            }
        }
    }
}

fn key_for(identifier: &str) -> String {
    format!("{KEY_PREFIX}{identifier}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{MemoryStore, SqliteStore};

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn ledger(store: Arc<dyn KeyValueStore>, clock: &ManualClock) -> PacketDedupeStore {
        PacketDedupeStore::new(store, Arc::new(clock.clone()), Duration::hours(24))
    }

    #[tokio::test]
    async fn second_record_is_already_seen() {
        let clock = ManualClock::new(start());
        let dedupe = ledger(Arc::new(MemoryStore::new()), &clock);

        assert!(!dedupe.seen("abc").await);
        assert_eq!(dedupe.record("abc").await.unwrap(), RecordOutcome::Inserted);
        assert!(dedupe.seen("abc").await);
        assert_eq!(dedupe.record("abc").await.unwrap(), RecordOutcome::AlreadySeen);
    }

    #[tokio::test]
    async fn records_survive_process_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedupe.db");
        let clock = ManualClock::new(start());

        {
            let dedupe = ledger(Arc::new(SqliteStore::open(&path).unwrap()), &clock);
            dedupe.record("pkt:00000001:00000002").await.unwrap();
        }

        let dedupe = ledger(Arc::new(SqliteStore::open(&path).unwrap()), &clock);
        assert!(dedupe.seen("pkt:00000001:00000002").await);
    }

    #[tokio::test]
    async fn records_expire_after_retention() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryStore::new());
        let dedupe = ledger(store.clone(), &clock);
        dedupe.record("old").await.unwrap();

        clock.advance(Duration::hours(24));
        assert!(dedupe.seen("old").await, "a record exactly at the window edge is still live");

        clock.advance(Duration::seconds(1));
        assert!(!dedupe.seen("old").await);
        assert!(store.is_empty());
        assert_eq!(dedupe.record("old").await.unwrap(), RecordOutcome::Inserted);
    }

    #[tokio::test]
    async fn prune_keeps_young_records() {
        let clock = ManualClock::new(start());
        let dedupe = ledger(Arc::new(MemoryStore::new()), &clock);
        dedupe.record("old").await.unwrap();

        clock.advance(Duration::hours(23));
        dedupe.record("young").await.unwrap();
        clock.advance(Duration::hours(2));

        assert_eq!(dedupe.prune().await.unwrap(), 1);
        assert!(dedupe.seen("young").await);
        assert!(!dedupe.seen("old").await);
    }

    #[tokio::test]
    async fn expired_sweep_does_not_evict_fresh_rewrite() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryStore::new());
        let dedupe = ledger(store.clone(), &clock);
        dedupe.record("id").await.unwrap();
        let stale = store.get("dedupe:id").await.unwrap().unwrap();

        clock.advance(Duration::hours(25));
        // Another writer replaced the stale record before our delete ran
        dedupe.record("id").await.unwrap();
        assert!(!store.remove_if("dedupe:id", &stale).await.unwrap());
        assert!(dedupe.seen("id").await);
    }

    #[tokio::test]
    async fn outage_fails_open_for_lookups_only() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryStore::new());
        let dedupe = ledger(store.clone(), &clock);
        dedupe.record("abc").await.unwrap();

        store.set_available(false);
        assert!(!dedupe.seen("abc").await);
        assert!(dedupe.record("def").await.is_err());
    }

    #[test]
    fn packet_identifier_prefers_radio_id() {
        let mut packet = MeshPacket {
            from: 0xAB,
            packet_id: Some(0x10),
            channel: 0,
            hop_count: None,
            payload: vec![1, 2, 3],
        };
        assert_eq!(PacketDedupeStore::packet_identifier(&packet), "pkt:000000ab:00000010");

        packet.packet_id = None;
        let digest = PacketDedupeStore::packet_identifier(&packet);
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), "sha256:".len() + 64);
    }
}
