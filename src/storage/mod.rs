//! Persistent key-value storage
//!
//! The dedupe ledger and the signal cache both sit on [`KeyValueStore`].
//! [`SqliteStore`] is the durable backend; [`MemoryStore`] is used in
//! simulation and tests and can be switched offline to exercise outages.

pub mod dedupe;
pub mod memory;
pub mod sqlite;

pub use dedupe::{DedupeRecord, PacketDedupeStore, RecordOutcome};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::StoreError;

/// Byte values keyed by string. Writes are visible to subsequent reads
/// from the same process.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Insert only if the key is absent. Returns whether it was inserted.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError>;

    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete only if the stored value still equals `expected`.
    async fn remove_if(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}
