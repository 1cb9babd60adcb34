//! In-memory store backed by a concurrent map.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::KeyValueStore;
use crate::error::StoreError;

#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check()?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        self.check()?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(true)
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn remove_if(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .entries
            .remove_if(key, |_, value| value.as_slice() == expected)
            .is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.check()?;
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_if_absent_keeps_first_value() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("k", b"one".to_vec()).await.unwrap());
        assert!(!store.put_if_absent("k", b"two".to_vec()).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"one".to_vec()));
    }

    #[tokio::test]
    async fn remove_if_compares_value() {
        let store = MemoryStore::new();
        store.put("k", b"new".to_vec()).await.unwrap();

        assert!(!store.remove_if("k", b"old").await.unwrap());
        assert!(store.remove_if("k", b"new").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        assert!(store.put("k", vec![]).await.is_err());

        store.set_available(true);
        assert!(store.put("k", vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn scan_is_ordered_and_filtered() {
        let store = MemoryStore::new();
        for key in ["b:2", "a:1", "b:1"] {
            store.put(key, vec![]).await.unwrap();
        }

        let keys: Vec<_> = store
            .scan_prefix("b:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["b:1", "b:2"]);
    }
}
