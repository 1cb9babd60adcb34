//! SQLite backed store
//!
//! One `kv` table. Every call runs on the blocking pool so the async
//! callers never wait on disk I/O.

use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use super::KeyValueStore;
use crate::error::StoreError;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        info!("Opened store at {}", path.as_ref().display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .map_err(StoreError::from)
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
                .optional()
        })
        .await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|changed| changed == 1)
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map(|changed| changed > 0)
        })
        .await
    }

    async fn remove_if(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let key = key.to_string();
        let expected = expected.to_vec();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM kv WHERE key = ?1 AND value = ?2",
                params![key, expected],
            )
            .map(|changed| changed > 0)
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let entries = rows.collect::<Result<Vec<(String, Vec<u8>)>, _>>();
            entries
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("dedupe:abc", b"{}".to_vec()).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("dedupe:abc").await.unwrap(), Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn conditional_writes() {
        let store = SqliteStore::open_in_memory().unwrap();

        assert!(store.put_if_absent("k", b"a".to_vec()).await.unwrap());
        assert!(!store.put_if_absent("k", b"b".to_vec()).await.unwrap());
        assert!(!store.remove_if("k", b"b").await.unwrap());
        assert!(store.remove_if("k", b"a").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.remove("k").await.unwrap());
    }

    #[tokio::test]
    async fn prefix_scan_matches_literal_prefix() {
        let store = SqliteStore::open_in_memory().unwrap();
        for key in ["signal:2", "signal:1", "feed:order", "signals"] {
            store.put(key, key.as_bytes().to_vec()).await.unwrap();
        }

        let keys: Vec<_> = store
            .scan_prefix("signal:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["signal:1", "signal:2"]);
    }
}
