//! Key-value store with size-based backend routing.
//!
//! Values are serialized to JSON before persisting. Small payloads live in
//! the SQLite `kv` table; payloads over the configured threshold (or keys
//! carrying the reserved routing prefix) go to a file-per-key blob backend.
//! Reads are backend-transparent: callers only ever present a key.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::OptionalExtension;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use stash_core::config::KvConfig;
use stash_core::error::{Result, StashError};

use crate::db::Database;

/// Storage backend for raw string values keyed by string.
///
/// Implementations are synchronous; the async surface lives on [`KvStore`].
pub trait KvBackend: Send + Sync {
    /// Fetch the raw stored text for a key.
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Store raw text under a key, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
    /// Remove every key held by this backend.
    fn clear(&self) -> Result<()>;
    /// All keys currently held by this backend.
    fn keys(&self) -> Result<Vec<String>>;
}

/// Small-value backend over the SQLite `kv` table.
pub struct SqliteKv {
    db: Arc<Database>,
}

impl SqliteKv {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl KvBackend for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StashError::Backend(format!("Failed to read key: {}", e)))
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at)
                 VALUES (?1, ?2, strftime('%s', 'now'))
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                rusqlite::params![key, value],
            )
            .map_err(|e| StashError::Backend(format!("Failed to write key: {}", e)))?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])
                .map_err(|e| StashError::Backend(format!("Failed to remove key: {}", e)))?;
            Ok(())
        })
    }

    fn clear(&self) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM kv", [])
                .map_err(|e| StashError::Backend(format!("Failed to clear kv: {}", e)))?;
            Ok(())
        })
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key FROM kv ORDER BY key")
                .map_err(|e| StashError::Backend(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| StashError::Backend(e.to_string()))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row.map_err(|e| StashError::Backend(e.to_string()))?);
            }
            Ok(keys)
        })
    }
}

/// Large-value backend: one file per key under a dedicated directory.
///
/// Filenames are the hex encoding of the key bytes, so arbitrary key
/// strings are always filesystem-safe and reversible.
pub struct BlobFileKv {
    dir: PathBuf,
}

impl BlobFileKv {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(key.as_bytes()))
    }
}

impl KvBackend for BlobFileKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path_for(key), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> Result<()> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(bytes) = hex::decode(name) else { continue };
            if let Ok(key) = String::from_utf8(bytes) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// The key-value store facade over a small-value and a large-value backend.
///
/// Failure policy is asymmetric by design: reads swallow failures and
/// return `None` (callers treat a missing value as "not yet set"), writes
/// propagate (a write that silently fails to persist is unacceptable),
/// removes and clears are logged and swallowed.
#[derive(Clone)]
pub struct KvStore {
    small: Arc<dyn KvBackend>,
    large: Arc<dyn KvBackend>,
    threshold: usize,
    large_prefix: String,
}

impl KvStore {
    /// Compose a store from a small-value and a large-value backend.
    pub fn new(small: Arc<dyn KvBackend>, large: Arc<dyn KvBackend>, config: &KvConfig) -> Self {
        Self {
            small,
            large,
            threshold: config.large_value_threshold,
            large_prefix: config.large_key_prefix.clone(),
        }
    }

    /// Serialize and store a value under a key.
    ///
    /// Non-string values are encoded as JSON. Values over the size
    /// threshold, and keys carrying the routing prefix, go to the large
    /// backend; the key is removed from the other backend so a stale copy
    /// never shadows the live one when a value crosses the threshold.
    pub async fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.set_raw(key, &text)
    }

    /// Fetch and deserialize the value for a key.
    ///
    /// Returns `None` when the key is absent, when the backend fails (read
    /// failures are swallowed and logged), or when the stored text cannot
    /// be decoded as `T`. Stored text that is not valid JSON is retried as
    /// a plain JSON string, so legacy values written before this layer
    /// existed still decode when `T` is `String`.
    pub async fn get_item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.read_raw(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(_) => serde_json::from_value(serde_json::Value::String(raw)).ok(),
        }
    }

    /// Remove a key from both backends. Failures are logged, not surfaced.
    pub async fn remove_item(&self, key: &str) {
        if let Err(e) = self.small.remove(key) {
            warn!(key, error = %e, "KV remove failed on small backend");
        }
        if let Err(e) = self.large.remove(key) {
            warn!(key, error = %e, "KV remove failed on large backend");
        }
    }

    /// Remove every key from both backends. Failures are logged, not surfaced.
    pub async fn clear(&self) {
        if let Err(e) = self.small.clear() {
            warn!(error = %e, "KV clear failed on small backend");
        }
        if let Err(e) = self.large.clear() {
            warn!(error = %e, "KV clear failed on large backend");
        }
    }

    /// All keys across both backends, de-duplicated and sorted.
    pub async fn all_keys(&self) -> Vec<String> {
        let mut keys = self.small.keys().unwrap_or_else(|e| {
            warn!(error = %e, "KV key listing failed on small backend");
            Vec::new()
        });
        let large = self.large.keys().unwrap_or_else(|e| {
            warn!(error = %e, "KV key listing failed on large backend");
            Vec::new()
        });
        keys.extend(large);
        keys.sort();
        keys.dedup();
        keys
    }

    /// Whether the stored text for a key routes to the large backend.
    fn routes_large(&self, key: &str, text: &str) -> bool {
        key.starts_with(&self.large_prefix) || text.len() > self.threshold
    }

    /// Store raw text with routing. Used by `set_item` and the migration
    /// engine (which must move legacy values verbatim, without re-encoding).
    pub(crate) fn set_raw(&self, key: &str, text: &str) -> Result<()> {
        if self.routes_large(key, text) {
            self.large.set(key, text)?;
            // Reads check the small backend first, so a stale small copy
            // would shadow the value just written: this removal is part of
            // the write and stays loud.
            self.small.remove(key)?;
        } else {
            self.small.set(key, text)?;
            // A stale large copy never shadows (the small backend wins on
            // read); the value is durably persisted at this point, so a
            // failed cleanup is not a write failure.
            if let Err(e) = self.large.remove(key) {
                warn!(key, error = %e, "Stale large-backend copy not removed");
            }
        }
        Ok(())
    }

    /// Fetch raw text with backend-transparent lookup, propagating errors.
    pub(crate) fn get_raw(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.small.get(key)? {
            return Ok(Some(value));
        }
        self.large.get(key)
    }

    /// Remove raw text from both backends, propagating errors.
    pub(crate) fn remove_raw(&self, key: &str) -> Result<()> {
        self.small.remove(key)?;
        self.large.remove(key)
    }

    /// Backend-transparent read with the swallow-and-log policy applied.
    fn read_raw(&self, key: &str) -> Option<String> {
        match self.get_raw(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "KV read failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("threshold", &self.threshold)
            .field("large_prefix", &self.large_prefix)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn test_store(dir: &std::path::Path) -> KvStore {
        let db = Arc::new(Database::in_memory().unwrap());
        KvStore::new(
            Arc::new(SqliteKv::new(db)),
            Arc::new(BlobFileKv::new(dir.join("kv-blobs"))),
            &KvConfig::default(),
        )
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        font_size: u32,
    }

    #[tokio::test]
    async fn test_roundtrip_string() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.set_item("user:name", "alice").await.unwrap();
        assert_eq!(
            store.get_item::<String>("user:name").await,
            Some("alice".to_string())
        );
    }

    #[tokio::test]
    async fn test_roundtrip_number() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.set_item("counter", &42i64).await.unwrap();
        assert_eq!(store.get_item::<i64>("counter").await, Some(42));
    }

    #[tokio::test]
    async fn test_roundtrip_struct() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let settings = Settings {
            theme: "dark".to_string(),
            font_size: 14,
        };
        store.set_item("user:settings", &settings).await.unwrap();
        assert_eq!(
            store.get_item::<Settings>("user:settings").await,
            Some(settings)
        );
    }

    #[tokio::test]
    async fn test_roundtrip_array() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let tags = vec!["a".to_string(), "b".to_string()];
        store.set_item("tags", &tags).await.unwrap();
        assert_eq!(store.get_item::<Vec<String>>("tags").await, Some(tags));
    }

    #[tokio::test]
    async fn test_missing_key_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        assert_eq!(store.get_item::<String>("nonexistent").await, None);
    }

    #[tokio::test]
    async fn test_legacy_plain_string_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        // A value written before this layer existed: raw text, not JSON.
        store.small.set("legacy", "plain old value").unwrap();
        assert_eq!(
            store.get_item::<String>("legacy").await,
            Some("plain old value".to_string())
        );
    }

    #[tokio::test]
    async fn test_undecodable_value_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.small.set("weird", "not json at all").unwrap();
        assert_eq!(store.get_item::<u64>("weird").await, None);
    }

    #[tokio::test]
    async fn test_large_value_routed_and_transparent() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let big = "x".repeat(1_048_577);
        store.set_item("payload", &big).await.unwrap();

        // Routed away from the small backend.
        assert_eq!(store.small.get("payload").unwrap(), None);
        assert!(store.large.get("payload").unwrap().is_some());

        // But a plain get_item still finds it.
        assert_eq!(store.get_item::<String>("payload").await, Some(big));
    }

    #[tokio::test]
    async fn test_prefix_routed_to_large_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.set_item("blob:avatar", "tiny").await.unwrap();
        assert_eq!(store.small.get("blob:avatar").unwrap(), None);
        assert_eq!(
            store.get_item::<String>("blob:avatar").await,
            Some("tiny".to_string())
        );
    }

    #[tokio::test]
    async fn test_shrinking_value_leaves_no_stale_shadow() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let big = "x".repeat(1_048_577);
        store.set_item("doc", &big).await.unwrap();
        store.set_item("doc", "small now").await.unwrap();

        assert_eq!(store.large.get("doc").unwrap(), None);
        assert_eq!(
            store.get_item::<String>("doc").await,
            Some("small now".to_string())
        );
    }

    #[tokio::test]
    async fn test_remove_item() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.set_item("gone", "v").await.unwrap();
        store.remove_item("gone").await;
        assert_eq!(store.get_item::<String>("gone").await, None);
    }

    #[tokio::test]
    async fn test_clear_spans_both_backends() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.set_item("a", "1").await.unwrap();
        store.set_item("blob:b", "2").await.unwrap();
        store.clear().await;
        assert!(store.all_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_all_keys_union() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.set_item("a", "1").await.unwrap();
        store.set_item("blob:b", "2").await.unwrap();
        assert_eq!(
            store.all_keys().await,
            vec!["a".to_string(), "blob:b".to_string()]
        );
    }

    /// In-memory backend whose removes always fail, for cleanup-path tests.
    struct RemoveFailKv {
        inner: std::sync::Mutex<std::collections::HashMap<String, String>>,
    }

    impl RemoveFailKv {
        fn new() -> Self {
            Self {
                inner: std::sync::Mutex::new(std::collections::HashMap::new()),
            }
        }
    }

    impl KvBackend for RemoveFailKv {
        fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.inner.lock().unwrap().get(key).cloned())
        }
        fn set(&self, key: &str, value: &str) -> Result<()> {
            self.inner
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
        fn remove(&self, _key: &str) -> Result<()> {
            Err(StashError::Backend("remove disabled".to_string()))
        }
        fn clear(&self) -> Result<()> {
            self.inner.lock().unwrap().clear();
            Ok(())
        }
        fn keys(&self) -> Result<Vec<String>> {
            Ok(self.inner.lock().unwrap().keys().cloned().collect())
        }
    }

    #[tokio::test]
    async fn test_small_write_succeeds_despite_failed_large_cleanup() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = KvStore::new(
            Arc::new(SqliteKv::new(db)),
            Arc::new(RemoveFailKv::new()),
            &KvConfig::default(),
        );
        // The value lands in the small backend; the failed cleanup of the
        // (empty) large backend must not turn a persisted write into an error.
        store.set_item("note", "v").await.unwrap();
        assert_eq!(store.get_item::<String>("note").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_large_write_stays_loud_when_stale_shadow_remains() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new(
            Arc::new(RemoveFailKv::new()),
            Arc::new(BlobFileKv::new(dir.path().join("kv-blobs"))),
            &KvConfig::default(),
        );
        store.set_item("doc", "small").await.unwrap();

        // Rewriting past the threshold must remove the small copy (reads
        // check it first); when that fails, the write reports the fault.
        let big = "x".repeat(1_048_577);
        assert!(store.set_item("doc", &big).await.is_err());
    }

    #[test]
    fn test_blob_file_kv_key_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BlobFileKv::new(dir.path().join("blobs"));
        backend.set("weird/key:with*chars", "v").unwrap();
        assert_eq!(
            backend.get("weird/key:with*chars").unwrap(),
            Some("v".to_string())
        );
        assert_eq!(backend.keys().unwrap(), vec!["weird/key:with*chars"]);
    }
}
