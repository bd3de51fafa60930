//! File store: named binary/text blobs under a durable and a cache root.
//!
//! Callers receive opaque URIs from `resolve`/`write` and persist them
//! (typically in the KV store) to retrieve files later. Two backends:
//!
//! * [`FsFiles`] — real filesystem, two separate directories. URIs are
//!   absolute paths.
//! * [`DbFiles`] — a single binary-capable SQLite table standing in for
//!   both roots on platforms without a true filesystem. URIs are
//!   `"durable/<name>"` / `"cache/<name>"` strings; the durable/cache
//!   split is a path-prefix convention only, which weakens the
//!   eviction-exclusion guarantee for durable data on such platforms.
//!   This is a known limitation of the substitute, not a bug.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::OptionalExtension;
use tracing::{info, warn};

use stash_core::error::{Result, StashError};
use stash_core::types::{FileData, StorageRoot};

use crate::db::Database;

/// Storage backend for named file payloads.
///
/// Implementations are synchronous; the async surface lives on
/// [`FileStore`].
pub trait FileBackend: Send + Sync {
    /// Resolve path parts under a root into an opaque URI.
    fn resolve(&self, root: StorageRoot, parts: &[&str]) -> String;
    /// Write a payload under a root, creating intermediate path segments,
    /// and return the resolved URI.
    fn write(&self, root: StorageRoot, name: &str, data: &FileData) -> Result<String>;
    /// Read the payload behind a URI. Absent URIs are `Ok(None)`.
    fn read(&self, uri: &str) -> Result<Option<FileData>>;
    /// List the URIs of files under a root (optionally under a subpath).
    fn list(&self, root: StorageRoot, subpath: Option<&str>) -> Result<Vec<String>>;
    /// Remove the file behind a URI. Removing an absent URI is not an error.
    fn remove(&self, uri: &str) -> Result<()>;
    /// Whether a URI currently resolves to a stored file.
    fn exists(&self, uri: &str) -> Result<bool>;
    /// Delete cache-root entries older than the cutoff; returns the count.
    fn sweep_cache(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Filesystem backend with genuinely separate durable and cache roots.
pub struct FsFiles {
    durable: PathBuf,
    cache: PathBuf,
}

impl FsFiles {
    pub fn new(durable: PathBuf, cache: PathBuf) -> Self {
        Self { durable, cache }
    }

    fn root_dir(&self, root: StorageRoot) -> &Path {
        match root {
            StorageRoot::Durable => &self.durable,
            StorageRoot::Cache => &self.cache,
        }
    }

    /// Map a URI back to a path, refusing anything outside the two roots.
    ///
    /// The prefix check is lexical, so parent-dir components are rejected
    /// outright: `<root>/../x` would pass a plain `starts_with` and then
    /// resolve outside the root.
    fn path_for(&self, uri: &str) -> Result<PathBuf> {
        let path = PathBuf::from(uri);
        let inside = path.starts_with(&self.durable) || path.starts_with(&self.cache);
        let traverses = path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if inside && !traverses {
            Ok(path)
        } else {
            Err(StashError::Backend(format!(
                "URI outside storage roots: {}",
                uri
            )))
        }
    }

    fn collect_files(dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_files(&path, out)?;
            } else {
                out.push(path.to_string_lossy().into_owned());
            }
        }
        Ok(())
    }

    fn sweep_dir(dir: &Path, cutoff: std::time::SystemTime, removed: &mut usize) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                Self::sweep_dir(&path, cutoff, removed)?;
                continue;
            }
            let modified = std::fs::metadata(&path)?.modified()?;
            if modified < cutoff {
                std::fs::remove_file(&path)?;
                *removed += 1;
            }
        }
        Ok(())
    }
}

impl FileBackend for FsFiles {
    fn resolve(&self, root: StorageRoot, parts: &[&str]) -> String {
        let mut path = self.root_dir(root).to_path_buf();
        for part in parts {
            path.push(part);
        }
        path.to_string_lossy().into_owned()
    }

    fn write(&self, root: StorageRoot, name: &str, data: &FileData) -> Result<String> {
        let path = self.root_dir(root).join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data.as_bytes())?;
        Ok(path.to_string_lossy().into_owned())
    }

    fn read(&self, uri: &str) -> Result<Option<FileData>> {
        let path = self.path_for(uri)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // The filesystem does not track a text/binary tag; UTF-8 content
        // comes back as Text. Equality on FileData is byte-wise, so the
        // round-trip invariant holds either way.
        Ok(Some(match String::from_utf8(bytes) {
            Ok(text) => FileData::Text(text),
            Err(e) => FileData::Bytes(e.into_bytes()),
        }))
    }

    fn list(&self, root: StorageRoot, subpath: Option<&str>) -> Result<Vec<String>> {
        let mut dir = self.root_dir(root).to_path_buf();
        if let Some(sub) = subpath {
            dir.push(sub);
        }
        let mut out = Vec::new();
        Self::collect_files(&dir, &mut out)?;
        out.sort();
        Ok(out)
    }

    fn remove(&self, uri: &str) -> Result<()> {
        let path = self.path_for(uri)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.path_for(uri)?.is_file())
    }

    fn sweep_cache(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        Self::sweep_dir(&self.cache, cutoff.into(), &mut removed)?;
        Ok(removed)
    }
}

/// Database backend: both roots inside the `files` table.
///
/// The substitute for platforms with no real filesystem. The stored
/// `is_text` flag preserves the caller's text/bytes distinction exactly.
pub struct DbFiles {
    db: Arc<Database>,
}

impl DbFiles {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl FileBackend for DbFiles {
    fn resolve(&self, root: StorageRoot, parts: &[&str]) -> String {
        let mut uri = root.as_str().to_string();
        for part in parts {
            uri.push('/');
            uri.push_str(part);
        }
        uri
    }

    fn write(&self, root: StorageRoot, name: &str, data: &FileData) -> Result<String> {
        let uri = self.resolve(root, &[name]);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO files (uri, root, is_text, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now'))
                 ON CONFLICT(uri) DO UPDATE SET
                     is_text = excluded.is_text,
                     data = excluded.data,
                     created_at = excluded.created_at",
                rusqlite::params![uri, root.as_str(), data.is_text() as i32, data.as_bytes()],
            )
            .map_err(|e| StashError::Backend(format!("Failed to write file row: {}", e)))?;
            Ok(())
        })?;
        Ok(uri)
    }

    fn read(&self, uri: &str) -> Result<Option<FileData>> {
        self.db.with_conn(|conn| {
            let row: Option<(bool, Vec<u8>)> = conn
                .query_row(
                    "SELECT is_text, data FROM files WHERE uri = ?1",
                    rusqlite::params![uri],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| StashError::Backend(format!("Failed to read file row: {}", e)))?;
            Ok(row.map(|(is_text, bytes)| {
                if is_text {
                    match String::from_utf8(bytes) {
                        Ok(text) => FileData::Text(text),
                        Err(e) => FileData::Bytes(e.into_bytes()),
                    }
                } else {
                    FileData::Bytes(bytes)
                }
            }))
        })
    }

    fn list(&self, root: StorageRoot, subpath: Option<&str>) -> Result<Vec<String>> {
        let prefix = match subpath {
            Some(sub) => format!("{}/{}/", root.as_str(), sub),
            None => format!("{}/", root.as_str()),
        };
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT uri FROM files
                     WHERE root = ?1 AND uri LIKE ?2 ESCAPE '\\'
                     ORDER BY uri",
                )
                .map_err(|e| StashError::Backend(e.to_string()))?;
            let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
            let rows = stmt
                .query_map(
                    rusqlite::params![root.as_str(), pattern],
                    |row| row.get::<_, String>(0),
                )
                .map_err(|e| StashError::Backend(e.to_string()))?;
            let mut uris = Vec::new();
            for row in rows {
                uris.push(row.map_err(|e| StashError::Backend(e.to_string()))?);
            }
            Ok(uris)
        })
    }

    fn remove(&self, uri: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM files WHERE uri = ?1", rusqlite::params![uri])
                .map_err(|e| StashError::Backend(format!("Failed to remove file row: {}", e)))?;
            Ok(())
        })
    }

    fn exists(&self, uri: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM files WHERE uri = ?1",
                    rusqlite::params![uri],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StashError::Backend(e.to_string()))?;
            Ok(found.is_some())
        })
    }

    fn sweep_cache(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.db.with_conn(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM files WHERE root = 'cache' AND created_at < ?1",
                    rusqlite::params![cutoff.timestamp()],
                )
                .map_err(|e| StashError::Backend(format!("Cache sweep failed: {}", e)))?;
            Ok(removed)
        })
    }
}

/// File store facade.
///
/// Reads, listings, existence checks, and removes swallow failures and
/// return their empty defaults; writes propagate, since a write must
/// either hand back a valid URI or fail loudly (a fabricated URI would be
/// persisted by callers and dangle forever).
#[derive(Clone)]
pub struct FileStore {
    backend: Arc<dyn FileBackend>,
}

impl FileStore {
    pub fn new(backend: Arc<dyn FileBackend>) -> Self {
        Self { backend }
    }

    /// Resolve path parts under a root into an opaque URI.
    pub async fn resolve(&self, root: StorageRoot, parts: &[&str]) -> String {
        self.backend.resolve(root, parts)
    }

    /// Write a payload and return its URI. Write failures propagate.
    pub async fn write(
        &self,
        root: StorageRoot,
        name: &str,
        data: impl Into<FileData>,
    ) -> Result<String> {
        self.backend.write(root, name, &data.into())
    }

    /// Read the payload behind a URI. Absent URIs and read failures both
    /// yield `None`.
    pub async fn read(&self, uri: &str) -> Option<FileData> {
        match self.backend.read(uri) {
            Ok(data) => data,
            Err(e) => {
                warn!(uri, error = %e, "File read failed");
                None
            }
        }
    }

    /// List file URIs under a root. Failures yield an empty list.
    pub async fn list(&self, root: StorageRoot, subpath: Option<&str>) -> Vec<String> {
        self.backend.list(root, subpath).unwrap_or_else(|e| {
            warn!(root = root.as_str(), error = %e, "File listing failed");
            Vec::new()
        })
    }

    /// Remove the file behind a URI. Failures are logged, not surfaced.
    pub async fn remove(&self, uri: &str) {
        if let Err(e) = self.backend.remove(uri) {
            warn!(uri, error = %e, "File remove failed");
        }
    }

    /// Whether a URI currently resolves to a stored file.
    pub async fn exists(&self, uri: &str) -> bool {
        self.backend.exists(uri).unwrap_or_else(|e| {
            warn!(uri, error = %e, "File existence check failed");
            false
        })
    }

    /// Delete cache entries older than the retention window.
    ///
    /// Best-effort: failures are logged and reported as zero removals.
    /// Scheduled fire-and-forget from `StorageContext::init`.
    pub async fn sweep_cache(&self, retention_days: u32) -> usize {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        match self.backend.sweep_cache(cutoff) {
            Ok(removed) => {
                info!(removed, retention_days, "Cache sweep completed");
                removed
            }
            Err(e) => {
                warn!(error = %e, "Cache sweep failed");
                0
            }
        }
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore").finish()
    }
}
