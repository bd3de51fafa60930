//! One-time migration from the legacy flat storage layout.
//!
//! State machine: NOT_MIGRATED -> MIGRATING -> DONE. The completion marker
//! is a well-known KV entry; once it holds the done value, `migrate()` is a
//! cheap no-op forever. Renaming [`MARKER_KEY`] in a future release is the
//! supported way to force a fresh migration after a layout change.
//!
//! Every step is best-effort and per-item: one failed item never aborts
//! the others, and the marker is written even after partial failures so a
//! permanently broken item cannot make every startup retry the whole run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use stash_core::types::StorageRoot;

use crate::files::FileStore;
use crate::kv::KvStore;

/// KV key holding the completion marker. Bump the version suffix to force
/// re-migration in a future schema revision.
pub const MARKER_KEY: &str = "_storage_migration_v1";

/// Literal completion value; anything else means the migration is pending.
pub const MARKER_DONE: &str = "done";

/// Legacy un-namespaced keys and their new namespaced homes.
const LEGACY_KEY_MAP: &[(&str, &str)] = &[
    ("theme", "user:theme"),
    ("locale", "user:locale"),
    ("onboarding_complete", "user:onboarding_complete"),
    ("draft", "drafts:current"),
    ("last_sync", "sync:last_run"),
    ("push_token", "notifications:push_token"),
];

/// Outcome of a migration run.
///
/// Partial failures do not fail the run: each failed item contributes one
/// entry to `errors` and `success` reports whether the run was clean.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    /// True when every attempted item migrated cleanly.
    pub success: bool,
    /// Number of items moved into the new layout.
    pub items_migrated: usize,
    /// One message per failed item.
    pub errors: Vec<String>,
}

impl MigrationReport {
    fn done() -> Self {
        Self {
            success: true,
            items_migrated: 0,
            errors: Vec::new(),
        }
    }
}

/// Performs the legacy-to-namespaced layout migration.
///
/// Re-entrancy: the in-memory `started` flag guarantees at most one run
/// per process on top of the persisted marker check. Concurrent processes
/// are not hardened against; duplicated work at first startup is accepted.
pub struct MigrationEngine {
    kv: KvStore,
    files: FileStore,
    legacy_dir: PathBuf,
    started: AtomicBool,
}

impl MigrationEngine {
    pub fn new(kv: KvStore, files: FileStore, legacy_dir: PathBuf) -> Self {
        Self {
            kv,
            files,
            legacy_dir,
            started: AtomicBool::new(false),
        }
    }

    /// Run the migration if it is still pending.
    ///
    /// Safe to invoke any number of times: after the marker is set (or a
    /// run has already started in this process) the call returns a
    /// zero-item success immediately.
    pub async fn migrate(&self) -> MigrationReport {
        if self.started.swap(true, Ordering::SeqCst) {
            return MigrationReport::done();
        }
        if self.kv.get_item::<String>(MARKER_KEY).await.as_deref() == Some(MARKER_DONE) {
            return MigrationReport::done();
        }

        info!("Storage migration pending; starting");
        let mut migrated = 0usize;
        let mut errors = Vec::new();

        self.migrate_flat_keys(&mut migrated, &mut errors);
        self.migrate_legacy_settings(&mut migrated, &mut errors);
        self.migrate_legacy_files(&mut migrated, &mut errors).await;

        // Marker is written regardless of partial failures: a transient
        // error must not cause a full retry on every subsequent startup.
        if let Err(e) = self.kv.set_item(MARKER_KEY, MARKER_DONE).await {
            errors.push(format!("marker write: {}", e));
        }

        let report = MigrationReport {
            success: errors.is_empty(),
            items_migrated: migrated,
            errors,
        };
        if report.success {
            info!(items_migrated = report.items_migrated, "Storage migration completed");
        } else {
            warn!(
                items_migrated = report.items_migrated,
                errors = report.errors.len(),
                "Storage migration completed with errors"
            );
        }
        report
    }

    /// Step A: move values from the legacy flat namespace into namespaced
    /// keys, verbatim (no re-encoding of the stored text).
    fn migrate_flat_keys(&self, migrated: &mut usize, errors: &mut Vec<String>) {
        for (old_key, new_key) in LEGACY_KEY_MAP {
            let value = match self.kv.get_raw(old_key) {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    errors.push(format!("key {}: {}", old_key, e));
                    continue;
                }
            };
            if let Err(e) = self
                .kv
                .set_raw(new_key, &value)
                .and_then(|()| self.kv.remove_raw(old_key))
            {
                errors.push(format!("key {}: {}", old_key, e));
                continue;
            }
            *migrated += 1;
        }
    }

    /// Step B: drain the insecure synchronous settings file that predates
    /// this layer into the KV store, then delete it.
    fn migrate_legacy_settings(&self, migrated: &mut usize, errors: &mut Vec<String>) {
        let path = self.legacy_dir.join("settings.json");
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                errors.push(format!("settings.json: {}", e));
                return;
            }
        };

        let mut failed = 0usize;
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&content) {
            Ok(entries) => {
                for (key, value) in entries {
                    let new_key = format!("settings:{}", key);
                    match self.kv.set_raw(&new_key, &value.to_string()) {
                        Ok(()) => *migrated += 1,
                        Err(e) => {
                            failed += 1;
                            errors.push(format!("settings.json {}: {}", key, e));
                        }
                    }
                }
            }
            Err(e) => {
                failed += 1;
                errors.push(format!("settings.json: {}", e));
            }
        }

        // The old medium is deleted only once everything it held is in the
        // KV store. The marker is still written after a failed run, so a
        // deleted-but-unmigrated file would be unrecoverable.
        if failed == 0 {
            if let Err(e) = std::fs::remove_file(&path) {
                errors.push(format!("settings.json delete: {}", e));
            }
        } else {
            warn!(failed, "Legacy settings file kept; not all entries migrated");
        }
    }

    /// Step C: relocate files from the legacy paths into the proper roots.
    /// `<legacy>/files` feeds the durable root, `<legacy>/tmp` the cache.
    async fn migrate_legacy_files(&self, migrated: &mut usize, errors: &mut Vec<String>) {
        for (subdir, root) in [("files", StorageRoot::Durable), ("tmp", StorageRoot::Cache)] {
            let dir = self.legacy_dir.join(subdir);
            let mut paths = Vec::new();
            collect_files(&dir, &mut paths);
            for path in paths {
                match self.relocate(&dir, &path, root).await {
                    Ok(()) => *migrated += 1,
                    Err(e) => errors.push(format!("file {}: {}", path.display(), e)),
                }
            }
        }
    }

    async fn relocate(
        &self,
        base: &Path,
        path: &Path,
        root: StorageRoot,
    ) -> stash_core::error::Result<()> {
        let name = path
            .strip_prefix(base)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let bytes = std::fs::read(path)?;
        self.files.write(root, &name, bytes).await?;
        std::fs::remove_file(path)?;
        Ok(())
    }
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("legacy_dir", &self.legacy_dir)
            .finish()
    }
}

/// Recursively gather file paths; a missing directory yields nothing.
fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use stash_core::config::KvConfig;

    use crate::db::Database;
    use crate::files::FsFiles;
    use crate::kv::{BlobFileKv, SqliteKv};

    struct Fixture {
        _dir: tempfile::TempDir,
        kv: KvStore,
        files: FileStore,
        legacy: PathBuf,
        durable: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let kv = KvStore::new(
            Arc::new(SqliteKv::new(db)),
            Arc::new(BlobFileKv::new(dir.path().join("kv-blobs"))),
            &KvConfig::default(),
        );
        let durable = dir.path().join("durable");
        let files = FileStore::new(Arc::new(FsFiles::new(
            durable.clone(),
            dir.path().join("cache"),
        )));
        let legacy = dir.path().join("legacy");
        std::fs::create_dir_all(&legacy).unwrap();
        Fixture {
            _dir: dir,
            kv,
            files,
            legacy,
            durable,
        }
    }

    fn engine(f: &Fixture) -> MigrationEngine {
        MigrationEngine::new(f.kv.clone(), f.files.clone(), f.legacy.clone())
    }

    #[tokio::test]
    async fn test_fresh_run_with_nothing_to_do() {
        let f = fixture();
        let report = engine(&f).migrate().await;
        assert!(report.success);
        assert_eq!(report.items_migrated, 0);
        assert_eq!(
            f.kv.get_item::<String>(MARKER_KEY).await.as_deref(),
            Some(MARKER_DONE)
        );
    }

    #[tokio::test]
    async fn test_flat_keys_moved_to_namespaces() {
        let f = fixture();
        f.kv.set_item("theme", "dark").await.unwrap();
        f.kv.set_item("locale", "en-US").await.unwrap();

        let report = engine(&f).migrate().await;
        assert!(report.success);
        assert_eq!(report.items_migrated, 2);

        assert_eq!(
            f.kv.get_item::<String>("user:theme").await.as_deref(),
            Some("dark")
        );
        assert_eq!(f.kv.get_item::<String>("theme").await, None);
    }

    #[tokio::test]
    async fn test_legacy_settings_file_drained_and_deleted() {
        let f = fixture();
        let path = f.legacy.join("settings.json");
        std::fs::write(&path, r#"{"volume": 7, "name": "alice"}"#).unwrap();

        let report = engine(&f).migrate().await;
        assert!(report.success);
        assert_eq!(report.items_migrated, 2);
        assert!(!path.exists());

        assert_eq!(f.kv.get_item::<u32>("settings:volume").await, Some(7));
        assert_eq!(
            f.kv.get_item::<String>("settings:name").await.as_deref(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn test_legacy_files_relocated() {
        let f = fixture();
        std::fs::create_dir_all(f.legacy.join("files/sub")).unwrap();
        std::fs::create_dir_all(f.legacy.join("tmp")).unwrap();
        std::fs::write(f.legacy.join("files/sub/a.txt"), "durable data").unwrap();
        std::fs::write(f.legacy.join("tmp/b.txt"), "cache data").unwrap();

        let report = engine(&f).migrate().await;
        assert!(report.success);
        assert_eq!(report.items_migrated, 2);

        let moved = f
            .files
            .read(&f.durable.join("sub/a.txt").to_string_lossy())
            .await
            .unwrap();
        assert_eq!(moved.as_text(), Some("durable data"));
        assert!(!f.legacy.join("files/sub/a.txt").exists());

        let cached = f.files.list(StorageRoot::Cache, None).await;
        assert_eq!(cached.len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let f = fixture();
        f.kv.set_item("theme", "dark").await.unwrap();

        let first = engine(&f).migrate().await;
        assert_eq!(first.items_migrated, 1);

        // A fresh engine over the same stores sees the marker.
        let second = engine(&f).migrate().await;
        assert!(second.success);
        assert_eq!(second.items_migrated, 0);
        assert_eq!(
            f.kv.get_item::<String>(MARKER_KEY).await.as_deref(),
            Some(MARKER_DONE)
        );
    }

    #[tokio::test]
    async fn test_in_process_guard_blocks_reentry() {
        let f = fixture();
        let engine = engine(&f);
        engine.migrate().await;

        // Even with the marker gone, the same engine instance never runs twice.
        f.kv.remove_item(MARKER_KEY).await;
        f.kv.set_item("theme", "dark").await.unwrap();
        let report = engine.migrate().await;
        assert!(report.success);
        assert_eq!(report.items_migrated, 0);
    }

    #[tokio::test]
    async fn test_unparseable_settings_file_is_preserved() {
        let f = fixture();
        let path = f.legacy.join("settings.json");
        std::fs::write(&path, "{{ broken").unwrap();

        let report = engine(&f).migrate().await;
        assert!(!report.success);
        assert_eq!(report.items_migrated, 0);
        // Nothing was moved, so the source must survive for recovery: the
        // marker is already set and no later run will look at it again.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_partial_failure_still_sets_marker() {
        let f = fixture();
        // Invalid JSON: the settings step fails, but the run completes and
        // the marker is still written.
        std::fs::write(f.legacy.join("settings.json"), "{{ broken").unwrap();
        f.kv.set_item("theme", "dark").await.unwrap();

        let report = engine(&f).migrate().await;
        assert!(!report.success);
        assert_eq!(report.items_migrated, 1);
        assert!(!report.errors.is_empty());
        assert_eq!(
            f.kv.get_item::<String>(MARKER_KEY).await.as_deref(),
            Some(MARKER_DONE)
        );

        let second = engine(&f).migrate().await;
        assert_eq!(second.items_migrated, 0);
    }
}
