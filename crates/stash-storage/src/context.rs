//! Storage context - composition root for the three stores.
//!
//! One `StorageContext` is constructed at process start and threaded
//! through the call graph; there are no module-level singletons, so tests
//! build isolated instances over temp directories. Backend selection
//! happens here, once, at construction.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use stash_core::config::StashConfig;
use stash_core::error::Result;

use crate::db::Database;
use crate::files::{FileStore, FsFiles};
use crate::kv::{BlobFileKv, KvStore, SqliteKv};
use crate::migrate::MigrationEngine;
use crate::secure::SecretStore;

/// Database filename under the durable root.
const DB_FILE: &str = "stash.db";

/// The composed storage system: KV, secrets, files, and migration.
#[derive(Clone)]
pub struct StorageContext {
    kv: KvStore,
    secrets: SecretStore,
    files: FileStore,
    migration: Arc<MigrationEngine>,
    db: Arc<Database>,
    cache_retention_days: u32,
}

impl StorageContext {
    /// Build the default platform wiring from configuration.
    ///
    /// Opens the SQLite database under the durable root, routes small KV
    /// values into it and large ones into per-key blob files, puts files
    /// on the real filesystem, and selects the strongest secret backend
    /// for the platform. Targets without a real filesystem substitute
    /// [`crate::files::DbFiles`] through [`with_backends`](Self::with_backends).
    pub fn new(config: &StashConfig) -> Result<Self> {
        let durable = PathBuf::from(&config.roots.durable_dir);
        let cache = PathBuf::from(&config.roots.cache_dir);
        let legacy = PathBuf::from(&config.roots.legacy_dir);

        let db = Arc::new(Database::new(&durable.join(DB_FILE))?);

        let kv = KvStore::new(
            Arc::new(SqliteKv::new(db.clone())),
            Arc::new(BlobFileKv::new(durable.join("kv-blobs"))),
            &config.kv,
        );
        let secrets = SecretStore::for_platform(&config.secrets);
        // File payloads get their own subdirectory: the database, its WAL
        // sidecars, and the kv-blobs directory share the durable area and
        // must never surface through file listings or removable URIs.
        let files = FileStore::new(Arc::new(FsFiles::new(durable.join("files"), cache)));
        let migration = Arc::new(MigrationEngine::new(kv.clone(), files.clone(), legacy));

        Ok(Self {
            kv,
            secrets,
            files,
            migration,
            db,
            cache_retention_days: config.cache.retention_days,
        })
    }

    /// Build from explicit parts - the DI seam for tests and for targets
    /// whose defaults differ from the desktop wiring.
    pub fn with_backends(
        kv: KvStore,
        secrets: SecretStore,
        files: FileStore,
        db: Arc<Database>,
        legacy_dir: PathBuf,
        cache_retention_days: u32,
    ) -> Self {
        let migration = Arc::new(MigrationEngine::new(kv.clone(), files.clone(), legacy_dir));
        Self {
            kv,
            secrets,
            files,
            migration,
            db,
            cache_retention_days,
        }
    }

    /// The key-value store.
    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// The secret store.
    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    /// The file store.
    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// Startup hook: migrate if pending, probe the database, schedule the
    /// cache sweep.
    ///
    /// Never fails the caller. Storage faults degrade functionality; they
    /// must not block or abort application startup, so every internal
    /// error is logged and swallowed and the sweep runs fire-and-forget.
    pub async fn init(&self) {
        if let Err(e) = self.try_init().await {
            warn!(error = %e, "Storage init degraded; continuing startup");
        }
    }

    async fn try_init(&self) -> Result<()> {
        let report = self.migration.migrate().await;
        if !report.success {
            warn!(
                items_migrated = report.items_migrated,
                errors = ?report.errors,
                "Storage migration reported errors"
            );
        }

        self.db.probe()?;

        let files = self.files.clone();
        let retention_days = self.cache_retention_days;
        tokio::spawn(async move {
            files.sweep_cache(retention_days).await;
        });

        info!("Storage initialized");
        Ok(())
    }
}

impl std::fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageContext")
            .field("cache_retention_days", &self.cache_retention_days)
            .finish()
    }
}
