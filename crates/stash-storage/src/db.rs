//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and recommended PRAGMAs on initialization and runs
//! the versioned schema migrations.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use stash_core::error::{Result, StashError};

/// Thread-safe SQLite database wrapper.
///
/// Backs the small-value KV table and the database file backend. Uses WAL
/// mode for concurrent read/write safety. The connection is wrapped in a
/// Mutex since rusqlite Connection is not Sync.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path.
    ///
    /// Configures WAL mode, synchronous=NORMAL, foreign keys, and runs
    /// all pending schema migrations.
    pub fn new(path: &Path) -> Result<Self> {
        // Ensure parent directory exists.
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| StashError::Backend(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| StashError::Backend(format!("Failed to set pragmas: {}", e)))?;

        info!("Database opened at {}", path.display());

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.with_conn(run_schema_migrations)?;

        Ok(db)
    }

    /// Open an in-memory database (for testing and filesystem-less targets).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StashError::Backend(format!("Failed to open in-memory db: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.with_conn(run_schema_migrations)?;

        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// This is the primary way to interact with the database. The mutex
    /// is held for the duration of the closure.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StashError::Backend(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Trivial liveness probe (`SELECT 1`).
    ///
    /// Used by `StorageContext::init` to confirm the structured backend is
    /// answering queries after startup.
    pub fn probe(&self) -> Result<()> {
        self.with_conn(|conn| {
            let one: i64 = conn
                .query_row("SELECT 1", [], |row| row.get(0))
                .map_err(|e| StashError::Backend(format!("Liveness probe failed: {}", e)))?;
            debug_assert_eq!(one, 1);
            Ok(())
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

/// Run all pending schema migrations.
///
/// Version 1 creates the `kv` table (small-value backend) and the `files`
/// table (database file backend). Future revisions append version checks.
fn run_schema_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| StashError::Backend(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StashError::Backend(format!("Failed to query schema version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied schema migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: kv and files tables.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Small-value key-value backend.
        CREATE TABLE IF NOT EXISTS kv (
            key         TEXT PRIMARY KEY NOT NULL,
            value       TEXT NOT NULL,
            updated_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        -- Database file backend (single binary-capable store standing in
        -- for both roots on platforms without a real filesystem).
        CREATE TABLE IF NOT EXISTS files (
            uri         TEXT PRIMARY KEY NOT NULL,
            root        TEXT NOT NULL
                        CHECK (root IN ('durable', 'cache')),
            is_text     INTEGER NOT NULL DEFAULT 0,
            data        BLOB NOT NULL,
            created_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_files_root
            ON files (root, created_at ASC);

        INSERT INTO schema_migrations (version, name)
            VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| StashError::Backend(format!("Failed to apply schema v1: {}", e)))?;
    Ok(())
}
