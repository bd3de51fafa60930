//! Stash storage crate - the cross-platform persistent storage engine.
//!
//! Provides a key-value store with size-based backend routing, a secure
//! store for secrets with graceful platform degradation, a file store
//! split into durable and cache roots, a one-time legacy-layout migration
//! engine, and the `StorageContext` facade whose `init()` never fails the
//! caller.

pub mod context;
pub mod db;
pub mod files;
pub mod kv;
pub mod migrate;
pub mod secure;

pub use context::StorageContext;
pub use db::Database;
pub use files::{DbFiles, FileBackend, FileStore, FsFiles};
pub use kv::{BlobFileKv, KvBackend, KvStore, SqliteKv};
pub use migrate::{MigrationEngine, MigrationReport, MARKER_DONE, MARKER_KEY};
pub use secure::{KeyringSecrets, SecretBackend, SecretStore, SessionSecrets};
