//! Stash core crate - shared error type, configuration, and storage types.
//!
//! Everything that both the storage engine and its embedders need: the
//! `StashError` taxonomy, the TOML-backed `StashConfig`, and the small
//! value types (`StorageRoot`, `FileData`) shared across stores.

pub mod config;
pub mod error;
pub mod types;

pub use config::StashConfig;
pub use error::{Result, StashError};
pub use types::{FileData, SecretBackendKind, StorageRoot};
