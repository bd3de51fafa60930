//! Secure store for small secret strings (tokens, credentials).
//!
//! On desktop platforms secrets live in the OS credential store via the
//! `keyring` crate. Where no OS store exists the fallback is an in-memory
//! session map that is cleared at process exit: prefer losing the secret
//! to leaking it. The backend is selected once at construction, never per
//! call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{error, warn};

use stash_core::config::SecretsConfig;
use stash_core::error::{Result, StashError};
use stash_core::types::SecretBackendKind;

/// Storage backend for secret strings.
///
/// Implementations are synchronous; the async surface lives on
/// [`SecretStore`].
pub trait SecretBackend: Send + Sync {
    /// Fetch a secret. Absent keys are `Ok(None)`.
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Store a secret, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Delete a secret. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
    /// Which kind of backend this is, so callers can observe degradation.
    fn kind(&self) -> SecretBackendKind;
}

/// OS credential store backend (keychain / Credential Manager / libsecret).
pub struct KeyringSecrets {
    service: String,
}

impl KeyringSecrets {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, key)
            .map_err(|e| StashError::Secure(format!("Keyring entry failed: {}", e)))
    }
}

impl SecretBackend for KeyringSecrets {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StashError::Secure(format!("Keyring read failed: {}", e))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| StashError::Secure(format!("Keyring write failed: {}", e)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StashError::Secure(format!("Keyring delete failed: {}", e))),
        }
    }

    fn kind(&self) -> SecretBackendKind {
        SecretBackendKind::OsKeyring
    }
}

/// In-memory session backend: process-lifetime only, never touches disk.
#[derive(Default)]
pub struct SessionSecrets {
    map: Mutex<HashMap<String, String>>,
}

impl SessionSecrets {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretBackend for SessionSecrets {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self
            .map
            .lock()
            .map_err(|e| StashError::Secure(format!("Session map poisoned: {}", e)))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|e| StashError::Secure(format!("Session map poisoned: {}", e)))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|e| StashError::Secure(format!("Session map poisoned: {}", e)))?;
        map.remove(key);
        Ok(())
    }

    fn kind(&self) -> SecretBackendKind {
        SecretBackendKind::Session
    }
}

/// Secret store facade.
///
/// Failure policy differs from the KV store on purpose: reads and deletes
/// swallow failures, and writes are logged at `error` level but do not
/// surface to the caller. A caller cannot act on a keychain fault, and a
/// lost token re-prompts authentication; a crash would not.
///
/// Key convention is `domain:name` (e.g. `auth:token`); not enforced.
#[derive(Clone)]
pub struct SecretStore {
    backend: Arc<dyn SecretBackend>,
}

impl SecretStore {
    /// Construct over an explicit backend (the DI seam used by tests).
    pub fn with_backend(backend: Arc<dyn SecretBackend>) -> Self {
        Self { backend }
    }

    /// Select the strongest backend available on this platform.
    ///
    /// Desktop targets get the OS keyring; everything else, and any
    /// configuration with `force_session` set, gets the session map.
    pub fn for_platform(config: &SecretsConfig) -> Self {
        if config.force_session {
            warn!("Secret store forced to session backend; secrets will not survive restart");
            return Self::with_backend(Arc::new(SessionSecrets::new()));
        }
        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
        return Self::with_backend(Arc::new(KeyringSecrets::new(&config.service)));

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            warn!("No OS secret store on this platform; using session backend");
            Self::with_backend(Arc::new(SessionSecrets::new()))
        }
    }

    /// Fetch a secret. Absent keys and backend failures both yield `None`.
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Secret read failed");
                None
            }
        }
    }

    /// Store a secret. Failures are logged, never surfaced.
    pub async fn set(&self, key: &str, value: &str) {
        if let Err(e) = self.backend.set(key, value) {
            error!(key, error = %e, "Secret write failed");
        }
    }

    /// Delete a secret. Failures are logged, never surfaced.
    pub async fn del(&self, key: &str) {
        if let Err(e) = self.backend.delete(key) {
            warn!(key, error = %e, "Secret delete failed");
        }
    }

    /// Which kind of backend this store was constructed over.
    pub fn backend_kind(&self) -> SecretBackendKind {
        self.backend.kind()
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("backend", &self.backend.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_store() -> SecretStore {
        SecretStore::with_backend(Arc::new(SessionSecrets::new()))
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = session_store();
        store.set("auth:token", "s3cret").await;
        assert_eq!(store.get("auth:token").await, Some("s3cret".to_string()));
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = session_store();
        assert_eq!(store.get("auth:token").await, None);
    }

    #[tokio::test]
    async fn test_overwrite() {
        let store = session_store();
        store.set("auth:token", "old").await;
        store.set("auth:token", "new").await;
        assert_eq!(store.get("auth:token").await, Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = session_store();
        store.set("auth:token", "v").await;
        store.del("auth:token").await;
        store.del("auth:token").await;
        assert_eq!(store.get("auth:token").await, None);
    }

    #[tokio::test]
    async fn test_backend_kind_observable() {
        let store = session_store();
        assert_eq!(store.backend_kind(), SecretBackendKind::Session);
    }

    #[test]
    fn test_force_session_overrides_platform() {
        let config = SecretsConfig {
            force_session: true,
            ..SecretsConfig::default()
        };
        let store = SecretStore::for_platform(&config);
        assert_eq!(store.backend_kind(), SecretBackendKind::Session);
    }
}
