use thiserror::Error;

/// Top-level error type for the storage system.
///
/// Absent keys and URIs are never errors: reads surface them as `Ok(None)`,
/// `false`, or an empty list. The variants here cover the faults that the
/// per-store policies either propagate (KV and File writes) or log and
/// swallow (everything else).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StashError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Secure store error: {0}")]
    Secure(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

impl From<toml::de::Error> for StashError {
    fn from(err: toml::de::Error) -> Self {
        StashError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for StashError {
    fn from(err: toml::ser::Error) -> Self {
        StashError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for StashError {
    fn from(err: serde_json::Error) -> Self {
        StashError::Serialization(err.to_string())
    }
}

/// Convenience result type used throughout the workspace.
pub type Result<T> = std::result::Result<T, StashError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StashError = io_err.into();
        assert!(matches!(err, StashError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{nope").unwrap_err();
        let err: StashError = json_err.into();
        assert!(matches!(err, StashError::Serialization(_)));
    }

    #[test]
    fn test_toml_error_conversion() {
        let toml_err = toml::from_str::<toml::Value>("not {{ toml").unwrap_err();
        let err: StashError = toml_err.into();
        assert!(matches!(err, StashError::Config(_)));
    }

    #[test]
    fn test_display_includes_context() {
        let err = StashError::Backend("kv table missing".to_string());
        assert_eq!(err.to_string(), "Backend error: kv table missing");
    }
}
