use serde::{Deserialize, Serialize};

/// Logical file-store root.
///
/// `Durable` maps to the platform's backed-up app-data area and is not
/// purged under storage pressure. `Cache` maps to the purgeable cache area,
/// is excluded from backups, and is swept after the retention window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageRoot {
    /// Survives backup/restore, never evicted by the sweep.
    Durable,
    /// Ephemeral, first evicted, excluded from backups.
    Cache,
}

impl StorageRoot {
    /// Stable string form used in URIs and database rows.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageRoot::Durable => "durable",
            StorageRoot::Cache => "cache",
        }
    }
}

/// A file payload, either text or raw bytes.
///
/// Backends that only track bytes may hand back a `Text` variant for
/// UTF-8 content; equality is therefore byte-wise, so a payload written as
/// `Bytes(b"hi")` and read back as `Text("hi")` still compares equal. The
/// caller never has to know which encoding path the backend took.
#[derive(Clone, Debug)]
pub enum FileData {
    /// UTF-8 text content.
    Text(String),
    /// Raw binary content.
    Bytes(Vec<u8>),
}

impl FileData {
    /// The payload as bytes, regardless of variant.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileData::Text(s) => s.as_bytes(),
            FileData::Bytes(b) => b,
        }
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FileData::Text(s) => Some(s),
            FileData::Bytes(b) => std::str::from_utf8(b).ok(),
        }
    }

    /// True when the payload was produced from a text write.
    pub fn is_text(&self) -> bool {
        matches!(self, FileData::Text(_))
    }

    /// Consume the payload, yielding its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            FileData::Text(s) => s.into_bytes(),
            FileData::Bytes(b) => b,
        }
    }
}

impl PartialEq for FileData {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for FileData {}

impl From<&str> for FileData {
    fn from(s: &str) -> Self {
        FileData::Text(s.to_string())
    }
}

impl From<String> for FileData {
    fn from(s: String) -> Self {
        FileData::Text(s)
    }
}

impl From<Vec<u8>> for FileData {
    fn from(b: Vec<u8>) -> Self {
        FileData::Bytes(b)
    }
}

impl From<&[u8]> for FileData {
    fn from(b: &[u8]) -> Self {
        FileData::Bytes(b.to_vec())
    }
}

/// Which kind of backend a secret store was constructed over.
///
/// Exposed so callers (and tests) can observe the security/durability
/// degradation: `Session` secrets do not survive the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretBackendKind {
    /// OS-managed credential store (keychain / credential manager / libsecret).
    OsKeyring,
    /// In-memory map cleared at process exit. Prefer losing the secret to
    /// leaking it: this is the fallback when no OS store is available.
    Session,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_as_str() {
        assert_eq!(StorageRoot::Durable.as_str(), "durable");
        assert_eq!(StorageRoot::Cache.as_str(), "cache");
    }

    #[test]
    fn test_file_data_bytewise_equality() {
        let text = FileData::Text("hello".to_string());
        let bytes = FileData::Bytes(b"hello".to_vec());
        assert_eq!(text, bytes);
        assert_ne!(text, FileData::Text("other".to_string()));
    }

    #[test]
    fn test_file_data_text_accessor() {
        let bytes = FileData::Bytes(vec![0xff, 0xfe]);
        assert!(bytes.as_text().is_none());
        assert_eq!(FileData::Bytes(b"ok".to_vec()).as_text(), Some("ok"));
    }

    #[test]
    fn test_file_data_into_bytes() {
        assert_eq!(FileData::Text("ab".to_string()).into_bytes(), b"ab");
        assert_eq!(FileData::Bytes(vec![1, 2]).into_bytes(), vec![1, 2]);
    }

    #[test]
    fn test_root_serde_snake_case() {
        let json = serde_json::to_string(&StorageRoot::Durable).unwrap();
        assert_eq!(json, "\"durable\"");
        let back: StorageRoot = serde_json::from_str("\"cache\"").unwrap();
        assert_eq!(back, StorageRoot::Cache);
    }
}
