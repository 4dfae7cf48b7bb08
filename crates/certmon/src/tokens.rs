//! Authentication material for issuance calls.
//!
//! The monitor only ever reads from the store, once per issuance attempt, so
//! a token rotated between attempts is picked up by the next one.

use std::path::PathBuf;

use parking_lot::RwLock;
use tracing::{debug, warn};

/// Read-only view of the agent's current authentication token
pub trait TokenStore: Send + Sync {
    /// Current agent token, if one is configured
    fn agent_token(&self) -> Option<String>;
}

/// Token store holding a single in-memory token
#[derive(Debug, Default)]
pub struct StaticTokenStore {
    token: RwLock<Option<String>>,
}

impl StaticTokenStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    /// Replace the token used by subsequent issuance attempts
    pub fn update(&self, token: Option<String>) {
        debug!(has_token = token.is_some(), "Updating agent token");
        *self.token.write() = token;
    }
}

impl TokenStore for StaticTokenStore {
    fn agent_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

/// Token store that reads a file on every access, so rotating the file
/// rotates the token
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn agent_token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(token) => {
                let token = token.trim();
                (!token.is_empty()).then(|| token.to_string())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read agent token file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_token_store_rereads_file() {
        let file = NamedTempFile::new().unwrap();
        let store = FileTokenStore::new(file.path());
        assert_eq!(store.agent_token(), None);

        std::fs::write(file.path(), "first\n").unwrap();
        assert_eq!(store.agent_token().as_deref(), Some("first"));

        std::fs::write(file.path(), "second").unwrap();
        assert_eq!(store.agent_token().as_deref(), Some("second"));
    }

    #[test]
    fn test_file_token_store_missing_file() {
        let store = FileTokenStore::new("/nonexistent/token");
        assert_eq!(store.agent_token(), None);
    }

    #[test]
    fn test_static_token_store_update() {
        let store = StaticTokenStore::new(None);
        assert_eq!(store.agent_token(), None);

        store.update(Some("s3cr3t".to_string()));
        assert_eq!(store.agent_token().as_deref(), Some("s3cr3t"));

        store.update(None);
        assert_eq!(store.agent_token(), None);
    }
}
