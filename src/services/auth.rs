use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::Deserialize;

use crate::error::{AppError, Result};

/// Maps a connection token to the identity that owns it.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<String>;
}

#[derive(Debug, Default, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: HashMap<String, String>,
}

/// Tokens read once from `{"tokens": {"<token>": "<identity>"}}`.
#[derive(Debug, Default)]
pub struct TokenFileAuthenticator {
    tokens: HashMap<String, String>,
}

impl TokenFileAuthenticator {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Token file {} not found, every connection will be refused", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let file: TokenFile = serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;

        info!("Loaded {} tokens from {}", file.tokens.len(), path.display());
        Ok(Self { tokens: file.tokens })
    }

    pub fn from_tokens<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl Authenticator for TokenFileAuthenticator {
    fn authenticate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn reads_token_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tokens": {{"t0k3n": "alice"}}}}"#).unwrap();

        let auth = TokenFileAuthenticator::load(file.path()).unwrap();
        assert_eq!(auth.authenticate("t0k3n").as_deref(), Some("alice"));
        assert_eq!(auth.authenticate("other"), None);
    }

    #[test]
    fn missing_file_refuses_everyone() {
        let auth = TokenFileAuthenticator::load(Path::new("/nonexistent/tokens.json")).unwrap();
        assert_eq!(auth.authenticate("anything"), None);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(TokenFileAuthenticator::load(file.path()), Err(AppError::Config(_))));
    }
}
