use serde::{Deserialize, Serialize};

/// A track as produced by a provider's resolver. Read-only to the player core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTrack {
    pub source: String,
    pub title: String,
    pub uri: String,
    #[serde(default)]
    pub thumbnail: String,
    #[serde(default)]
    pub thumbnail_small: String,
    // Provider-specific metadata, passed through to clients untouched
    #[serde(default)]
    pub entry: Option<serde_json::Value>,
}

impl ResolvedTrack {
    pub fn new(source: &str, title: &str, uri: &str) -> Self {
        Self {
            source: source.to_string(),
            title: title.to_string(),
            uri: uri.to_string(),
            thumbnail: String::new(),
            thumbnail_small: String::new(),
            entry: None,
        }
    }
}

/// What clients see for a queued or playing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryOverview {
    #[serde(flatten)]
    pub track: ResolvedTrack,
    #[serde(default)]
    pub duration: u64,
}
