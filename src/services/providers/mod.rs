use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};

use crate::error::{AppError, Result};
use crate::models::track::ResolvedTrack;
use crate::utils::keys::sanitize;

pub mod local;
pub mod ytdl;

pub use local::LocalProvider;
pub use ytdl::YtdlProvider;

/// A source of tracks, selected by URI prefix.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    fn prefixes(&self) -> &'static [&'static str];

    async fn resolve(&self, uri: &str) -> Result<Vec<ResolvedTrack>>;

    // Deterministic, so an existing cache file can be reused
    fn cache_name(&self, track: &ResolvedTrack) -> String {
        format!("{}-{}.audio", self.name(), sanitize(&track.uri))
    }

    /// Make the track's media available at `dest`.
    async fn acquire(&self, track: &ResolvedTrack, dest: &Path) -> Result<()>;
}

/// Text before the first `:`, e.g. `https` or `file`.
pub fn uri_prefix(uri: &str) -> Option<&str> {
    uri.split_once(':').map(|(prefix, _)| prefix).filter(|p| !p.is_empty())
}

/// Prefix -> provider table, built once at startup.
#[derive(Default)]
pub struct ProviderRegistry {
    by_prefix: HashMap<&'static str, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        for prefix in provider.prefixes().iter().copied() {
            if let Some(previous) = self.by_prefix.insert(prefix, Arc::clone(&provider)) {
                warn!("Prefix '{}' moved from {} to {}", prefix, previous.name(), provider.name());
            }
        }
        info!("Registered provider {} for {:?}", provider.name(), provider.prefixes());
    }

    pub fn for_uri(&self, uri: &str) -> Result<Arc<dyn Provider>> {
        uri_prefix(uri)
            .and_then(|prefix| self.by_prefix.get(prefix))
            .cloned()
            .ok_or_else(|| AppError::Provider(format!("no provider for {}", uri)))
    }

    /// Resolve a client-supplied URI. Failures are logged and yield nothing.
    pub async fn resolve(&self, uri: &str) -> Vec<ResolvedTrack> {
        let provider = match self.for_uri(uri) {
            Ok(provider) => provider,
            Err(e) => {
                warn!("{}", e);
                return Vec::new();
            }
        };

        match provider.resolve(uri).await {
            Ok(tracks) => {
                info!("{} resolved {} into {} tracks", provider.name(), uri, tracks.len());
                tracks
            }
            Err(e) => {
                error!("{} failed to resolve {}: {}", provider.name(), uri, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_text_before_colon() {
        assert_eq!(uri_prefix("https://example.com/watch?v=1"), Some("https"));
        assert_eq!(uri_prefix("file:/music/a.flac"), Some("file"));
        assert_eq!(uri_prefix("no-colon"), None);
        assert_eq!(uri_prefix(":empty"), None);
    }

    #[tokio::test]
    async fn registry_routes_by_prefix() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(LocalProvider::new()));
        registry.register(Arc::new(YtdlProvider::new("yt-dlp".into())));

        assert_eq!(registry.for_uri("file:/a.mp3").unwrap().name(), "local");
        assert_eq!(registry.for_uri("http://x/y").unwrap().name(), "ytdl");
        assert!(registry.for_uri("gopher://x").is_err());
        assert!(registry.resolve("gopher://x").await.is_empty());
    }
}
