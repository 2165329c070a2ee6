use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;

use crate::error::{AppError, Result};
use crate::models::track::ResolvedTrack;
use crate::services::providers::Provider;

/// Files already on this machine, addressed as `file:/path/to/track`.
#[derive(Default)]
pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }

    fn path_of(uri: &str) -> Result<PathBuf> {
        let path = uri
            .strip_prefix("file://")
            .or_else(|| uri.strip_prefix("file:"))
            .ok_or_else(|| AppError::Provider(format!("not a file uri: {}", uri)))?;
        Ok(PathBuf::from(path))
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn prefixes(&self) -> &'static [&'static str] {
        &["file"]
    }

    async fn resolve(&self, uri: &str) -> Result<Vec<ResolvedTrack>> {
        let path = Self::path_of(uri)?;
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(AppError::Provider(format!("{} is not a file", path.display())));
        }

        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| uri.to_string());
        Ok(vec![ResolvedTrack::new(self.name(), &title, uri)])
    }

    async fn acquire(&self, track: &ResolvedTrack, dest: &Path) -> Result<()> {
        let source = Self::path_of(&track.uri)?;
        let copied = tokio::fs::copy(&source, dest).await?;
        debug!("Copied {} bytes from {}", copied, source.display());
        Ok(())
    }
}
