use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use tokio::process::Command;

use crate::config::{PREPARE_TIMEOUT, RESOLVE_TIMEOUT};
use crate::error::{AppError, Result};
use crate::models::track::ResolvedTrack;
use crate::services::providers::Provider;
use crate::utils::keys::sanitize;

/// Anything yt-dlp can extract, addressed by its web URL.
pub struct YtdlProvider {
    binary: PathBuf,
}

impl YtdlProvider {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl Provider for YtdlProvider {
    fn name(&self) -> &'static str {
        "ytdl"
    }

    fn prefixes(&self) -> &'static [&'static str] {
        &["http", "https"]
    }

    async fn resolve(&self, uri: &str) -> Result<Vec<ResolvedTrack>> {
        let output = Command::new(&self.binary)
            .args(["--dump-single-json", "--no-warnings", "--"])
            .arg(uri)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(RESOLVE_TIMEOUT, output)
            .await
            .map_err(|_| AppError::Timeout("yt-dlp resolve"))??;

        if !output.status.success() {
            return Err(AppError::Provider(format!("yt-dlp exited with {}", output.status)));
        }

        let info: Value = serde_json::from_slice(&output.stdout)?;
        Ok(parse_ytdl_info(&info))
    }

    fn cache_name(&self, track: &ResolvedTrack) -> String {
        let id = track.entry.as_ref().and_then(|e| {
            let extractor = e.get("extractor")?.as_str()?;
            let id = e.get("id")?.as_str()?;
            Some(format!("{}-{}", extractor, id))
        });
        format!("{}-{}.audio", self.name(), sanitize(id.as_deref().unwrap_or(&track.uri)))
    }

    async fn acquire(&self, track: &ResolvedTrack, dest: &Path) -> Result<()> {
        let status = Command::new(&self.binary)
            .args(["-f", "bestaudio/best", "--no-playlist", "--quiet", "--no-part", "-o"])
            .arg(dest)
            .arg("--")
            .arg(&track.uri)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        let status = tokio::time::timeout(PREPARE_TIMEOUT, status)
            .await
            .map_err(|_| AppError::Timeout("yt-dlp download"))??;

        if !status.success() {
            return Err(AppError::Provider(format!("yt-dlp download exited with {}", status)));
        }
        debug!("Downloaded {} to {}", track.uri, dest.display());
        Ok(())
    }
}

fn is_live(info: &Value) -> bool {
    info.get("is_live").and_then(Value::as_bool).unwrap_or(false)
}

fn text(info: &Value, key: &str) -> String {
    info.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn track_from(source: &str, info: &Value) -> ResolvedTrack {
    let mut track = ResolvedTrack::new(source, &text(info, "title"), &text(info, "webpage_url"));
    track.thumbnail = text(info, "thumbnail");
    track.thumbnail_small = track.thumbnail.clone();
    track.entry = Some(serde_json::json!({
        "extractor": text(info, "extractor"),
        "id": text(info, "id"),
        "duration": info.get("duration").cloned().unwrap_or(Value::Null),
    }));
    track
}

/// Turn yt-dlp's single-json output into tracks. Playlists expand into their
/// entries, live streams are skipped.
pub fn parse_ytdl_info(info: &Value) -> Vec<ResolvedTrack> {
    // "youtube:tab" -> "youtube"
    let extractor = text(info, "extractor");
    let source = extractor.split(':').next().unwrap_or_default().to_string();

    let tracks: Vec<ResolvedTrack> = match info.get("entries").and_then(Value::as_array) {
        Some(entries) => entries
            .iter()
            .filter(|e| !is_live(e))
            .map(|e| track_from(&source, e))
            .collect(),
        None if is_live(info) => Vec::new(),
        None => vec![track_from(&source, info)],
    };

    let usable: Vec<ResolvedTrack> = tracks.into_iter().filter(|t| !t.uri.is_empty()).collect();
    if usable.is_empty() {
        warn!("yt-dlp returned no playable entries for extractor {}", extractor);
    }
    usable
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn single_video_becomes_one_track() {
        let info = json!({
            "extractor": "youtube",
            "id": "dQw4w9WgXcQ",
            "title": "Never Gonna Give You Up",
            "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "thumbnail": "https://i.ytimg.com/vi/dQw4w9WgXcQ/hq.jpg"
        });

        let tracks = parse_ytdl_info(&info);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].source, "youtube");
        assert_eq!(tracks[0].title, "Never Gonna Give You Up");
        assert_eq!(
            YtdlProvider::new("yt-dlp".into()).cache_name(&tracks[0]),
            "ytdl-youtube-dQw4w9WgXcQ.audio"
        );
    }

    #[test]
    fn playlist_skips_live_entries() {
        let info = json!({
            "extractor": "youtube:tab",
            "entries": [
                {"id": "a", "title": "A", "webpage_url": "https://y/a", "extractor": "youtube"},
                {"id": "b", "title": "B", "webpage_url": "https://y/b", "is_live": true},
                {"id": "c", "title": "C", "webpage_url": "https://y/c", "extractor": "youtube"}
            ]
        });

        let titles: Vec<String> = parse_ytdl_info(&info).into_iter().map(|t| t.title).collect();
        assert_eq!(titles, vec!["A", "C"]);
    }

    #[test]
    fn live_stream_yields_nothing() {
        let info = json!({"extractor": "twitch", "is_live": true, "webpage_url": "https://t/x"});
        assert!(parse_ytdl_info(&info).is_empty());
    }
}
