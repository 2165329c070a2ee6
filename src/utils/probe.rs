use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{info, warn};
use tokio::process::Command;

use crate::config::PROBE_TIMEOUT;

/// Peak and mean level of a file in dBFS, as reported by ffmpeg's volumedetect.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Loudness {
    pub max_volume: f64,
    pub mean_volume: f64,
}

impl Loudness {
    /// Gain that brings the peak to 0 dBFS.
    pub fn gain_db(&self) -> f64 {
        -self.max_volume
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MediaInfo {
    pub duration: u64,
    pub loudness: Loudness,
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Measure a local file. Failures degrade to zero duration / zero gain.
    async fn probe(&self, path: &Path) -> MediaInfo;
}

pub struct FfmpegProber {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegProber {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    async fn duration(&self, path: &Path) -> Option<u64> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(PROBE_TIMEOUT, output).await {
            Ok(Ok(out)) if out.status.success() => {
                parse_duration(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(Ok(out)) => {
                warn!("ffprobe exited with {} for {}", out.status, path.display());
                None
            }
            Ok(Err(e)) => {
                warn!("Failed to run ffprobe: {}", e);
                None
            }
            Err(_) => {
                warn!("ffprobe timed out on {}", path.display());
                None
            }
        }
    }

    async fn loudness(&self, path: &Path) -> Option<Loudness> {
        // volumedetect reports on stderr
        let output = Command::new(&self.ffmpeg)
            .args(["-nostdin", "-hide_banner", "-i"])
            .arg(path)
            .args(["-vn", "-af", "volumedetect", "-f", "null", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(PROBE_TIMEOUT, output).await {
            Ok(Ok(out)) => parse_volumedetect(&String::from_utf8_lossy(&out.stderr)),
            Ok(Err(e)) => {
                warn!("Failed to run ffmpeg volumedetect: {}", e);
                None
            }
            Err(_) => {
                warn!("volumedetect timed out on {}", path.display());
                None
            }
        }
    }
}

#[async_trait]
impl Prober for FfmpegProber {
    async fn probe(&self, path: &Path) -> MediaInfo {
        let (duration, loudness) = tokio::join!(self.duration(path), self.loudness(path));
        let info = MediaInfo {
            duration: duration.unwrap_or(0),
            loudness: loudness.unwrap_or_default(),
        };
        info!(
            "Probed {}: {}s, max {:.1} dB, mean {:.1} dB",
            path.display(),
            info.duration,
            info.loudness.max_volume,
            info.loudness.mean_volume
        );
        info
    }
}

/// Parse ffprobe's bare `format=duration` output (fractional seconds).
pub fn parse_duration(stdout: &str) -> Option<u64> {
    let seconds: f64 = stdout.trim().parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some(seconds as u64)
    } else {
        None
    }
}

/// Pull `max_volume` and `mean_volume` out of volumedetect's log lines.
pub fn parse_volumedetect(stderr: &str) -> Option<Loudness> {
    let level = |name: &str| -> Option<f64> {
        let line = stderr.lines().find(|l| l.contains(name))?;
        let value = line.split(name).nth(1)?.trim().trim_start_matches(':').trim();
        value.split_whitespace().next()?.parse().ok()
    };

    Some(Loudness {
        max_volume: level("max_volume")?,
        mean_volume: level("mean_volume")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_truncates_fraction() {
        assert_eq!(parse_duration("215.353469\n"), Some(215));
        assert_eq!(parse_duration("N/A"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn volumedetect_lines_are_parsed() {
        let stderr = "\
[Parsed_volumedetect_0 @ 0x55d0c8a3c2c0] n_samples: 20671488
[Parsed_volumedetect_0 @ 0x55d0c8a3c2c0] mean_volume: -14.2 dB
[Parsed_volumedetect_0 @ 0x55d0c8a3c2c0] max_volume: -1.5 dB
[Parsed_volumedetect_0 @ 0x55d0c8a3c2c0] histogram_1db: 12";

        let loudness = parse_volumedetect(stderr).unwrap();
        assert_eq!(loudness.max_volume, -1.5);
        assert_eq!(loudness.mean_volume, -14.2);
        assert_eq!(loudness.gain_db(), 1.5);
    }

    #[test]
    fn volumedetect_missing_is_none() {
        assert!(parse_volumedetect("Output file is empty, nothing was encoded").is_none());
    }
}
