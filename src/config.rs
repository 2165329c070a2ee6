use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use log::{info, warn};
use serde::Deserialize;

use crate::error::{AppError, Result};

lazy_static! {
    // Base directory
    pub static ref BASE_DIR: PathBuf = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    // Config file, overridable through JUKEBOX_CONFIG
    pub static ref CONFIG_FILE: PathBuf = env::var_os("JUKEBOX_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| BASE_DIR.join("config").join("config.json"));

    // Downloaded/transcoded media
    pub static ref CACHE_DIR: PathBuf = BASE_DIR.join("caches");

    // Token -> identity table
    pub static ref TOKEN_FILE: PathBuf = BASE_DIR.join("config").join("tokens.json");
}

// Queue and preparation timing
pub const DEQUEUE_WAIT: Duration = Duration::from_secs(10);
pub const PREPARE_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(20);
pub const REPEAT_CAP: usize = 100;

// Session handling
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const SESSION_KEY_LENGTH: usize = 40;

// Decoded PCM: 48 kHz, stereo, signed 16-bit little endian
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * 20; // per channel
pub const FRAME_BYTES: usize = FRAME_SAMPLES * CHANNELS * 2;

// Opus output
pub const OPUS_BITRATE: i32 = 128_000;
pub const MAX_OPUS_PACKET: usize = 4000;

// Loudness normalization applied on top of the measured peak
pub const OUTPUT_ATTENUATION: f64 = 0.25;

// Delivery thread -> async pump capacity (~2 s of frames)
pub const FRAME_CHANNEL_CAPACITY: usize = 100;

// Frames buffered per listener before new ones are dropped (~1 s)
pub const AUDIO_SESSION_BUFFER: usize = 50;

// Log a delivery summary every N frames
pub const FRAME_LOG_INTERVAL: u64 = 3000;

/// Runtime configuration, read from a JSON file. Every field has a default so a
/// missing file still yields a usable local setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub cache_dir: PathBuf,
    pub token_file: PathBuf,
    pub store_endpoint: String,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub ytdl: PathBuf,
    pub prepare_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8000,
            cache_dir: CACHE_DIR.clone(),
            token_file: TOKEN_FILE.clone(),
            store_endpoint: "http://dbapp:8080".to_string(),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            ytdl: PathBuf::from("yt-dlp"),
            prepare_workers: 4,
        }
    }
}

impl Config {
    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::from_file(&CONFIG_FILE)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;

        if config.prepare_workers == 0 {
            return Err(AppError::Config("prepare_workers must be at least 1".to_string()));
        }

        info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
