// Shared fakes for the integration tests
#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rocket_ws as ws;
use serde_json::Value;

use jukebox::config::Config;
use jukebox::error::{AppError, Result};
use jukebox::models::track::ResolvedTrack;
use jukebox::services::auth::TokenFileAuthenticator;
use jukebox::services::pipeline::{DecoderFactory, FrameEncoder, PcmSource};
use jukebox::services::providers::{Provider, ProviderRegistry};
use jukebox::services::sessions::SessionReceiver;
use jukebox::services::store::MemoryStore;
use jukebox::utils::probe::{Loudness, MediaInfo, Prober};
use jukebox::{Collaborators, Jukebox};

/// `fake:<name>` resolves to one track; names starting with `bad` fail to download.
pub struct FakeProvider;

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn prefixes(&self) -> &'static [&'static str] {
        &["fake"]
    }

    async fn resolve(&self, uri: &str) -> Result<Vec<ResolvedTrack>> {
        let name = uri.trim_start_matches("fake:");
        Ok(vec![ResolvedTrack::new("fake", name, uri)])
    }

    async fn acquire(&self, track: &ResolvedTrack, dest: &Path) -> Result<()> {
        if track.title.starts_with("bad") {
            return Err(AppError::Provider("download refused".to_string()));
        }
        tokio::fs::write(dest, track.title.as_bytes()).await?;
        Ok(())
    }
}

pub struct FixedProber;

#[async_trait]
impl Prober for FixedProber {
    async fn probe(&self, _path: &Path) -> MediaInfo {
        MediaInfo {
            duration: 1,
            loudness: Loudness { max_volume: -1.0, mean_volume: -12.0 },
        }
    }
}

struct ChunkSource {
    remaining: usize,
}

impl PcmSource for ChunkSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        buf.fill(0);
        true
    }
}

/// Every track decodes to the same number of chunks.
pub struct FakeDecoders {
    pub chunks: usize,
}

impl DecoderFactory for FakeDecoders {
    fn open(&self, _path: &Path, _gain_db: f64) -> Result<Box<dyn PcmSource>> {
        Ok(Box::new(ChunkSource { remaining: self.chunks }))
    }
}

pub struct TinyEncoder;

impl FrameEncoder for TinyEncoder {
    fn encode(&mut self, _pcm: &[u8]) -> Vec<u8> {
        vec![0xAB]
    }
}

pub struct Running {
    pub jukebox: Jukebox,
    pub cache: tempfile::TempDir,
}

pub fn start(chunks_per_track: usize) -> Running {
    let cache = tempfile::tempdir().unwrap();
    let config = Config {
        cache_dir: cache.path().to_path_buf(),
        store_endpoint: String::new(),
        ..Config::default()
    };

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(FakeProvider));

    let collaborators = Collaborators {
        providers,
        prober: Arc::new(FixedProber),
        decoders: Arc::new(FakeDecoders { chunks: chunks_per_track }),
        make_encoder: Box::new(|| -> Result<Box<dyn FrameEncoder>> { Ok(Box::new(TinyEncoder)) }),
        store: Arc::new(MemoryStore::new()),
        authenticator: Arc::new(TokenFileAuthenticator::from_tokens(vec![
            ("token-a".to_string(), "alice".to_string()),
            ("token-b".to_string(), "bob".to_string()),
        ])),
    };

    let jukebox = Jukebox::start(&config, collaborators).unwrap();
    Running { jukebox, cache }
}

pub fn op(key: &str, op: &str, data: Value) -> String {
    serde_json::json!({ "op": op, "key": key, "data": data }).to_string()
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Text messages a session received so far, parsed.
pub fn drain_events(rx: &mut SessionReceiver) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let ws::Message::Text(text) = message {
            if let Ok(value) = serde_json::from_str(&text) {
                out.push(value);
            }
        }
    }
    out
}
