// Wires the queue, player, pipeline and session fanout into one running service

use std::sync::Arc;
use std::time::Instant;

use log::info;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::{
    Config, DEQUEUE_WAIT, FRAME_CHANNEL_CAPACITY, OUTPUT_ATTENUATION, PREPARE_TIMEOUT,
    WS_PING_INTERVAL,
};
use crate::error::Result;
use crate::services::auth::{Authenticator, TokenFileAuthenticator};
use crate::services::control::ControlService;
use crate::services::dispatch::{run_dispatcher, run_keepalive, run_pipeline_pump};
use crate::services::pipeline::{
    check_ffmpeg, AudioPipeline, DecoderFactory, EncoderFactory, FfmpegDecoderFactory, FrameEncoder,
    OpusFrameEncoder,
};
use crate::services::player::Player;
use crate::services::preparer::Preparer;
use crate::services::providers::{LocalProvider, ProviderRegistry, YtdlProvider};
use crate::services::queue::PlaybackQueue;
use crate::services::sessions::SessionHub;
use crate::services::store::{HttpStore, MemoryStore, Store};
use crate::utils::probe::{FfmpegProber, Prober};

/// Everything the core talks to outside itself.
pub struct Collaborators {
    pub providers: ProviderRegistry,
    pub prober: Arc<dyn Prober>,
    pub decoders: Arc<dyn DecoderFactory>,
    pub make_encoder: EncoderFactory,
    pub store: Arc<dyn Store>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl Collaborators {
    /// Production wiring. Fails if ffmpeg is missing.
    pub fn from_config(config: &Config) -> Result<Self> {
        check_ffmpeg(&config.ffmpeg)?;

        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(LocalProvider::new()));
        providers.register(Arc::new(YtdlProvider::new(config.ytdl.clone())));

        let store: Arc<dyn Store> = if config.store_endpoint.is_empty() {
            info!("No store endpoint configured, keeping playlists in memory");
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(HttpStore::new(&config.store_endpoint)?)
        };

        Ok(Self {
            providers,
            prober: Arc::new(FfmpegProber::new(config.ffmpeg.clone(), config.ffprobe.clone())),
            decoders: Arc::new(FfmpegDecoderFactory::new(
                config.ffmpeg.clone(),
                OUTPUT_ATTENUATION,
            )),
            make_encoder: Box::new(|| -> Result<Box<dyn FrameEncoder>> {
                Ok(Box::new(OpusFrameEncoder::new()?))
            }),
            store,
            authenticator: Arc::new(TokenFileAuthenticator::load(&config.token_file)?),
        })
    }
}

pub struct Jukebox {
    pub hub: Arc<SessionHub>,
    pub player: Arc<Player>,
    pub queue: Arc<PlaybackQueue>,
    pub control: Arc<ControlService>,
    pub authenticator: Arc<dyn Authenticator>,
    started_at: Instant,
}

impl Jukebox {
    /// Build the service and spawn its background tasks. Needs a tokio runtime.
    pub fn start(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pipeline = Arc::new(AudioPipeline::start(
            collaborators.decoders,
            collaborators.make_encoder,
            frames_tx,
            events_tx,
        )?);

        let providers = Arc::new(collaborators.providers);
        let preparer = Arc::new(Preparer::new(
            providers.clone(),
            collaborators.prober,
            config.cache_dir.clone(),
            PREPARE_TIMEOUT,
            config.prepare_workers,
        ));

        let queue = PlaybackQueue::new(preparer, notify_tx.clone(), DEQUEUE_WAIT);
        let player = Player::new(queue.clone(), pipeline, notify_tx.clone());
        let hub = Arc::new(SessionHub::new());
        let control = Arc::new(ControlService::new(
            player.clone(),
            queue.clone(),
            providers,
            collaborators.store.clone(),
            notify_tx,
        ));

        tokio::spawn(run_dispatcher(notify_rx, hub.clone(), collaborators.store));
        tokio::spawn(run_pipeline_pump(frames_rx, events_rx, hub.clone(), player.clone()));
        tokio::spawn(run_keepalive(hub.clone(), WS_PING_INTERVAL));

        info!("Jukebox started, caching media in {}", config.cache_dir.display());
        Ok(Self {
            hub,
            player,
            queue,
            control,
            authenticator: collaborators.authenticator,
            started_at: Instant::now(),
        })
    }

    pub async fn status(&self) -> Value {
        json!({
            "status": "ok",
            "state": self.player.state().await,
            "queue_length": self.queue.len().await,
            "control_sessions": self.hub.control_count(),
            "audio_sessions": self.hub.audio_count(),
            "play_attempts": self.player.play_attempts(),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "server_time": chrono::Local::now().to_rfc3339(),
        })
    }
}
