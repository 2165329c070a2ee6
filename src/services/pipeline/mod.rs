// Real-time audio delivery: decode -> encode -> paced frame output on its own thread

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{FRAME_BYTES, FRAME_DURATION, FRAME_LOG_INTERVAL};
use crate::error::{AppError, Result};

pub mod decoder;
pub mod encoder;

pub use decoder::{check_ffmpeg, DecoderFactory, FfmpegDecoderFactory, PcmSource};
pub use encoder::{FrameEncoder, OpusFrameEncoder};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineCommand {
    Play { entry: Uuid, path: PathBuf, gain_db: f64 },
    Pause,
    Resume,
    Stop,
    Shutdown,
}

/// Sent from the delivery thread back to the async side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    TrackFinished(Uuid),
}

/// What the player drives. Calls never block on audio work.
pub trait AudioOutput: Send + Sync {
    fn play(&self, entry: Uuid, path: &Path, gain_db: f64);
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
}

// Built on the delivery thread so the encoder never has to cross threads
pub type EncoderFactory = Box<dyn FnOnce() -> Result<Box<dyn FrameEncoder>> + Send>;

pub struct AudioPipeline {
    commands: Sender<PipelineCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AudioPipeline {
    /// Spawn the delivery thread. Fails if the encoder cannot be built.
    pub fn start(
        decoders: Arc<dyn DecoderFactory>,
        make_encoder: EncoderFactory,
        frames: mpsc::Sender<Bytes>,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Result<Self> {
        let (commands, command_rx) = channel::unbounded();
        let (ready_tx, ready_rx) = channel::bounded::<Result<()>>(1);

        let handle = thread::Builder::new()
            .name("audio-delivery".to_string())
            .spawn(move || {
                let encoder = match make_encoder() {
                    Ok(encoder) => encoder,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                DeliveryLoop::new(command_rx, decoders, encoder, frames, events).run();
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Audio pipeline started");
                Ok(Self {
                    commands,
                    thread: Mutex::new(Some(handle)),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AppError::Codec("delivery thread exited during startup".to_string()))
            }
        }
    }

    fn send(&self, command: PipelineCommand) {
        if let Err(e) = self.commands.send(command) {
            error!("Audio pipeline is gone, dropping {:?}", e.into_inner());
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.thread.lock().take() {
            let _ = self.commands.send(PipelineCommand::Shutdown);
            if handle.join().is_err() {
                error!("Audio delivery thread panicked");
            }
            info!("Audio pipeline stopped");
        }
    }
}

impl AudioOutput for AudioPipeline {
    fn play(&self, entry: Uuid, path: &Path, gain_db: f64) {
        self.send(PipelineCommand::Play {
            entry,
            path: path.to_path_buf(),
            gain_db,
        });
    }

    fn pause(&self) {
        self.send(PipelineCommand::Pause);
    }

    fn resume(&self) {
        self.send(PipelineCommand::Resume);
    }

    fn stop(&self) {
        self.send(PipelineCommand::Stop);
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct DeliveryLoop {
    commands: Receiver<PipelineCommand>,
    decoders: Arc<dyn DecoderFactory>,
    encoder: Box<dyn FrameEncoder>,
    frames: mpsc::Sender<Bytes>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    current: Option<(Uuid, Box<dyn PcmSource>)>,
    paused: bool,
    next_tick: Instant,
    chunk: Vec<u8>,
    frames_sent: u64,
    frames_dropped: u64,
}

impl DeliveryLoop {
    fn new(
        commands: Receiver<PipelineCommand>,
        decoders: Arc<dyn DecoderFactory>,
        encoder: Box<dyn FrameEncoder>,
        frames: mpsc::Sender<Bytes>,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        Self {
            commands,
            decoders,
            encoder,
            frames,
            events,
            current: None,
            paused: false,
            next_tick: Instant::now(),
            chunk: vec![0; FRAME_BYTES],
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    fn run(mut self) {
        info!("Audio delivery thread running");

        loop {
            if self.current.is_none() {
                // Idle until told to play
                match self.commands.recv() {
                    Ok(command) => {
                        if !self.apply(command) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
                continue;
            }

            if !self.drain_commands() {
                break;
            }
            if self.current.is_some() && !self.tick() {
                warn!("Frame consumer is gone, stopping delivery");
                break;
            }
        }

        self.current = None;
        info!(
            "Audio delivery thread exiting ({} frames sent, {} dropped)",
            self.frames_sent, self.frames_dropped
        );
    }

    // false on shutdown
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if !self.apply(command) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn apply(&mut self, command: PipelineCommand) -> bool {
        match command {
            PipelineCommand::Play { entry, path, gain_db } => {
                // Kills the previous decoder
                self.current = None;
                self.paused = false;

                match self.decoders.open(&path, gain_db) {
                    Ok(source) => {
                        info!("Delivering {} ({:+.2} dB)", path.display(), gain_db);
                        self.current = Some((entry, source));
                        self.next_tick = Instant::now();
                    }
                    Err(e) => {
                        error!("Failed to start decoder for {}: {}", path.display(), e);
                        self.finish(entry);
                    }
                }
            }
            PipelineCommand::Pause => {
                if self.current.is_some() {
                    self.paused = true;
                    debug!("Delivery paused");
                }
            }
            PipelineCommand::Resume => {
                if self.paused {
                    self.paused = false;
                    debug!("Delivery resumed");
                }
            }
            PipelineCommand::Stop => {
                if self.current.take().is_some() {
                    debug!("Delivery stopped");
                }
                self.paused = false;
            }
            PipelineCommand::Shutdown => return false,
        }
        true
    }

    fn finish(&mut self, entry: Uuid) {
        self.current = None;
        self.paused = false;
        if self.events.send(PipelineEvent::TrackFinished(entry)).is_err() {
            warn!("Track finished but nobody is listening");
        }
    }

    // false once nobody is left to take frames
    fn tick(&mut self) -> bool {
        self.next_tick += FRAME_DURATION;

        // Paused ticks produce nothing; the decoder is left running
        if !self.paused {
            let (entry, source) = match self.current.as_mut() {
                Some((entry, source)) => (*entry, source),
                None => return true,
            };

            if !source.read_chunk(&mut self.chunk) {
                debug!("Decoder drained for {}", entry);
                self.finish(entry);
                return true;
            }

            let frame = self.encoder.encode(&self.chunk);
            if !frame.is_empty() {
                match self.frames.try_send(Bytes::from(frame)) {
                    Ok(()) => self.frames_sent += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => self.frames_dropped += 1,
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }

                if (self.frames_sent + self.frames_dropped) % FRAME_LOG_INTERVAL == 0 {
                    info!(
                        "Delivery: {} frames sent, {} dropped",
                        self.frames_sent, self.frames_dropped
                    );
                }
            }
        }

        let now = Instant::now();
        if self.next_tick > now {
            thread::sleep(self.next_tick - now);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    struct CountedSource {
        remaining: usize,
    }

    impl PcmSource for CountedSource {
        fn read_chunk(&mut self, buf: &mut [u8]) -> bool {
            if self.remaining == 0 {
                return false;
            }
            self.remaining -= 1;
            buf.fill(1);
            true
        }
    }

    struct FakeDecoders {
        chunks: usize,
    }

    impl DecoderFactory for FakeDecoders {
        fn open(&self, path: &Path, _gain_db: f64) -> Result<Box<dyn PcmSource>> {
            if path.ends_with("broken") {
                return Err(AppError::Codec("cannot open".to_string()));
            }
            Ok(Box::new(CountedSource { remaining: self.chunks }))
        }
    }

    // Emits the chunk length as a tiny frame, or nothing every third call
    struct FakeEncoder {
        calls: usize,
        skip_every: usize,
    }

    impl FrameEncoder for FakeEncoder {
        fn encode(&mut self, pcm: &[u8]) -> Vec<u8> {
            self.calls += 1;
            if self.skip_every > 0 && self.calls % self.skip_every == 0 {
                return Vec::new();
            }
            vec![pcm.len() as u8]
        }
    }

    fn start(
        chunks: usize,
        skip_every: usize,
    ) -> (AudioPipeline, mpsc::Receiver<Bytes>, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (frames_tx, frames_rx) = mpsc::channel(1000);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pipeline = AudioPipeline::start(
            Arc::new(FakeDecoders { chunks }),
            Box::new(move || -> Result<Box<dyn FrameEncoder>> {
                Ok(Box::new(FakeEncoder { calls: 0, skip_every }))
            }),
            frames_tx,
            events_tx,
        )
        .unwrap();
        (pipeline, frames_rx, events_rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn plays_to_end_at_frame_cadence() {
        let (pipeline, mut frames, mut events) = start(10, 0);
        let entry = Uuid::new_v4();
        let started = Instant::now();

        pipeline.play(entry, Path::new("/cache/a.audio"), 0.0);
        assert_eq!(events.blocking_recv(), Some(PipelineEvent::TrackFinished(entry)));

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(drain(&mut frames), 10);
    }

    #[test]
    fn empty_frames_are_not_sent() {
        let (pipeline, mut frames, mut events) = start(9, 3);
        let entry = Uuid::new_v4();

        pipeline.play(entry, Path::new("/cache/a.audio"), 0.0);
        assert_eq!(events.blocking_recv(), Some(PipelineEvent::TrackFinished(entry)));
        assert_eq!(drain(&mut frames), 6);
    }

    #[test]
    fn decoder_failure_finishes_immediately() {
        let (pipeline, mut frames, mut events) = start(10, 0);
        let entry = Uuid::new_v4();

        pipeline.play(entry, Path::new("/cache/broken"), 0.0);
        assert_eq!(events.blocking_recv(), Some(PipelineEvent::TrackFinished(entry)));
        assert_eq!(drain(&mut frames), 0);
    }

    #[test]
    fn pause_withholds_frames_until_resume() {
        let (pipeline, mut frames, _events) = start(10_000, 0);
        pipeline.play(Uuid::new_v4(), Path::new("/cache/long.audio"), 0.0);
        assert!(frames.blocking_recv().is_some());

        pipeline.pause();
        thread::sleep(Duration::from_millis(100));
        drain(&mut frames);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(drain(&mut frames), 0);

        pipeline.resume();
        assert!(frames.blocking_recv().is_some());
    }

    #[test]
    fn stop_does_not_report_finish() {
        let (pipeline, _frames, mut events) = start(10_000, 0);
        pipeline.play(Uuid::new_v4(), Path::new("/cache/long.audio"), 0.0);
        pipeline.stop();
        thread::sleep(Duration::from_millis(60));

        assert!(events.try_recv().is_err());
    }

    #[test]
    fn closed_frame_consumer_stops_the_thread() {
        let (pipeline, frames, mut events) = start(10_000, 0);
        drop(frames);

        pipeline.play(Uuid::new_v4(), Path::new("/cache/long.audio"), 0.0);
        // The loop exits without a finish signal, dropping its event sender
        assert_eq!(events.blocking_recv(), None);
    }

    #[test]
    fn encoder_failure_aborts_start() {
        let (frames_tx, _frames_rx) = mpsc::channel(10);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let result = AudioPipeline::start(
            Arc::new(FakeDecoders { chunks: 1 }),
            Box::new(|| -> Result<Box<dyn FrameEncoder>> {
                Err(AppError::Codec("no opus".to_string()))
            }),
            frames_tx,
            events_tx,
        );
        assert!(matches!(result, Err(AppError::Codec(_))));
    }
}
