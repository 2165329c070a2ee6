use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::REPEAT_CAP;
use crate::models::events::{Notification, NotificationSender, PlayerSnapshot, PlayerState};
use crate::services::pipeline::AudioOutput;
use crate::services::queue::{PlaybackQueue, QueueEntry};

struct PlayerInner {
    state: PlayerState,
    current: Option<Arc<QueueEntry>>,
}

impl PlayerInner {
    fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            state: self.state,
            entry: self.current.as_ref().map(|e| e.overview()),
            liked: false,
        }
    }
}

/// Stopped / Playing / Paused, with every transition under one lock.
///
/// Lock order is player, then queue.
pub struct Player {
    inner: tokio::sync::Mutex<PlayerInner>,
    queue: Arc<PlaybackQueue>,
    output: Arc<dyn AudioOutput>,
    notifier: NotificationSender,
    play_attempts: AtomicUsize,
}

impl Player {
    pub fn new(
        queue: Arc<PlaybackQueue>,
        output: Arc<dyn AudioOutput>,
        notifier: NotificationSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: tokio::sync::Mutex::new(PlayerInner {
                state: PlayerState::Stopped,
                current: None,
            }),
            queue,
            output,
            notifier,
            play_attempts: AtomicUsize::new(0),
        })
    }

    fn announce(&self, snapshot: PlayerSnapshot) {
        if self.notifier.send(Notification::StateChanged(snapshot)).is_err() {
            debug!("State change dropped, dispatcher is gone");
        }
    }

    // Re-enter play() as its own task, never from inside the lock
    fn schedule_play(self: &Arc<Self>) {
        let player = Arc::clone(self);
        tokio::spawn(async move {
            player.play().await;
        });
    }

    /// Start the next ready entry. Only acts from Stopped.
    pub async fn play(self: &Arc<Self>) -> PlayerState {
        let mut inner = self.inner.lock().await;
        if inner.state != PlayerState::Stopped {
            return inner.state;
        }
        self.play_attempts.fetch_add(1, Ordering::SeqCst);

        let next = self
            .queue
            .dequeue_next()
            .await
            .and_then(|entry| entry.prepared().map(|prepared| (entry, prepared)));

        match next {
            Some((entry, prepared)) => {
                info!("Playing {} ({})", entry.track.title, entry.track.uri);
                self.output.play(entry.id, &prepared.path, prepared.loudness.gain_db());
                inner.current = Some(entry);
                inner.state = PlayerState::Playing;
            }
            None => {
                info!("Nothing to play, staying stopped");
                inner.current = None;
            }
        }

        let snapshot = inner.snapshot();
        let state = inner.state;
        drop(inner);
        self.announce(snapshot);
        state
    }

    pub async fn pause(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != PlayerState::Playing {
            return false;
        }

        self.output.pause();
        inner.state = PlayerState::Paused;
        info!("Paused");
        let snapshot = inner.snapshot();
        drop(inner);
        self.announce(snapshot);
        true
    }

    pub async fn resume(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != PlayerState::Paused {
            return false;
        }

        self.output.resume();
        inner.state = PlayerState::Playing;
        info!("Resumed");
        let snapshot = inner.snapshot();
        drop(inner);
        self.announce(snapshot);
        true
    }

    /// Stop whatever is playing and start the next entry.
    pub async fn skip(self: &Arc<Self>) {
        let snapshot = {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.current.take() {
                info!("Skipping {}", entry.track.uri);
            }
            inner.state = PlayerState::Stopped;
            self.output.stop();
            inner.snapshot()
        };

        self.announce(snapshot);
        self.schedule_play();
    }

    /// Called when the delivery thread drains the track `entry`.
    pub async fn on_track_finished(self: &Arc<Self>, entry: Uuid) {
        let snapshot = {
            let mut inner = self.inner.lock().await;
            match inner.current.as_ref() {
                Some(current) if current.id == entry => {}
                _ => {
                    debug!("Ignoring finish of {}, no longer current", entry);
                    return;
                }
            }

            inner.current = None;
            inner.state = PlayerState::Stopped;
            inner.snapshot()
        };

        info!("Track {} finished", entry);
        self.announce(snapshot);
        self.schedule_play();
    }

    /// Queue the current track `count` more times (capped) at the head.
    pub async fn repeat(self: &Arc<Self>, uri: &str, count: usize) -> bool {
        let track = {
            let inner = self.inner.lock().await;
            match inner.current.as_ref() {
                Some(current) if current.track.uri == uri => current.track.clone(),
                _ => {
                    warn!("repeat rejected: {} is not the current track", uri);
                    return false;
                }
            }
        };

        let count = count.min(REPEAT_CAP);
        let entries = (0..count).map(|_| QueueEntry::new(track.clone())).collect();
        self.queue.enqueue(entries, true).await;
        info!("Repeating {} {} times", uri, count);
        true
    }

    pub async fn snapshot(&self) -> PlayerSnapshot {
        self.inner.lock().await.snapshot()
    }

    pub async fn state(&self) -> PlayerState {
        self.inner.lock().await.state
    }

    pub async fn current(&self) -> Option<Arc<QueueEntry>> {
        self.inner.lock().await.current.clone()
    }

    pub fn play_attempts(&self) -> usize {
        self.play_attempts.load(Ordering::SeqCst)
    }
}
