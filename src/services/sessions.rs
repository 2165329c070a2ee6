// Control and audio session registries with broadcast fanout

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rocket_ws as ws;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::AUDIO_SESSION_BUFFER;
use crate::models::events::Packet;
use crate::utils::keys::generate_key;

pub type SessionSender = mpsc::UnboundedSender<ws::Message>;
pub type SessionReceiver = mpsc::UnboundedReceiver<ws::Message>;

// Audio sessions are bounded so a stalled listener only loses frames
pub type AudioSender = mpsc::Sender<ws::Message>;
pub type AudioReceiver = mpsc::Receiver<ws::Message>;

// An authenticated control connection
struct ControlSession {
    identity: String,
    tx: SessionSender,
    connected_at: Instant,
}

// A listener bound to a control session
struct AudioSession {
    control_key: String,
    tx: AudioSender,
}

#[derive(Default)]
struct ControlRegistry {
    // session key -> session
    sessions: HashMap<String, ControlSession>,
    // identity -> session key
    by_identity: HashMap<String, String>,
}

/// Tracks every live connection and fans events and frames out to them.
///
/// Lock order: the control registry is always taken before touching the audio
/// map, so an audio session can never be admitted against a key that is being
/// torn down.
pub struct SessionHub {
    control: Mutex<ControlRegistry>,
    audio: DashMap<usize, AudioSession>,
    audio_counter: AtomicUsize,
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHub {
    pub fn new() -> Self {
        SessionHub {
            control: Mutex::new(ControlRegistry::default()),
            audio: DashMap::new(),
            audio_counter: AtomicUsize::new(0),
        }
    }

    // Drop every audio session bound to `control_key`, closing them
    fn purge_audio(&self, control_key: &str) {
        let orphaned: Vec<usize> = self
            .audio
            .iter()
            .filter(|a| a.control_key == control_key)
            .map(|a| *a.key())
            .collect();

        for id in orphaned {
            if let Some((_, session)) = self.audio.remove(&id) {
                // If the buffer is full, dropping the sender still ends the stream
                let _ = session.tx.try_send(ws::Message::Close(None));
                info!("Audio session {} orphaned and closed", id);
            }
        }
    }

    /// Register a control connection for `identity`, closing any session the
    /// same identity already holds. Returns the new session key.
    pub fn register_control(&self, identity: &str) -> (String, SessionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = generate_key();

        let mut registry = self.control.lock();
        if let Some(old_key) = registry.by_identity.remove(identity) {
            if let Some(old) = registry.sessions.remove(&old_key) {
                let _ = old.tx.send(ws::Message::Close(None));
                info!(
                    "Superseded control session of {} (connected {}s ago)",
                    identity,
                    old.connected_at.elapsed().as_secs()
                );
            }
            self.purge_audio(&old_key);
        }

        registry.sessions.insert(
            key.clone(),
            ControlSession {
                identity: identity.to_string(),
                tx,
                connected_at: Instant::now(),
            },
        );
        registry.by_identity.insert(identity.to_string(), key.clone());
        info!("Control session registered for {}. Total: {}", identity, registry.sessions.len());

        (key, rx)
    }

    pub fn unregister_control(&self, key: &str) {
        let mut registry = self.control.lock();
        let session = match registry.sessions.remove(key) {
            Some(session) => session,
            None => return,
        };

        // A newer session may already own the identity
        if registry.by_identity.get(&session.identity).map(String::as_str) == Some(key) {
            registry.by_identity.remove(&session.identity);
        }
        self.purge_audio(key);
        info!(
            "Control session of {} removed. Total: {}",
            session.identity,
            registry.sessions.len()
        );
    }

    pub fn is_control_active(&self, key: &str) -> bool {
        self.control.lock().sessions.contains_key(key)
    }

    pub fn identity_of(&self, key: &str) -> Option<String> {
        self.control.lock().sessions.get(key).map(|s| s.identity.clone())
    }

    /// Admit an audio connection if `control_key` names a live control session.
    pub fn admit_audio(&self, control_key: &str) -> Option<(usize, AudioReceiver)> {
        let registry = self.control.lock();
        if !registry.sessions.contains_key(control_key) {
            warn!("Audio connection rejected: no control session for presented key");
            return None;
        }

        let (tx, rx) = mpsc::channel(AUDIO_SESSION_BUFFER);
        let id = self.audio_counter.fetch_add(1, Ordering::SeqCst);
        self.audio.insert(
            id,
            AudioSession {
                control_key: control_key.to_string(),
                tx,
            },
        );
        info!("Audio session {} admitted. Total: {}", id, self.audio.len());
        Some((id, rx))
    }

    /// Wait up to `window` for the connection's first message and admit it as
    /// an audio session if that message is a valid control key.
    pub async fn await_audio_handshake<F>(
        &self,
        first_message: F,
        window: Duration,
    ) -> Option<(usize, AudioReceiver)>
    where
        F: Future<Output = Option<String>>,
    {
        match tokio::time::timeout(window, first_message).await {
            Ok(Some(key)) => self.admit_audio(key.trim()),
            Ok(None) => {
                debug!("Audio connection closed before handshake");
                None
            }
            Err(_) => {
                warn!("Audio handshake timed out after {}s", window.as_secs());
                None
            }
        }
    }

    pub fn remove_audio(&self, id: usize) {
        if self.audio.remove(&id).is_some() {
            info!("Audio session {} removed. Total: {}", id, self.audio.len());
        }
    }

    pub fn send_to(&self, key: &str, packet: &Packet) -> bool {
        let text = match packet.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize {} reply: {}", packet.kind, e);
                return false;
            }
        };

        let registry = self.control.lock();
        match registry.sessions.get(key) {
            Some(session) => session.tx.send(ws::Message::Text(text)).is_ok(),
            None => false,
        }
    }

    /// Send an event to every control session, pruning dead ones afterwards.
    pub fn broadcast_event(&self, packet: &Packet) {
        let text = match packet.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize {} event: {}", packet.kind, e);
                return;
            }
        };

        let dead: Vec<String> = {
            let registry = self.control.lock();
            registry
                .sessions
                .iter()
                .filter(|(_, s)| s.tx.send(ws::Message::Text(text.clone())).is_err())
                .map(|(key, _)| key.clone())
                .collect()
        };

        for key in dead {
            warn!("Dropping control session that stopped receiving");
            self.unregister_control(&key);
        }
    }

    /// Send one encoded frame to every audio session, pruning dead ones afterwards.
    /// A listener whose buffer is full misses the frame.
    pub fn broadcast_frame(&self, frame: Bytes) {
        let mut dead = Vec::new();
        for audio in self.audio.iter() {
            match audio.tx.try_send(ws::Message::Binary(frame.to_vec())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("Audio session {} is behind, frame dropped", audio.key())
                }
                Err(TrySendError::Closed(_)) => dead.push(*audio.key()),
            }
        }

        for id in dead {
            debug!("Audio session {} stopped receiving", id);
            self.remove_audio(id);
        }
    }

    // Keepalive for every connection
    pub fn ping_all(&self) {
        {
            let registry = self.control.lock();
            for session in registry.sessions.values() {
                let _ = session.tx.send(ws::Message::Ping(vec![]));
            }
        }
        for audio in self.audio.iter() {
            let _ = audio.tx.try_send(ws::Message::Ping(vec![]));
        }
    }

    pub fn control_count(&self) -> usize {
        self.control.lock().sessions.len()
    }

    pub fn audio_count(&self) -> usize {
        self.audio.len()
    }
}
