// Background tasks that connect the core to the session fanout

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info};
use serde_json::json;
use tokio::sync::mpsc;

use crate::models::events::{
    Notification, NotificationReceiver, Packet, PlayerSnapshot, PLAYLISTS_CHANGED,
    PLAYLIST_ENTRY_CHANGED, QUEUE_CHANGED, STATE_CHANGED,
};
use crate::services::pipeline::PipelineEvent;
use crate::services::player::Player;
use crate::services::sessions::SessionHub;
use crate::services::store::Store;

async fn with_liked(store: &dyn Store, mut snapshot: PlayerSnapshot) -> PlayerSnapshot {
    if let Some(entry) = snapshot.entry.as_ref() {
        snapshot.liked = store.is_liked(&entry.track.uri).await.unwrap_or(false);
    }
    snapshot
}

/// Turn a notification into the control event clients receive.
pub async fn to_event(store: &dyn Store, notification: Notification) -> Packet {
    match notification {
        Notification::StateChanged(snapshot) => {
            let snapshot = with_liked(store, snapshot).await;
            Packet::event(STATE_CHANGED, serde_json::to_value(snapshot).ok())
        }
        Notification::QueueChanged | Notification::QueueEmpty => Packet::event(QUEUE_CHANGED, None),
        Notification::PlaylistsChanged => Packet::event(PLAYLISTS_CHANGED, None),
        Notification::PlaylistEntryChanged(name) => {
            Packet::event(PLAYLIST_ENTRY_CHANGED, Some(json!({ "name": name })))
        }
    }
}

/// Forward queue and player notifications to every control session.
pub async fn run_dispatcher(
    mut notifications: NotificationReceiver,
    hub: Arc<SessionHub>,
    store: Arc<dyn Store>,
) {
    info!("Event dispatcher started");
    while let Some(notification) = notifications.recv().await {
        let packet = to_event(store.as_ref(), notification).await;
        debug!("Broadcasting {}", packet.kind);
        hub.broadcast_event(&packet);
    }
    info!("Event dispatcher stopped");
}

/// Move frames and finish signals from the delivery thread onto the async side.
pub async fn run_pipeline_pump(
    mut frames: mpsc::Receiver<Bytes>,
    mut events: mpsc::UnboundedReceiver<PipelineEvent>,
    hub: Arc<SessionHub>,
    player: Arc<Player>,
) {
    info!("Pipeline pump started");
    loop {
        tokio::select! {
            // Frames queued before a finish signal go out first
            biased;

            frame = frames.recv() => match frame {
                Some(frame) => hub.broadcast_frame(frame),
                None => break,
            },
            event = events.recv() => match event {
                Some(PipelineEvent::TrackFinished(entry)) => player.on_track_finished(entry).await,
                None => break,
            },
        }
    }
    info!("Pipeline pump stopped");
}

/// Ping every connection on a fixed interval.
pub async fn run_keepalive(hub: Arc<SessionHub>, interval: Duration) {
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        timer.tick().await;
        hub.ping_all();
    }
}
