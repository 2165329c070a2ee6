// Control-channel operations: parse, authorize against the session key, execute

use std::sync::Arc;

use log::{debug, error, warn};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::models::events::{ControlRequest, Notification, NotificationSender, Packet, PlayerState};
use crate::services::player::Player;
use crate::services::providers::ProviderRegistry;
use crate::services::queue::{PlaybackQueue, QueueEntry};
use crate::services::store::{Store, LIKES_PLAYLIST};

/// One URI or several.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum UriList {
    One(String),
    Many(Vec<String>),
}

impl UriList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            UriList::One(uri) => vec![uri],
            UriList::Many(uris) => uris,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueData {
    pub uri: UriList,
    #[serde(default)]
    pub head: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Position {
    pub uri: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RepeatData {
    pub uri: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EditData {
    pub queue: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NameData {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlaylistUris {
    pub name: String,
    pub uri: UriList,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlaylistUri {
    pub name: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LikeData {
    pub uri: String,
    pub like: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum Operation {
    Queue(QueueData),
    Play,
    Pause,
    Resume,
    Skip,
    SkipTo(Position),
    Repeat(RepeatData),
    Remove(Position),
    Edit(EditData),
    Clear,
    Shuffle,
    ListQueue,
    State,
    Playlists,
    Playlist(NameData),
    CreatePlaylist(NameData),
    DeletePlaylist(NameData),
    AddToPlaylist(PlaylistUris),
    RemoveFromPlaylist(PlaylistUri),
    Like(LikeData),
    Likes,
}

impl Operation {
    /// Build from the request's `op` and `data` fields.
    pub fn parse(op: &str, data: &Value) -> serde_json::Result<Self> {
        let mut tagged = json!({ "op": op });
        if !data.is_null() {
            tagged["data"] = data.clone();
        }
        serde_json::from_value(tagged)
    }
}

pub struct ControlService {
    player: Arc<Player>,
    queue: Arc<PlaybackQueue>,
    providers: Arc<ProviderRegistry>,
    store: Arc<dyn Store>,
    notifier: NotificationSender,
}

impl ControlService {
    pub fn new(
        player: Arc<Player>,
        queue: Arc<PlaybackQueue>,
        providers: Arc<ProviderRegistry>,
        store: Arc<dyn Store>,
        notifier: NotificationSender,
    ) -> Self {
        Self {
            player,
            queue,
            providers,
            store,
            notifier,
        }
    }

    fn notify(&self, notification: Notification) {
        if self.notifier.send(notification).is_err() {
            debug!("Notification dropped, dispatcher is gone");
        }
    }

    /// Handle one inbound text message from the control session `session_key`.
    /// Malformed or unauthorized messages are logged and produce nothing.
    pub async fn handle(&self, session_key: &str, text: &str) -> Option<Packet> {
        let request: ControlRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring malformed control message: {}", e);
                return None;
            }
        };

        if request.key.as_deref() != Some(session_key) {
            warn!("Ignoring '{}' with a key that does not match its session", request.op);
            return None;
        }

        let operation = match Operation::parse(&request.op, &request.data) {
            Ok(operation) => operation,
            Err(e) => {
                warn!("Ignoring unroutable op '{}': {}", request.op, e);
                return None;
            }
        };

        debug!("Executing {:?}", operation);
        match self.execute(operation).await {
            Ok(Some(data)) => Some(Packet::reply(
                &request.op,
                session_key,
                Some(data),
                request.postback,
            )),
            Ok(None) => None,
            Err(e) => {
                error!("Op '{}' failed: {}", request.op, e);
                None
            }
        }
    }

    /// Run an operation. Returns reply data for the ops that answer.
    pub async fn execute(&self, operation: Operation) -> Result<Option<Value>> {
        match operation {
            Operation::Queue(data) => {
                self.enqueue(data.uri.into_vec(), data.head).await;
            }
            Operation::Play => {
                self.player.play().await;
            }
            Operation::Pause => {
                self.player.pause().await;
            }
            Operation::Resume => {
                self.player.resume().await;
            }
            Operation::Skip => self.player.skip().await,
            Operation::SkipTo(pos) => {
                if self.queue.seek(&pos.uri, pos.index).await {
                    self.player.skip().await;
                }
            }
            Operation::Repeat(data) => {
                self.player.repeat(&data.uri, data.count).await;
            }
            Operation::Remove(pos) => {
                self.queue.remove_at(&pos.uri, pos.index).await;
            }
            Operation::Edit(data) => {
                self.queue.reassign(&data.queue).await;
            }
            Operation::Clear => self.queue.clear().await,
            Operation::Shuffle => self.queue.shuffle().await,
            Operation::ListQueue => {
                return Ok(Some(json!({ "queue": self.queue.list().await })));
            }
            Operation::State => {
                let mut snapshot = self.player.snapshot().await;
                if let Some(entry) = snapshot.entry.as_ref() {
                    snapshot.liked = self.store.is_liked(&entry.track.uri).await.unwrap_or(false);
                }
                return Ok(Some(serde_json::to_value(snapshot)?));
            }
            Operation::Playlists => {
                return Ok(Some(json!({ "playlists": self.store.playlists().await? })));
            }
            Operation::Playlist(data) => {
                let entries = self.store.playlist(&data.name).await?;
                return Ok(Some(json!({ "name": data.name, "entries": entries })));
            }
            Operation::CreatePlaylist(data) => {
                self.store.create_playlist(&data.name).await?;
                self.notify(Notification::PlaylistsChanged);
            }
            Operation::DeletePlaylist(data) => {
                self.store.delete_playlist(&data.name).await?;
                self.notify(Notification::PlaylistsChanged);
            }
            Operation::AddToPlaylist(data) => {
                self.store.add_to_playlist(&data.name, &data.uri.into_vec()).await?;
                self.notify(Notification::PlaylistEntryChanged(data.name));
            }
            Operation::RemoveFromPlaylist(data) => {
                self.store.remove_from_playlist(&data.name, &data.uri).await?;
                self.notify(Notification::PlaylistEntryChanged(data.name));
            }
            Operation::Like(data) => {
                self.store.set_like(&data.uri, data.like).await?;
                self.notify(Notification::StateChanged(self.player.snapshot().await));
                self.notify(Notification::PlaylistEntryChanged(LIKES_PLAYLIST.to_string()));
            }
            Operation::Likes => {
                return Ok(Some(json!({ "entries": self.store.likes().await? })));
            }
        }
        Ok(None)
    }

    async fn enqueue(&self, uris: Vec<String>, at_head: bool) {
        let mut entries = Vec::new();
        for uri in &uris {
            entries.extend(self.providers.resolve(uri).await.into_iter().map(QueueEntry::new));
        }

        if entries.is_empty() {
            warn!("Nothing resolved from {:?}", uris);
            return;
        }

        self.queue.enqueue(entries, at_head).await;
        if self.player.state().await == PlayerState::Stopped {
            self.player.play().await;
        }
    }
}
