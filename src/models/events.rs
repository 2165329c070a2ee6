use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::models::track::EntryOverview;

// Unsolicited event names
pub const STATE_CHANGED: &str = "state_changed";
pub const QUEUE_CHANGED: &str = "queue_changed";
pub const PLAYLISTS_CHANGED: &str = "playlists_changed";
pub const PLAYLIST_ENTRY_CHANGED: &str = "playlist_entry_changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Stopped,
    Playing,
    Paused,
}

impl Default for PlayerState {
    fn default() -> Self {
        PlayerState::Stopped
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub state: PlayerState,
    pub entry: Option<EntryOverview>,
    #[serde(default)]
    pub liked: bool,
}

/// Emitted by the queue and the player; turned into control events by the
/// dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChanged(PlayerSnapshot),
    QueueChanged,
    QueueEmpty,
    PlaylistsChanged,
    PlaylistEntryChanged(String),
}

pub type NotificationSender = mpsc::UnboundedSender<Notification>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

/// Inbound control message: `{op, key, data, postback?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    pub op: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub postback: Option<Value>,
}

/// Outbound envelope: `{type, key?, data?, postback?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postback: Option<Value>,
}

impl Packet {
    pub fn event(kind: &str, data: Option<Value>) -> Self {
        Self {
            kind: kind.to_string(),
            key: None,
            data,
            postback: None,
        }
    }

    pub fn reply(kind: &str, key: &str, data: Option<Value>, postback: Option<Value>) -> Self {
        Self {
            kind: kind.to_string(),
            key: Some(key.to_string()),
            data,
            postback,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn event_omits_empty_fields() {
        let packet = Packet::event(QUEUE_CHANGED, None);
        assert_eq!(packet.to_json().unwrap(), r#"{"type":"queue_changed"}"#);
    }

    #[test]
    fn reply_echoes_postback() {
        let packet = Packet::reply("list_queue", "abc", Some(json!({"queue": []})), Some(json!(7)));
        let value: Value = serde_json::from_str(&packet.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "list_queue", "key": "abc", "data": {"queue": []}, "postback": 7})
        );
    }

    #[test]
    fn request_data_defaults_to_null() {
        let request: ControlRequest =
            serde_json::from_str(r#"{"op": "pause", "key": "k"}"#).unwrap();
        assert_eq!(request.op, "pause");
        assert!(request.data.is_null());
        assert!(request.postback.is_none());
    }

    #[test]
    fn snapshot_serializes_lowercase_state() {
        let snapshot = PlayerSnapshot { state: PlayerState::Paused, entry: None, liked: false };
        assert_eq!(serde_json::to_value(&snapshot).unwrap()["state"], json!("paused"));
    }
}
