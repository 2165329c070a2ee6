use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{json, Value};

use crate::error::{AppError, Result};

/// Name under which liked tracks are announced to clients.
pub const LIKES_PLAYLIST: &str = "Likes";

/// Playlist and like persistence.
#[async_trait]
pub trait Store: Send + Sync {
    async fn playlists(&self) -> Result<Value>;
    async fn playlist(&self, name: &str) -> Result<Value>;
    async fn create_playlist(&self, name: &str) -> Result<()>;
    async fn delete_playlist(&self, name: &str) -> Result<()>;
    async fn add_to_playlist(&self, name: &str, uris: &[String]) -> Result<()>;
    async fn remove_from_playlist(&self, name: &str, uri: &str) -> Result<()>;
    async fn likes(&self) -> Result<Value>;
    async fn set_like(&self, uri: &str, like: bool) -> Result<()>;
    async fn is_liked(&self, uri: &str) -> Result<bool>;
}

const LIST_LIMIT: &str = "1000";

/// REST client for the external store service.
pub struct HttpStore {
    client: Client,
    endpoint: Url,
}

impl HttpStore {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| AppError::Config(format!("store endpoint {}: {}", endpoint, e)))?;
        if endpoint.cannot_be_a_base() {
            return Err(AppError::Config(format!("store endpoint {} is not a base url", endpoint)));
        }

        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, endpoint })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn perform(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value> {
        let url = self.url(segments);
        debug!("{} {} {:?}", method, url, query);

        let mut request = self.client.request(method.clone(), url.clone()).query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status != StatusCode::OK {
            error!("Store {} {} failed with {}: {}", method, url, status, text);
            return Err(AppError::Store(format!("{} {}", status, text)));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl Store for HttpStore {
    async fn playlists(&self) -> Result<Value> {
        self.perform(Method::GET, &["playlist"], &[], None).await
    }

    async fn playlist(&self, name: &str) -> Result<Value> {
        self.perform(Method::GET, &["playlist", name], &[("limit", LIST_LIMIT)], None).await
    }

    async fn create_playlist(&self, name: &str) -> Result<()> {
        self.perform(Method::POST, &["playlist"], &[("name", name)], None).await?;
        Ok(())
    }

    async fn delete_playlist(&self, name: &str) -> Result<()> {
        self.perform(Method::DELETE, &["playlist"], &[("name", name)], None).await?;
        Ok(())
    }

    async fn add_to_playlist(&self, name: &str, uris: &[String]) -> Result<()> {
        self.perform(Method::POST, &["playlist", name], &[], Some(json!({ "entries": uris })))
            .await?;
        Ok(())
    }

    async fn remove_from_playlist(&self, name: &str, uri: &str) -> Result<()> {
        self.perform(Method::DELETE, &["playlist", name], &[("uri", uri)], None).await?;
        Ok(())
    }

    async fn likes(&self) -> Result<Value> {
        self.perform(Method::GET, &["likes"], &[("limit", LIST_LIMIT)], None).await
    }

    async fn set_like(&self, uri: &str, like: bool) -> Result<()> {
        let flag = if like { "1" } else { "0" };
        self.perform(Method::POST, &["likes"], &[("uri", uri), ("like", flag)], None).await?;
        Ok(())
    }

    async fn is_liked(&self, uri: &str) -> Result<bool> {
        let value = self.perform(Method::GET, &["likes", "resolve"], &[("uri", uri)], None).await?;
        Ok(parse_liked(&value))
    }
}

// Accepts `{"liked": bool}` or a bare boolean
fn parse_liked(value: &Value) -> bool {
    value
        .get("liked")
        .and_then(Value::as_bool)
        .or_else(|| value.as_bool())
        .unwrap_or(false)
}

/// Process-local store used when no store endpoint is configured.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    playlists: BTreeMap<String, Vec<String>>,
    likes: Vec<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn playlists(&self) -> Result<Value> {
        let inner = self.inner.lock();
        Ok(json!(inner.playlists.keys().collect::<Vec<_>>()))
    }

    async fn playlist(&self, name: &str) -> Result<Value> {
        let inner = self.inner.lock();
        let entries = inner.playlists.get(name).ok_or(AppError::NotFound)?;
        Ok(json!(entries))
    }

    async fn create_playlist(&self, name: &str) -> Result<()> {
        self.inner.lock().playlists.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn delete_playlist(&self, name: &str) -> Result<()> {
        self.inner.lock().playlists.remove(name).map(|_| ()).ok_or(AppError::NotFound)
    }

    async fn add_to_playlist(&self, name: &str, uris: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        let entries = inner.playlists.get_mut(name).ok_or(AppError::NotFound)?;
        entries.extend(uris.iter().cloned());
        Ok(())
    }

    async fn remove_from_playlist(&self, name: &str, uri: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let entries = inner.playlists.get_mut(name).ok_or(AppError::NotFound)?;
        entries.retain(|u| u != uri);
        Ok(())
    }

    async fn likes(&self) -> Result<Value> {
        Ok(json!(self.inner.lock().likes))
    }

    async fn set_like(&self, uri: &str, like: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.likes.retain(|u| u != uri);
        if like {
            inner.likes.insert(0, uri.to_string());
        }
        Ok(())
    }

    async fn is_liked(&self, uri: &str) -> Result<bool> {
        Ok(self.inner.lock().likes.iter().any(|u| u == uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liked_accepts_both_shapes() {
        assert!(parse_liked(&json!({"liked": true})));
        assert!(parse_liked(&json!(true)));
        assert!(!parse_liked(&json!({"liked": false})));
        assert!(!parse_liked(&Value::Null));
    }

    #[test]
    fn urls_escape_playlist_names() {
        let store = HttpStore::new("http://dbapp:8080").unwrap();
        assert_eq!(
            store.url(&["playlist", "road trip"]).as_str(),
            "http://dbapp:8080/playlist/road%20trip"
        );
        assert_eq!(store.url(&["likes", "resolve"]).as_str(), "http://dbapp:8080/likes/resolve");
    }

    #[test]
    fn bad_endpoint_is_config_error() {
        assert!(matches!(HttpStore::new("not a url"), Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn memory_store_tracks_playlists_and_likes() {
        let store = MemoryStore::new();
        store.create_playlist("mix").await.unwrap();
        store
            .add_to_playlist("mix", &["https://a".to_string(), "https://b".to_string()])
            .await
            .unwrap();
        store.remove_from_playlist("mix", "https://a").await.unwrap();

        assert_eq!(store.playlists().await.unwrap(), json!(["mix"]));
        assert_eq!(store.playlist("mix").await.unwrap(), json!(["https://b"]));

        store.set_like("https://b", true).await.unwrap();
        assert!(store.is_liked("https://b").await.unwrap());
        store.set_like("https://b", false).await.unwrap();
        assert!(!store.is_liked("https://b").await.unwrap());

        store.delete_playlist("mix").await.unwrap();
        assert!(matches!(store.playlist("mix").await, Err(AppError::NotFound)));
    }
}
