use futures::stream::StreamExt;
use log::{debug, info, warn};
use rocket::futures::SinkExt;
use rocket::serde::json::Json;
use rocket::{catch, get, Request, State};
use rocket_ws as ws;
use serde_json::{json, Value};

use crate::config::HANDSHAKE_TIMEOUT;
use crate::jukebox::Jukebox;
use crate::models::events::Packet;

// Control channel: authenticate by token, then exchange JSON ops and events
#[get("/player?<token>")]
pub fn player_ws(
    ws: ws::WebSocket,
    token: Option<String>,
    jukebox: &State<Jukebox>,
) -> ws::Channel<'static> {
    let identity = token
        .as_deref()
        .and_then(|token| jukebox.authenticator.authenticate(token));
    let hub = jukebox.hub.clone();
    let control = jukebox.control.clone();

    ws.channel(move |mut stream| Box::pin(async move {
        let identity = match identity {
            Some(identity) => identity,
            None => {
                warn!("Control connection refused: unknown token");
                let _ = stream.send(ws::Message::Close(None)).await;
                return Ok(());
            }
        };

        let (key, mut outgoing) = hub.register_control(&identity);
        let hello = Packet::reply("hello", &key, Some(json!({ "identity": identity })), None);
        hub.send_to(&key, &hello);

        loop {
            tokio::select! {
                message = outgoing.recv() => match message {
                    Some(ws::Message::Close(frame)) => {
                        let _ = stream.send(ws::Message::Close(frame)).await;
                        break;
                    }
                    Some(message) => {
                        if let Err(e) = stream.send(message).await {
                            debug!("Control send to {} failed: {:?}", identity, e);
                            break;
                        }
                    }
                    None => break,
                },

                incoming = stream.next() => match incoming {
                    Some(Ok(ws::Message::Text(text))) => {
                        // Each message runs on its own so a slow op never blocks the reader
                        let control = control.clone();
                        let hub = hub.clone();
                        let key = key.clone();
                        tokio::spawn(async move {
                            if let Some(reply) = control.handle(&key, &text).await {
                                hub.send_to(&key, &reply);
                            }
                        });
                    }
                    Some(Ok(ws::Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Control connection of {} errored: {:?}", identity, e);
                        break;
                    }
                },
            }
        }

        hub.unregister_control(&key);
        info!("Control connection of {} closed", identity);
        Ok(())
    }))
}

// Audio channel: first text message must be a live control session key
#[get("/stream")]
pub fn stream_ws(ws: ws::WebSocket, jukebox: &State<Jukebox>) -> ws::Channel<'static> {
    let hub = jukebox.hub.clone();

    ws.channel(move |mut stream| Box::pin(async move {
        let first_text = async {
            loop {
                match stream.next().await {
                    Some(Ok(ws::Message::Text(text))) => return Some(text),
                    Some(Ok(ws::Message::Close(_))) | Some(Err(_)) | None => return None,
                    Some(Ok(_)) => continue,
                }
            }
        };

        let handshake = hub.await_audio_handshake(first_text, HANDSHAKE_TIMEOUT);
        let (id, mut outgoing) = match handshake.await {
            Some(admitted) => admitted,
            None => {
                let _ = stream.send(ws::Message::Close(None)).await;
                return Ok(());
            }
        };

        loop {
            tokio::select! {
                message = outgoing.recv() => match message {
                    Some(ws::Message::Close(frame)) => {
                        let _ = stream.send(ws::Message::Close(frame)).await;
                        break;
                    }
                    Some(message) => {
                        if stream.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },

                incoming = stream.next() => match incoming {
                    Some(Ok(ws::Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }

        hub.remove_audio(id);
        Ok(())
    }))
}

#[get("/api/health")]
pub async fn health_check(jukebox: &State<Jukebox>) -> Json<Value> {
    Json(jukebox.status().await)
}

#[catch(404)]
pub fn not_found(req: &Request) -> Json<Value> {
    Json(json!({
        "status": 404,
        "message": format!("Nothing at {}", req.uri()),
    }))
}

#[catch(500)]
pub fn server_error() -> Json<Value> {
    Json(json!({
        "status": 500,
        "message": "Internal server error",
    }))
}
