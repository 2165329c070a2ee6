// HTTP surface checks through rocket's local client

mod common;

use rocket::http::Status;
use rocket::local::asynchronous::Client;
use rocket::{catchers, routes};
use serde_json::Value;

use jukebox::handlers;

async fn client() -> Client {
    let running = common::start(5);
    let rocket = rocket::build()
        .manage(running.jukebox)
        .mount("/", routes![handlers::player_ws, handlers::stream_ws, handlers::health_check])
        .register("/", catchers![handlers::not_found, handlers::server_error]);
    Client::tracked(rocket).await.unwrap()
}

#[tokio::test]
async fn health_reports_idle_service() {
    let client = client().await;
    let response = client.get("/api/health").dispatch().await;
    assert_eq!(response.status(), Status::Ok);

    let body: Value = response.into_json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["state"], "stopped");
    assert_eq!(body["queue_length"], 0);
    assert_eq!(body["control_sessions"], 0);
    assert!(body["server_time"].is_string());
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let client = client().await;
    let response = client.get("/nowhere").dispatch().await;
    assert_eq!(response.status(), Status::NotFound);

    let body: Value = response.into_json().await.unwrap();
    assert_eq!(body["status"], 404);
}
