use log::{error, info};
use rocket::{catchers, routes};

use jukebox::{handlers, Collaborators, Config, Jukebox};

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::load()?;
    info!("Starting jukebox on {}:{}", config.address, config.port);

    // Missing ffmpeg or a broken Opus encoder is fatal
    let collaborators = Collaborators::from_config(&config).map_err(|e| {
        error!("Cannot start: {}", e);
        e
    })?;
    let jukebox = Jukebox::start(&config, collaborators).map_err(|e| {
        error!("Cannot start audio pipeline: {}", e);
        e
    })?;

    let figment = rocket::Config::figment()
        .merge(("address", config.address.clone()))
        .merge(("port", config.port));

    let _ = rocket::custom(figment)
        .manage(jukebox)
        .mount(
            "/",
            routes![handlers::player_ws, handlers::stream_ws, handlers::health_check],
        )
        .register("/", catchers![handlers::not_found, handlers::server_error])
        .launch()
        .await?;

    Ok(())
}
