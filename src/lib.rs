// Library exports for the jukebox crate
// The binary and the integration tests both build on this

pub mod config;
pub mod error;
pub mod handlers;
pub mod jukebox;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{AppError, Result};
pub use jukebox::{Collaborators, Jukebox};
