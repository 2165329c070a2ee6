pub mod auth;
pub mod control;
pub mod dispatch;
pub mod pipeline;
pub mod player;
pub mod preparer;
pub mod providers;
pub mod queue;
pub mod sessions;
pub mod store;
