use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Required tool unavailable: {0}")]
    Toolchain(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Not found")]
    NotFound,
}

impl From<audiopus::Error> for AppError {
    fn from(e: audiopus::Error) -> Self {
        AppError::Codec(format!("{:?}", e))
    }
}
