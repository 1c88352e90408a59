use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("resample failed: {0}")]
    Resample(String),
    #[error("carrier api error: {0}")]
    CarrierApi(String),
    #[error("model stream error: {0}")]
    ModelStream(String),
    #[error("transcription error: {0}")]
    Transcription(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
