use std::time::Duration;

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),

    #[error("No video stream in input")]
    NoVideoStream,

    #[error("Decoder not found: {0}")]
    DecoderNotFound(String),

    #[error("Stream stalled: no progress for {}s", .0.as_secs())]
    Stall(Duration),

    #[error("Conversion error: {0}")]
    Convert(String),

    #[error("Recorder error: {0}")]
    Recorder(String),

    #[error("Audio error: {0}")]
    AudioError(String),
}

impl AppError {
    /// Whether the error ended an attempt because the stream stopped advancing
    pub fn is_stall(&self) -> bool {
        matches!(self, AppError::Stall(_))
    }
}

/// Result type alias for application
pub type Result<T> = std::result::Result<T, AppError>;
