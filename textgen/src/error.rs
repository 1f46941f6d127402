use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by loading and generation.
///
/// Framework failures are wrapped as-is so callers see the original message.
#[derive(Error, Debug)]
pub enum TextGenError {
    #[error("hub request failed: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("tensor backend error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported model architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("checkpoint file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("invalid generation config: {0}")]
    InvalidConfig(String),

    #[error("generation failed: {0}")]
    Generation(String),
}

impl TextGenError {
    pub(crate) fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TextGenError>;
