use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Failures that abort a pipeline run.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
    #[error("destination schema error: {0}")]
    Schema(String),
    #[error("input error: {0}")]
    Input(String),
}
