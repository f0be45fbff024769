use serde::Serialize;
use thiserror::Error;

use crate::errors::AppResult;
use crate::schema::NormalizedChunk;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub rows_written: usize,
    /// Physical write operations (staging batches) the load took.
    pub write_operations: usize,
    /// The same chunk was promoted by an earlier run; nothing was written.
    pub already_loaded: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error("row has {found} columns, destination expects {expected}")]
    Shape { expected: usize, found: usize },
    #[error("destination rejected chunk {chunk}: {reason}")]
    Rejected { chunk: usize, reason: String },
}

/// Destination of normalized trip chunks.
///
/// `ensure_schema` and `clear_staging` must be idempotent. `bulk_append` is
/// the unit of atomicity: a chunk is either fully visible or absent.
pub trait TripStore {
    fn ensure_schema(&mut self) -> AppResult<()>;

    fn bulk_append(&mut self, chunk: &NormalizedChunk) -> Result<WriteOutcome, LoadError>;

    /// Returns the number of staged rows removed.
    fn clear_staging(&mut self) -> AppResult<usize>;
}
