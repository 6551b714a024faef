//! facefind-store: persistent face index backed by SQLite.
//!
//! One row per registered photo. Embeddings are stored as little-endian
//! `f32` blobs next to the model identity they were produced with.

mod sqlite;

pub use sqlite::SqliteRepository;

use facefind_core::RepositoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid database value: {0}")]
    InvalidValue(String),
    #[error("store connection lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Rejected(#[from] RepositoryError),
}

impl From<StoreError> for RepositoryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Rejected(inner) => inner,
            other => RepositoryError::Backend(other.to_string()),
        }
    }
}

pub(crate) fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_embedding(blob: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
    if blob.len() != dimension * std::mem::size_of::<f32>() {
        return Err(StoreError::InvalidValue(format!(
            "embedding blob is {} bytes, expected {} floats",
            blob.len(),
            dimension
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
