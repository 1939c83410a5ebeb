use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrasaError>;

#[derive(Debug, Error)]
pub enum BrasaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
}

impl BrasaError {
    /// True when the error only means the ID was absent, not that
    /// anything went wrong with the backing store.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrasaError::NotFound(_))
    }
}
