use crate::core::chain::ChainError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}
