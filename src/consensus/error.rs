//! The canonical error table for the consensus core.

use crate::db::DbError;
use crate::state::StateError;

/// Errors surfaced by blocks, the chain store, and the engine.
///
/// Database and codec failures travel through unchanged; validation failures
/// are final and never retried. Orphan blocks surface as such; queueing and
/// re-delivery are the caller's job.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("block state fingerprint does not match its world state")]
    StateMismatch,
    #[error("block has not been hashed")]
    Unhashed,
    #[error("duplicate transaction")]
    DuplicateTransaction,
    #[error("duplicate block")]
    DuplicateBlock,
    #[error("parent block not known")]
    OrphanBlock,
    #[error("block validation failed: {0}")]
    Validation(&'static str),
    #[error("hash computation timed out")]
    HashTimeout,
    #[error("network block hash fails the proof-of-work check")]
    HashIncorrect,
    #[error("mining aborted by a competing network block")]
    MiningAborted,
    #[error("transaction not found on the canonical chain")]
    TransactionNotFound,
    #[error("key not found")]
    KeyNotFound,
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    #[error("chain database corrupted: {0}")]
    DbCorrupted(String),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StateError> for ChainError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Db(e) => ChainError::Db(e),
            other => ChainError::DbCorrupted(other.to_string()),
        }
    }
}
