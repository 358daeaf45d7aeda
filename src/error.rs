//! Error taxonomy for the mempool (spec §7).

use thiserror::Error;

/// Unified error type returned by public [`crate::Mempool`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    // --- Config family ---
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    // --- Lifecycle family ---
    #[error("pool is closed")]
    PoolClosed,
    #[error("pool is not running")]
    NotRunning,
    #[error("pool is already running")]
    AlreadyRunning,

    // --- Validation family ---
    #[error("invalid transaction format: {0}")]
    InvalidFormat(String),
    #[error("invalid transaction hash")]
    InvalidHash,
    #[error("transaction too large: {size} > {max}")]
    TxTooLarge { size: u64, max: u64 },
    #[error("duplicate transaction")]
    DuplicateTx,
    #[error("memory limit exceeded")]
    MemoryLimit,
    #[error("compliance violation: {0}")]
    ComplianceViolation(String),

    // --- Storage family ---
    #[error("transaction not found")]
    TxNotFound,
    #[error("transaction already exists")]
    TxExists,
    #[error("pool is full")]
    PoolFull,
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("utxo conflict with an in-pool transaction")]
    UtxoConflict,

    // --- Network family (reserved for ports) ---
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("operation timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
}

pub type Result<T> = std::result::Result<T, MempoolError>;
