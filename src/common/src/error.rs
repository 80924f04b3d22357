use thiserror::Error;

/// The error taxonomy shared by the cache and replication engines.
///
/// Callers distinguish these kinds to decide whether to retry, give up, or
/// treat the result as a no-op: `Transient` and `Timeout` are retryable,
/// `Conflict` means a competing writer won and nothing is wrong, `Protocol`
/// means a peer sent something malformed, and `Fatal` means the engine
/// itself can no longer make progress.
#[derive(Debug, Error)]
pub enum ShardCacheError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("conflict: a competing command already holds the key")]
    Conflict,

    #[error("timed out waiting for a quorum")]
    Timeout,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ShardCacheError>;
