use thiserror::Error;

/// Smallest number of Redis instances the algorithm is defined over.
pub const MIN_NODES: usize = 3;

/// Errors surfaced by lock construction and lock operations.
///
/// Transport failures (connection refused, resets, timeouts) never appear
/// here: the node adapter absorbs them, reporting the affected node as having
/// voted "no". Only caller contract violations become errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Fewer than [`MIN_NODES`] Redis instances were supplied at construction.
    #[error("at least 3 redis nodes are required, got {0}")]
    InsufficientNodes(usize),

    /// The operation requires a held lock, but no ownership token is set.
    #[error("operation requires a held lock")]
    NotHeld,

    /// A reentrant acquisition found that the distributed hold is gone while
    /// the local recursion count still shows it as held.
    #[error("lock ownership was lost while a reentrant hold was active")]
    OwnershipLost,

    /// The supplied options are inconsistent.
    #[error("invalid lock options: {0}")]
    InvalidOptions(&'static str),

    /// A node could not be constructed from its configuration.
    #[error("invalid redis node configuration")]
    Config(#[source] redis::RedisError),
}
