//! Distributed locks over N independent Redis instances.
//!
//! A lock is acquired by writing a fresh random ownership token to the same
//! key on every instance with `SET NX PX` and succeeds iff a strict majority
//! accepted the write before the lease, minus elapsed time and a clock-drift
//! allowance, ran out. Holds can be extended, checked, renewed in the
//! background until released or a deadline passes, and wrapped in a reentrant
//! variant that counts local recursion over the same hold.
//!
//! ```no_run
//! use std::time::Duration;
//! use redlease::{AcquireOptions, LockFactory, LockOptions};
//!
//! # async fn run() -> Result<(), redlease::LockError> {
//! let factory = LockFactory::from_urls([
//!     "redis://127.0.0.1:6380",
//!     "redis://127.0.0.1:6381",
//!     "redis://127.0.0.1:6382",
//! ])?;
//!
//! let lock = factory.lock_with("orders:rebalance", LockOptions::new(Duration::from_secs(5)))?;
//! if let Some(validity) = lock.acquire_with(AcquireOptions::default()).await? {
//!     // The hold is safe for `validity`, and the background renewer keeps
//!     // pushing it out until release.
//!     lock.release().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod factory;
mod lock;
mod node;
mod quorum;
mod reentrant;
mod renewer;
mod scripts;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::error::{LockError, MIN_NODES};
pub use crate::factory::LockFactory;
pub use crate::lock::{
    AcquireOptions, Lock, LockOptions, CLOCK_DRIFT_FACTOR, DEFAULT_RETRY_COUNT,
    DEFAULT_RETRY_DELAY, DEFAULT_TTL,
};
pub use crate::node::{Node, NodeConfig, RedisNode};
pub use crate::reentrant::ReentrantLock;
