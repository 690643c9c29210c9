use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::LockError;
use crate::lock::{AcquireOptions, Lock, LockOptions};
use crate::node::Node;

/// A distributed lock that may be re-acquired by its current holder.
///
/// Composes a [`Lock`] with a local recursion count bound to the same
/// ownership token: the first acquisition goes to the nodes, nested ones only
/// verify that the distributed hold is still good and bump the count, and
/// only the final release touches the nodes again. The count is local to this
/// object (and its clones); a different process, or a different
/// `ReentrantLock` over the same key, still competes normally.
#[derive(Clone)]
pub struct ReentrantLock {
    lock: Lock,
    depth: Arc<Mutex<u32>>,
}

impl ReentrantLock {
    pub fn new(
        name: impl Into<String>,
        nodes: Vec<Arc<dyn Node>>,
        options: LockOptions,
    ) -> Result<Self, LockError> {
        Ok(Self::from_lock(Lock::new(name, nodes, options)?))
    }

    pub fn from_lock(lock: Lock) -> Self {
        Self {
            lock,
            depth: Arc::new(Mutex::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        self.lock.name()
    }

    /// Current recursion count; zero means not held.
    pub fn depth(&self) -> u32 {
        *self.depth.lock().expect("depth poisoned")
    }

    pub async fn acquire(&self) -> Result<Option<Duration>, LockError> {
        self.acquire_with(AcquireOptions::default()).await
    }

    /// Take the lock, or re-enter it when already holding.
    ///
    /// On re-entry the nodes are asked to confirm the hold; the returned
    /// validity is the smallest lifetime any confirming node reported. If the
    /// hold evaporated while the caller believed it was in a critical
    /// section, re-entering is meaningless and [`LockError::OwnershipLost`]
    /// is returned.
    pub async fn acquire_with(
        &self,
        options: AcquireOptions,
    ) -> Result<Option<Duration>, LockError> {
        if self.depth() == 0 {
            match self.lock.acquire_with(options).await? {
                Some(validity) => {
                    self.set_depth(1);
                    Ok(Some(validity))
                }
                None => Ok(None),
            }
        } else {
            let (held, times) = self.lock.check_times().await?;
            if !held {
                return Err(LockError::OwnershipLost);
            }
            self.add_depth(1);
            Ok(times.into_iter().min())
        }
    }

    /// Unwind one level of recursion, releasing the nodes only at the last.
    pub async fn release(&self) -> Result<bool, LockError> {
        {
            let mut depth = self.depth.lock().expect("depth poisoned");
            match *depth {
                0 => return Err(LockError::NotHeld),
                1 => *depth = 0,
                _ => {
                    *depth -= 1;
                    return Ok(true);
                }
            }
        }
        self.lock.release().await
    }

    pub async fn acquire_or_extend(&self) -> Result<Option<Duration>, LockError> {
        self.acquire_or_extend_with(AcquireOptions::default()).await
    }

    /// Re-enter by renewing the lease when held, acquire otherwise.
    ///
    /// A successful extension counts as one more recursion level. When the
    /// extension fails the previous hold is abandoned and re-acquired from
    /// scratch; the recursion collapses to a single level, since the old
    /// hold's nesting died with its token.
    pub async fn acquire_or_extend_with(
        &self,
        options: AcquireOptions,
    ) -> Result<Option<Duration>, LockError> {
        if self.depth() == 0 {
            return match self.lock.acquire_or_extend_with(options).await? {
                Some(validity) => {
                    self.set_depth(1);
                    Ok(Some(validity))
                }
                None => Ok(None),
            };
        }

        match self.lock.extend().await {
            Ok(Some(validity)) => {
                self.add_depth(1);
                Ok(Some(validity))
            }
            Ok(None) | Err(LockError::NotHeld) => {
                self.lock.abandon();
                match self.lock.acquire_with(options).await? {
                    Some(validity) => {
                        self.set_depth(1);
                        Ok(Some(validity))
                    }
                    None => Ok(None),
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Renew the current lease; see [`Lock::extend`].
    pub async fn extend(&self) -> Result<Option<Duration>, LockError> {
        self.lock.extend().await
    }

    /// See [`Lock::check_times`].
    pub async fn check_times(&self) -> Result<(bool, Vec<Duration>), LockError> {
        self.lock.check_times().await
    }

    /// See [`Lock::locked`].
    pub async fn locked(&self) -> bool {
        self.lock.locked().await
    }

    /// See [`Lock::start_autoextend`].
    pub fn start_autoextend(&self, timeout: Option<Duration>) -> Result<(), LockError> {
        self.lock.start_autoextend(timeout)
    }

    /// See [`Lock::stop_autoextend`].
    pub fn stop_autoextend(&self) {
        self.lock.stop_autoextend()
    }

    fn set_depth(&self, value: u32) {
        *self.depth.lock().expect("depth poisoned") = value;
    }

    fn add_depth(&self, delta: u32) {
        *self.depth.lock().expect("depth poisoned") += delta;
    }
}
