//! Background lease renewal.
//!
//! The renewer is a cooperative task: the owning [`Lock`] keeps a cancellable
//! handle, and the task itself withdraws its handle when it stops on its own
//! (deadline reached, extension failed). Stopping never joins the task, so a
//! stop issued from any context, including the renewer's own failure path,
//! cannot deadlock; the task observes cancellation at its next wakeup.

use std::time::{Duration, Instant};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lock::{next_renewer_id, Lock};

pub(crate) struct RenewerHandle {
    id: u64,
    cancel: CancellationToken,
}

impl RenewerHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Spawn a renewal task for the lock's current hold.
///
/// The task extends the lease every `ttl / 2`, leaving headroom for drift and
/// node round-trips within each lease. With a `timeout`, renewal stops as soon
/// as a fresh lease would outlive `now + timeout`, so the hold is gone no
/// later than the deadline plus the lease already granted before it.
pub(crate) fn spawn(lock: Lock, timeout: Option<Duration>) -> RenewerHandle {
    let id = next_renewer_id();
    let cancel = CancellationToken::new();
    let cancelled = cancel.clone();
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    tokio::spawn(async move {
        let ttl = lock.options().ttl;
        let interval = ttl / 2;
        loop {
            select! {
                _ = cancelled.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if let Some(deadline) = deadline {
                if Instant::now() + ttl > deadline {
                    debug!(name = %lock.name(), "renewal deadline reached, letting the lease lapse");
                    lock.clear_renewer(id);
                    break;
                }
            }

            match lock.extend().await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(
                        name = %lock.name(),
                        "lease extension failed, stopping renewal; the hold may be lost"
                    );
                    lock.clear_renewer(id);
                    break;
                }
                // The hold was released while we slept; nothing left to renew.
                Err(_) => {
                    debug!(name = %lock.name(), "hold released, stopping renewal");
                    lock.clear_renewer(id);
                    break;
                }
            }
        }
    });

    RenewerHandle { id, cancel }
}
