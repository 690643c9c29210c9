use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::{thread_rng, Rng, RngCore};
use tracing::{debug, warn};

use crate::error::LockError;
use crate::node::Node;
use crate::quorum::Quorum;
use crate::renewer::{self, RenewerHandle};

pub const DEFAULT_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
pub const CLOCK_DRIFT_FACTOR: f32 = 0.01;

/// Tuning knobs shared by every acquisition and renewal round of one lock.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease duration requested on each node. Must be non-zero.
    pub ttl: Duration,
    /// Retries after a failed attempt in blocking mode (0 = one try only).
    pub retry_times: u32,
    /// Upper bound for the inter-attempt sleep; the actual pause is drawn
    /// uniformly from `[0, retry_delay]`.
    pub retry_delay: Duration,
    /// Multiplicative allowance for divergence between client and server
    /// timers over one lease interval.
    pub clock_drift_factor: f32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            retry_times: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            clock_drift_factor: CLOCK_DRIFT_FACTOR,
        }
    }
}

impl LockOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    /// Set retry count and retry delay ceiling.
    pub fn with_retry(mut self, times: u32, delay: Duration) -> Self {
        self.retry_times = times;
        self.retry_delay = delay;
        self
    }

    pub fn with_clock_drift_factor(mut self, factor: f32) -> Self {
        self.clock_drift_factor = factor;
        self
    }
}

/// Per-call settings for [`Lock::acquire_with`].
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Retry with jitter until the retry budget (or `timeout`) runs out.
    /// When false, a single round is attempted and `timeout` must be `None`.
    pub blocking: bool,
    /// Wall-clock budget for the blocking retry loop. `None` caps the loop by
    /// retry count alone.
    pub timeout: Option<Duration>,
    /// Start the background renewer after a successful acquisition.
    pub autoextend: bool,
    /// Stop the renewer once this much time has passed, letting the lease
    /// run out naturally.
    pub autoextend_timeout: Option<Duration>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            blocking: true,
            timeout: None,
            autoextend: true,
            autoextend_timeout: None,
        }
    }
}

impl AcquireOptions {
    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_autoextend(mut self) -> Self {
        self.autoextend = false;
        self
    }

    pub fn with_autoextend_timeout(mut self, timeout: Duration) -> Self {
        self.autoextend_timeout = Some(timeout);
        self
    }
}

#[derive(Default)]
struct LockState {
    token: Option<String>,
    validity: Option<Duration>,
    renewer: Option<RenewerHandle>,
}

/// A distributed lock over N independent Redis instances.
///
/// The lock is held iff a strict majority of instances carry the same fresh
/// ownership token, and only for as long as the validity computed from the
/// acquisition round. Cloning shares the hold: a clone operates on the same
/// token, validity and renewer, which is how the background renewer works on
/// the caller's behalf.
///
/// Local state is optimistic. Once the lease silently runs out on the nodes,
/// the lock still carries its token until the caller observes the loss via
/// [`locked`](Lock::locked) or [`check_times`](Lock::check_times), or discards
/// it via [`release`](Lock::release).
#[derive(Clone)]
pub struct Lock {
    name: Arc<str>,
    options: LockOptions,
    quorum: Arc<Quorum>,
    state: Arc<Mutex<LockState>>,
}

impl Lock {
    /// Create a lock over `nodes` for the shared key `name`.
    ///
    /// Fails with [`LockError::InsufficientNodes`] for fewer than three nodes
    /// and [`LockError::InvalidOptions`] for a zero ttl.
    pub fn new(
        name: impl Into<String>,
        nodes: Vec<Arc<dyn Node>>,
        options: LockOptions,
    ) -> Result<Self, LockError> {
        if options.ttl.is_zero() {
            return Err(LockError::InvalidOptions("ttl must be non-zero"));
        }
        let quorum = Quorum::new(nodes, options.clock_drift_factor)?;
        Ok(Self {
            name: name.into().into(),
            options,
            quorum: Arc::new(quorum),
            state: Arc::new(Mutex::new(LockState::default())),
        })
    }

    /// The key this lock occupies on every node.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Validity computed by the most recent successful acquire or extend.
    pub fn validity(&self) -> Option<Duration> {
        self.state().validity
    }

    /// Acquire with default options: blocking, no wall-clock cap, autoextend.
    pub async fn acquire(&self) -> Result<Option<Duration>, LockError> {
        self.acquire_with(AcquireOptions::default()).await
    }

    /// Attempt to take the lock.
    ///
    /// Returns `Ok(Some(validity))` on success and `Ok(None)` when the lock
    /// could not be acquired within the configured retries (and optional
    /// `timeout`). A started round is never abandoned: the timeout is only
    /// consulted between rounds.
    pub async fn acquire_with(
        &self,
        options: AcquireOptions,
    ) -> Result<Option<Duration>, LockError> {
        if !options.blocking && options.timeout.is_some() {
            return Err(LockError::InvalidOptions(
                "a non-blocking acquire cannot carry a timeout",
            ));
        }

        let validity = if options.blocking {
            self.acquire_blocking(options.timeout).await
        } else {
            self.acquire_once().await
        };

        match validity {
            Some(validity) => {
                if options.autoextend {
                    self.spawn_renewer(options.autoextend_timeout);
                }
                Ok(Some(validity))
            }
            None => Ok(None),
        }
    }

    /// One quorum round with a fresh token.
    async fn acquire_once(&self) -> Option<Duration> {
        let token = generate_token();
        let ttl = self.options.ttl;
        let round = self
            .quorum
            .attempt(ttl, |node| node.try_set(&self.name, &token, ttl))
            .await;

        if round.ok {
            debug!(
                name = %self.name,
                validity_ms = round.validity.as_millis() as u64,
                "lock acquired"
            );
            let mut state = self.state();
            state.token = Some(token);
            state.validity = Some(round.validity);
            Some(round.validity)
        } else {
            debug!(
                name = %self.name,
                successes = round.successes,
                threshold = self.quorum.threshold(),
                "acquisition round failed"
            );
            // Some nodes may have accepted the write; undo before reporting
            // failure so the key does not linger there for a full ttl.
            self.quorum
                .broadcast(|node| node.release(&self.name, &token))
                .await;
            None
        }
    }

    async fn acquire_blocking(&self, timeout: Option<Duration>) -> Option<Duration> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let attempts = self.options.retry_times.saturating_add(1);

        for attempt in 0..attempts {
            if let Some(validity) = self.acquire_once().await {
                return Some(validity);
            }
            if attempt + 1 == attempts {
                break;
            }
            let pause = retry_jitter(self.options.retry_delay);
            if let Some(deadline) = deadline {
                if Instant::now() + pause >= deadline {
                    return None;
                }
            }
            tokio::time::sleep(pause).await;
        }
        None
    }

    /// Give up the hold.
    ///
    /// The release is broadcast to every node; the local token is cleared
    /// whether or not a majority acknowledged, because the caller has declared
    /// the critical section over. Unacknowledged keys expire naturally.
    pub async fn release(&self) -> Result<bool, LockError> {
        let (token, renewer) = {
            let mut state = self.state();
            let token = state.token.take().ok_or(LockError::NotHeld)?;
            state.validity = None;
            (token, state.renewer.take())
        };
        if let Some(renewer) = renewer {
            renewer.cancel();
        }

        let successes = self
            .quorum
            .broadcast(|node| node.release(&self.name, &token))
            .await;
        let majority = successes >= self.quorum.threshold();
        if majority {
            debug!(name = %self.name, "lock released");
        } else {
            warn!(
                name = %self.name,
                successes,
                nodes = self.quorum.len(),
                "release fell short of a majority; remaining keys expire with the lease"
            );
        }
        Ok(majority)
    }

    /// Push the lease back out to a full ttl on every node.
    ///
    /// Follows the same retry and jitter policy as acquisition, but without a
    /// wall-clock bound. Failure leaves the token in place so the caller may
    /// retry or release.
    pub async fn extend(&self) -> Result<Option<Duration>, LockError> {
        let token = self.state().token.clone().ok_or(LockError::NotHeld)?;
        let ttl = self.options.ttl;
        let attempts = self.options.retry_times.saturating_add(1);

        for attempt in 0..attempts {
            let round = self
                .quorum
                .attempt(ttl, |node| node.extend(&self.name, &token, ttl))
                .await;
            if round.ok {
                debug!(
                    name = %self.name,
                    validity_ms = round.validity.as_millis() as u64,
                    "lease extended"
                );
                let mut state = self.state();
                if state.token.as_deref() == Some(token.as_str()) {
                    state.validity = Some(round.validity);
                }
                return Ok(Some(round.validity));
            }
            if attempt + 1 == attempts {
                break;
            }
            tokio::time::sleep(retry_jitter(self.options.retry_delay)).await;
        }

        debug!(name = %self.name, "extension failed on a majority of nodes");
        Ok(None)
    }

    /// Renew the hold if one exists, acquire otherwise.
    ///
    /// When held, tries [`extend`](Lock::extend) first; if that fails the hold
    /// is abandoned (token discarded, renewer stopped) and a fresh acquisition
    /// is attempted with `options`. Useful for recovery paths that want to be
    /// holding the lock afterwards, however the previous attempt ended.
    pub async fn acquire_or_extend(&self) -> Result<Option<Duration>, LockError> {
        self.acquire_or_extend_with(AcquireOptions::default()).await
    }

    pub async fn acquire_or_extend_with(
        &self,
        options: AcquireOptions,
    ) -> Result<Option<Duration>, LockError> {
        if self.holds_token() {
            match self.extend().await {
                Ok(Some(validity)) => return Ok(Some(validity)),
                Ok(None) => self.abandon(),
                // Released out from under us between the check and the
                // extend; fall through to a plain acquisition.
                Err(LockError::NotHeld) => {}
                Err(other) => return Err(other),
            }
        }
        self.acquire_with(options).await
    }

    /// Ask every node how long it still honors this hold.
    ///
    /// The vector carries only the lifetimes reported by nodes that confirmed
    /// ownership; the flag is true iff at least a quorum of nodes did.
    pub async fn check_times(&self) -> Result<(bool, Vec<Duration>), LockError> {
        let token = self.state().token.clone().ok_or(LockError::NotHeld)?;
        let times: Vec<Duration> = self
            .quorum
            .gather(|node| node.remaining(&self.name, &token))
            .await
            .into_iter()
            .flatten()
            .collect();
        let held = times.len() >= self.quorum.threshold();
        Ok((held, times))
    }

    /// Whether the hold is still good on a majority of nodes.
    ///
    /// Returns false without any node traffic when no token is set. Callers
    /// whose critical section outlives the ttl must poll this (or
    /// [`check_times`](Lock::check_times)) to notice a silently lost lease.
    pub async fn locked(&self) -> bool {
        if !self.holds_token() {
            return false;
        }
        match self.check_times().await {
            Ok((held, _)) => held,
            Err(_) => false,
        }
    }

    /// Acquire, run `f`, then release — whatever `f` does.
    ///
    /// Returns `Ok(None)` without running `f` when the lock was not acquired.
    pub async fn with_acquired<T, F, Fut>(
        &self,
        options: AcquireOptions,
        f: F,
    ) -> Result<Option<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        if self.acquire_with(options).await?.is_none() {
            return Ok(None);
        }
        let value = f().await;
        self.release().await?;
        Ok(Some(value))
    }

    /// Start (or restart) the background renewer for the current hold.
    ///
    /// With a `timeout`, the renewer stops on its own once renewing would let
    /// the lease outlive `timeout` from now, and the hold then lapses
    /// naturally.
    pub fn start_autoextend(&self, timeout: Option<Duration>) -> Result<(), LockError> {
        if !self.holds_token() {
            return Err(LockError::NotHeld);
        }
        self.spawn_renewer(timeout);
        Ok(())
    }

    /// Stop the background renewer. Idempotent; never blocks.
    pub fn stop_autoextend(&self) {
        let renewer = self.state().renewer.take();
        if let Some(renewer) = renewer {
            renewer.cancel();
        }
    }

    pub(crate) fn holds_token(&self) -> bool {
        self.state().token.is_some()
    }

    /// Drop the hold locally without telling the nodes; any surviving keys
    /// expire with their lease.
    pub(crate) fn abandon(&self) {
        let renewer = {
            let mut state = self.state();
            state.token = None;
            state.validity = None;
            state.renewer.take()
        };
        if let Some(renewer) = renewer {
            renewer.cancel();
        }
    }

    fn spawn_renewer(&self, timeout: Option<Duration>) {
        let handle = renewer::spawn(self.clone(), timeout);
        let previous = self.state().renewer.replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Remove the renewer handle, but only if it still belongs to the task
    /// calling in; a replacement renewer must not be unseated by its
    /// predecessor's last breath.
    pub(crate) fn clear_renewer(&self, id: u64) {
        let mut state = self.state();
        if state
            .renewer
            .as_ref()
            .is_some_and(|handle| handle.id() == id)
        {
            state.renewer = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn renewer_active(&self) -> bool {
        self.state().renewer.is_some()
    }

    #[cfg(test)]
    pub(crate) fn current_token(&self) -> Option<String> {
        self.state().token.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().expect("lock state poisoned")
    }
}

static NEXT_RENEWER_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_renewer_id() -> u64 {
    NEXT_RENEWER_ID.fetch_add(1, Ordering::Relaxed)
}

/// 20 random bytes from the thread-local generator, hex-encoded.
///
/// Fresh per acquisition round; the token is the sole proof of ownership and
/// is never reused across attempts.
fn generate_token() -> String {
    let mut buf = [0u8; 20];
    thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Uniformly random pause in `[0, ceiling]`, in whole milliseconds.
fn retry_jitter(ceiling: Duration) -> Duration {
    let ceiling_ms = ceiling.as_millis() as u64;
    Duration::from_millis(thread_rng().gen_range(0..=ceiling_ms))
}
