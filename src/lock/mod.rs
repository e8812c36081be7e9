//! Mutual exclusion over one physical instrument.
//!
//! Two independent locks compose into one logical critical section:
//!
//! - [`InstrumentLock`]: reentrant, per-process, owned by a thread.
//! - an [`ExtraLock`]: optional outer lock that may reach across processes
//!   (see [`shared::SharedMemoryLock`]). [`NoExtraLock`] is the no-op default.
//!
//! [`ComposedLock`] always acquires inner then outer and releases outer then
//! inner. Acquisition never blocks indefinitely inside the OS: it is a bounded
//! poll loop (see [`crate::wait`]) so a user abort can stop it cleanly.
//!
//! # Example
//!
//! ```
//! use instrument_core::lock::{ComposedLock, NoExtraLock};
//! use std::sync::Arc;
//!
//! let lock = ComposedLock::new("dmm", Arc::new(NoExtraLock));
//! {
//!     let _outer = lock.acquire().unwrap();
//!     let _inner = lock.acquire().unwrap(); // reentrant
//!     assert_eq!(lock.depth(), 2);
//! }
//! assert!(!lock.is_owned());
//! ```

pub mod shared;

use crate::error::{AppResult, DaqError};
use crate::wait::{Interrupt, RetryWait};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, warn};

/// Default poll interval for non-blocking acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Slice used when no acquisition timeout is configured.
const UNBOUNDED_SLICE: Duration = Duration::from_secs(3600);

// =============================================================================
// Inner lock
// =============================================================================

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Reentrant lock owned by one thread at a time.
#[derive(Debug)]
pub struct InstrumentLock {
    name: String,
    state: Mutex<LockState>,
}

impl InstrumentLock {
    /// New, unlocked.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LockState::default()),
        }
    }

    /// Lock name used in errors and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take one level without waiting. Succeeds when unlocked or already
    /// owned by the calling thread.
    pub fn try_acquire(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner != me => false,
            _ => {
                state.owner = Some(me);
                state.depth += 1;
                true
            }
        }
    }

    /// Poll [`try_acquire`](Self::try_acquire) under `wait`. `Ok(false)` on timeout.
    pub fn acquire(&self, wait: &RetryWait) -> AppResult<bool> {
        wait.run(|| self.try_acquire())
    }

    /// Drop one level. Releasing a lock the calling thread does not hold is an error.
    pub fn release(&self) -> AppResult<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) || state.depth == 0 {
            return Err(DaqError::LockNotHeld(self.name.clone()));
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
        }
        Ok(())
    }

    /// Unwind every level regardless of owner; returns how many were cleared.
    pub fn force_release(&self) -> usize {
        let mut state = self.state.lock();
        let cleared = state.depth;
        state.depth = 0;
        state.owner = None;
        cleared
    }

    /// Whether the calling thread holds the lock.
    pub fn is_owned(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Whether any thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Levels held by the calling thread (0 if another thread owns it).
    pub fn depth(&self) -> usize {
        let state = self.state.lock();
        if state.owner == Some(thread::current().id()) {
            state.depth
        } else {
            0
        }
    }
}

// =============================================================================
// Extra lock
// =============================================================================

/// Outer lock composed with the [`InstrumentLock`].
///
/// Implementations are reentrant per thread and must never block in
/// `try_acquire`: waiting is done by the caller's poll loop.
pub trait ExtraLock: Send + Sync + fmt::Debug {
    /// Name used in errors and logs.
    fn name(&self) -> &str;

    /// Take one level without waiting.
    fn try_acquire(&self) -> AppResult<bool>;

    /// Drop one level held by the calling thread.
    fn release(&self) -> AppResult<()>;

    /// Levels held by the calling thread.
    fn depth(&self) -> usize;

    /// Unwind every level regardless of owner; returns how many were cleared.
    fn force_release(&self) -> AppResult<usize>;
}

/// Extra lock that is always available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExtraLock;

impl ExtraLock for NoExtraLock {
    fn name(&self) -> &str {
        "none"
    }

    fn try_acquire(&self) -> AppResult<bool> {
        Ok(true)
    }

    fn release(&self) -> AppResult<()> {
        Ok(())
    }

    fn depth(&self) -> usize {
        0
    }

    fn force_release(&self) -> AppResult<usize> {
        Ok(0)
    }
}

// =============================================================================
// Composed lock
// =============================================================================

/// Levels cleared by [`ComposedLock::force_release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceReleaseReport {
    /// Levels cleared on the inner (per-process) lock.
    pub inner: usize,
    /// Levels cleared on the extra lock.
    pub extra: usize,
}

/// Inner lock plus extra lock acting as one critical section.
#[derive(Debug)]
pub struct ComposedLock {
    inner: InstrumentLock,
    extra: Arc<dyn ExtraLock>,
    poll_interval: Duration,
    timeout: Option<Duration>,
    interrupt: Interrupt,
}

impl ComposedLock {
    /// Compose a fresh inner lock named `name` with `extra`.
    pub fn new(name: impl Into<String>, extra: Arc<dyn ExtraLock>) -> Self {
        Self {
            inner: InstrumentLock::new(name),
            extra,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            interrupt: Interrupt::global().clone(),
        }
    }

    /// Interval between acquisition attempts.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Give up with `LockTimeout` after `timeout`; `None` waits until interrupted.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abort acquisition when `interrupt` is triggered.
    pub fn with_interrupt(mut self, interrupt: &Interrupt) -> Self {
        self.interrupt = interrupt.clone();
        self
    }

    /// Lock name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Acquire both locks (inner first) and return a guard releasing them.
    pub fn acquire(&self) -> AppResult<ComposedGuard<'_>> {
        self.acquire_raw(&self.interrupt)?;
        Ok(ComposedGuard { lock: self })
    }

    /// Like [`acquire`](Self::acquire), but aborted by `interrupt` instead of
    /// the lock's own abort flag (used by cancellable background work).
    pub fn acquire_observing(&self, interrupt: &Interrupt) -> AppResult<ComposedGuard<'_>> {
        self.acquire_raw(interrupt)?;
        Ok(ComposedGuard { lock: self })
    }

    /// Abort flag observed by [`acquire`](Self::acquire).
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Whether the calling thread holds the inner lock.
    pub fn is_owned(&self) -> bool {
        self.inner.is_owned()
    }

    /// Whether any thread holds the inner lock.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Inner-lock levels held by the calling thread.
    pub fn depth(&self) -> usize {
        self.inner.depth()
    }

    /// Extra-lock levels held by the calling thread.
    pub fn extra_depth(&self) -> usize {
        self.extra.depth()
    }

    /// Unwind both locks unconditionally, outer first.
    pub fn force_release(&self) -> AppResult<ForceReleaseReport> {
        let extra = self.extra.force_release()?;
        let inner = self.inner.force_release();
        warn!(
            lock = %self.name(),
            inner_levels = inner,
            extra_levels = extra,
            "Force-released instrument lock"
        );
        Ok(ForceReleaseReport { inner, extra })
    }

    /// Release every level the calling thread holds, run `f`, then reacquire
    /// the same number of levels on both locks.
    ///
    /// The original depths are restored even if `f` panics; the panic is then
    /// resumed. Reacquisition ignores user aborts and the lock timeout so the
    /// caller's guards stay balanced.
    pub fn released_while<T>(&self, f: impl FnOnce() -> T) -> AppResult<T> {
        let inner_depth = self.inner.depth();
        let extra_depth = self.extra.depth();
        for _ in 0..extra_depth {
            self.extra.release()?;
        }
        for _ in 0..inner_depth {
            self.inner.release()?;
        }
        debug!(lock = %self.name(), inner_depth, extra_depth, "Lock released for scope");

        let outcome = panic::catch_unwind(AssertUnwindSafe(f));

        let restored = self.restore(inner_depth, extra_depth);
        match outcome {
            Ok(value) => restored.map(|()| value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Reacquire released levels with neither deadline nor abort: the caller's
    /// guards are still alive and must find the depth they left.
    fn restore(&self, inner_depth: usize, extra_depth: usize) -> AppResult<()> {
        let uninterruptible = Interrupt::new();
        for _ in 0..inner_depth {
            self.wait_for(&uninterruptible, None, self.inner.name(), || {
                Ok(self.inner.try_acquire())
            })?;
        }
        for _ in 0..extra_depth {
            self.wait_for(&uninterruptible, None, self.extra.name(), || {
                self.extra.try_acquire()
            })?;
        }
        Ok(())
    }

    fn acquire_raw(&self, interrupt: &Interrupt) -> AppResult<()> {
        self.wait_for(interrupt, self.timeout, self.inner.name(), || {
            Ok(self.inner.try_acquire())
        })?;
        if let Err(err) = self.wait_for(interrupt, self.timeout, self.extra.name(), || {
            self.extra.try_acquire()
        }) {
            self.inner.release()?;
            return Err(err);
        }
        Ok(())
    }

    fn release_raw(&self) -> AppResult<()> {
        let extra = self.extra.release();
        let inner = self.inner.release();
        extra.and(inner)
    }

    fn wait_for<F>(
        &self,
        interrupt: &Interrupt,
        timeout: Option<Duration>,
        lock: &str,
        mut attempt: F,
    ) -> AppResult<()>
    where
        F: FnMut() -> AppResult<bool>,
    {
        let mut failure = None;
        let mut predicate = || match attempt() {
            Ok(acquired) => acquired,
            Err(err) => {
                failure = Some(err);
                true
            }
        };
        let label = format!("lock {lock}");
        let acquired = match timeout {
            Some(timeout) => RetryWait::new(timeout)
                .quiet()
                .with_poll_interval(self.poll_interval)
                .with_interrupt(interrupt)
                .with_label(label)
                .run(&mut predicate)?,
            None => loop {
                let slice = RetryWait::new(UNBOUNDED_SLICE)
                    .with_poll_interval(self.poll_interval)
                    .with_interrupt(interrupt)
                    .with_label(label.clone())
                    .run(&mut predicate)?;
                if slice {
                    break true;
                }
            },
        };
        drop(predicate);
        if let Some(err) = failure {
            return Err(err);
        }
        if !acquired {
            return Err(DaqError::LockTimeout {
                lock: lock.to_string(),
                waited: timeout.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Holds one level of a [`ComposedLock`]; releases outer then inner on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ComposedGuard<'a> {
    lock: &'a ComposedLock,
}

impl fmt::Debug for ComposedGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedGuard")
            .field("lock", &self.lock.name())
            .finish()
    }
}

impl Drop for ComposedGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release_raw() {
            // A force_release while the guard was alive leaves nothing to release.
            warn!(lock = %self.lock.name(), error = %err, "Failed to release lock in drop");
        }
    }
}
