//! Bounded, interruptible polling.
//!
//! Every blocking wait in the crate goes through this module: lock acquisition,
//! the acquisition worker's pre-trigger delay and detector loop, and the caller
//! side of stage 2 of the asynchronous protocol. All of them observe an
//! [`Interrupt`] between polls so a user abort never leaves a thread stuck.
//!
//! # Example
//!
//! ```
//! use instrument_core::wait::RetryWait;
//! use std::time::Duration;
//!
//! let mut n = 0;
//! let done = RetryWait::new(Duration::from_secs(1))
//!     .with_poll_interval(Duration::from_millis(1))
//!     .run(|| {
//!         n += 1;
//!         n == 3
//!     })
//!     .unwrap();
//! assert!(done);
//! ```

use crate::error::{AppResult, DaqError};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Elapsed time after which the poll interval is coarsened.
pub const COARSE_AFTER: Duration = Duration::from_millis(500);
/// Minimum poll interval once a wait has been coarsened.
pub const COARSE_POLL: Duration = Duration::from_millis(50);
/// Slice handed to the event check in [`wait_on_event`].
pub const EVENT_SLICE: Duration = Duration::from_millis(200);

const PROGRESS_EVERY: Duration = Duration::from_secs(1);

static USER_ABORT: Lazy<Interrupt> = Lazy::new(Interrupt::new);

// =============================================================================
// Interrupt
// =============================================================================

/// Cloneable abort flag observed by every wait.
///
/// [`Interrupt::global`] is the process-wide user-abort signal (for example
/// wired to Ctrl-C by an application). Components accept any `Interrupt` so
/// tests can use a private one.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    /// New, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide user-abort flag.
    pub fn global() -> &'static Interrupt {
        &USER_ABORT
    }

    /// Request every wait observing this flag to stop.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Re-arm the flag after an abort has been handled.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Whether an abort is pending.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` if an abort is pending.
    pub fn check(&self) -> AppResult<()> {
        if self.is_set() {
            Err(DaqError::Interrupted)
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// RetryWait
// =============================================================================

/// Polling loop with a deadline.
#[derive(Clone, Debug)]
pub struct RetryWait {
    timeout: Duration,
    poll_interval: Duration,
    progress: bool,
    interrupt: Interrupt,
    label: String,
}

impl RetryWait {
    /// Wait at most `timeout`, polling every 20ms and reporting progress.
    /// A timeout too large to be represented as a deadline never expires.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: Duration::from_millis(20),
            progress: true,
            interrupt: Interrupt::global().clone(),
            label: "wait".to_string(),
        }
    }

    /// Signed timeout in seconds: a negative value waits `|timeout|` without
    /// progress reporting. An infinite timeout never expires.
    pub fn from_secs(timeout: f64) -> Self {
        let wait = Self::new(Duration::try_from_secs_f64(timeout.abs()).unwrap_or(Duration::MAX));
        if timeout < 0.0 {
            wait.quiet()
        } else {
            wait
        }
    }

    /// Interval between predicate evaluations during the first half second.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Suppress progress reporting.
    pub fn quiet(mut self) -> Self {
        self.progress = false;
        self
    }

    /// Observe `interrupt` instead of the global user-abort flag.
    pub fn with_interrupt(mut self, interrupt: &Interrupt) -> Self {
        self.interrupt = interrupt.clone();
        self
    }

    /// Name used in progress messages.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evaluate `predicate` until it returns true (`Ok(true)`) or the timeout
    /// elapses (`Ok(false)`). The predicate is always evaluated at least once.
    pub fn run<F: FnMut() -> bool>(&self, mut predicate: F) -> AppResult<bool> {
        let start = Instant::now();
        let deadline = start.checked_add(self.timeout);
        let mut next_report = start + PROGRESS_EVERY;
        loop {
            if predicate() {
                return Ok(true);
            }
            self.interrupt.check()?;
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Ok(false);
            }
            let elapsed = now - start;
            if self.progress && now >= next_report {
                info!(
                    wait = %self.label,
                    elapsed_s = elapsed.as_secs_f64(),
                    timeout_s = self.timeout.as_secs_f64(),
                    "still waiting"
                );
                next_report += PROGRESS_EVERY;
            }
            let poll = if elapsed >= COARSE_AFTER {
                self.poll_interval.max(COARSE_POLL)
            } else {
                self.poll_interval
            };
            let poll = match deadline {
                Some(d) => poll.min(d - now),
                None => poll,
            };
            std::thread::sleep(poll);
        }
    }
}

/// Poll `predicate` for up to `timeout` seconds (negative: quietly) with the
/// given initial poll interval, observing the global user-abort flag.
pub fn retry_wait<F: FnMut() -> bool>(
    predicate: F,
    timeout: f64,
    poll_interval: Duration,
) -> AppResult<bool> {
    RetryWait::from_secs(timeout)
        .with_poll_interval(poll_interval)
        .run(predicate)
}

/// Sleep for `duration`, returning early with `Interrupted` on abort.
pub fn sleep(duration: Duration, interrupt: &Interrupt) -> AppResult<()> {
    RetryWait::new(duration)
        .quiet()
        .with_interrupt(interrupt)
        .run(|| false)
        .map(|_| ())
}

/// Block until `check` reports the event, in slices of at most
/// [`EVENT_SLICE`].
///
/// `check` receives the longest time it may block (for example on a condition
/// variable). Between slices the thread yields and the interrupt is observed.
/// Returns `Ok(false)` if `max_time` elapses first.
pub fn wait_on_event<F: FnMut(Duration) -> bool>(
    check: F,
    max_time: Option<Duration>,
    interrupt: &Interrupt,
) -> AppResult<bool> {
    wait_on_event_sliced(check, max_time, EVENT_SLICE, interrupt)
}

/// [`wait_on_event`] with a caller-chosen slice length.
pub fn wait_on_event_sliced<F: FnMut(Duration) -> bool>(
    mut check: F,
    max_time: Option<Duration>,
    slice: Duration,
    interrupt: &Interrupt,
) -> AppResult<bool> {
    let deadline = max_time.and_then(|t| Instant::now().checked_add(t));
    loop {
        let slice = match deadline {
            Some(d) => slice.min(d.saturating_duration_since(Instant::now())),
            None => slice,
        };
        if check(slice) {
            return Ok(true);
        }
        interrupt.check()?;
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return Ok(false);
            }
        }
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_wait_times_out() {
        let start = Instant::now();
        let done = RetryWait::new(Duration::from_millis(30))
            .with_interrupt(&Interrupt::new())
            .with_poll_interval(Duration::from_millis(5))
            .run(|| false)
            .unwrap();
        assert!(!done);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_zero_timeout_evaluates_once() {
        let mut calls = 0;
        let done = RetryWait::new(Duration::ZERO)
            .with_interrupt(&Interrupt::new())
            .run(|| {
                calls += 1;
                false
            })
            .unwrap();
        assert!(!done);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_negative_timeout_is_quiet() {
        let wait = RetryWait::from_secs(-0.25);
        assert!(!wait.progress);
        assert_eq!(wait.timeout(), Duration::from_millis(250));
        assert!(RetryWait::from_secs(0.25).progress);
    }

    #[test]
    fn test_unbounded_timeouts_have_no_deadline() {
        assert_eq!(RetryWait::from_secs(f64::INFINITY).timeout(), Duration::MAX);
        assert!(retry_wait(|| true, f64::INFINITY, Duration::from_millis(1)).unwrap());

        let mut calls = 0;
        let done = RetryWait::new(Duration::MAX)
            .with_interrupt(&Interrupt::new())
            .with_poll_interval(Duration::from_millis(1))
            .run(|| {
                calls += 1;
                calls == 3
            })
            .unwrap();
        assert!(done);

        let done = wait_on_event(|_| true, Some(Duration::MAX), &Interrupt::new()).unwrap();
        assert!(done);
    }

    #[test]
    fn test_interrupt_aborts_wait() {
        let interrupt = Interrupt::new();
        let remote = interrupt.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.trigger();
        });
        let result = RetryWait::new(Duration::from_secs(10))
            .with_interrupt(&interrupt)
            .run(|| false);
        handle.join().unwrap();
        assert!(matches!(result, Err(DaqError::Interrupted)));
    }

    #[test]
    fn test_wait_on_event_passes_bounded_slices() {
        let mut slices = Vec::new();
        let done = wait_on_event(
            |slice| {
                slices.push(slice);
                slices.len() == 3
            },
            None,
            &Interrupt::new(),
        )
        .unwrap();
        assert!(done);
        assert!(slices.iter().all(|s| *s <= EVENT_SLICE));
    }

    #[test]
    fn test_wait_on_event_respects_max_time() {
        let done = wait_on_event(
            |slice| {
                std::thread::sleep(slice);
                false
            },
            Some(Duration::from_millis(50)),
            &Interrupt::new(),
        )
        .unwrap();
        assert!(!done);
    }
}
