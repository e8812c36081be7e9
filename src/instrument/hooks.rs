//! Trigger/detect/cleanup callbacks driving an acquisition.
//!
//! How completion is detected (status polling, service request, fixed delay)
//! depends on the instrument and transport, so it is supplied by the driver
//! as an [`AsyncHooks`] implementation. The acquisition worker calls, with
//! the instrument lock held: `select` once, `trigger`, `detect` until it
//! returns true (or the cycle is cancelled), then `cleanup` exactly once.

use super::Instrument;
use crate::acquisition::AsyncRequest;
use crate::error::{AppResult, DaqError};
use crate::wait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Driver callbacks of the acquisition protocol.
pub trait AsyncHooks: Send + Sync + fmt::Debug {
    /// Prepare for the registered reads (for example enable channels).
    fn select(&self, _instr: &Instrument, _requests: &[AsyncRequest]) -> AppResult<()> {
        Ok(())
    }

    /// Start the measurement.
    fn trigger(&self, instr: &Instrument) -> AppResult<()>;

    /// Whether the measurement is complete, blocking at most `max_time`.
    fn detect(&self, instr: &Instrument, max_time: Duration) -> AppResult<bool>;

    /// Undo whatever `trigger` set up. Runs even when detection failed.
    fn cleanup(&self, _instr: &Instrument) -> AppResult<()> {
        Ok(())
    }
}

/// Fixed wait: complete `async_wait` seconds after the trigger.
#[derive(Debug, Default)]
pub struct WaitHooks {
    started: Mutex<Option<Instant>>,
}

impl WaitHooks {
    /// New, never triggered.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AsyncHooks for WaitHooks {
    fn trigger(&self, _instr: &Instrument) -> AppResult<()> {
        *self.started.lock() = Some(Instant::now());
        Ok(())
    }

    fn detect(&self, instr: &Instrument, max_time: Duration) -> AppResult<bool> {
        let Some(started) = *self.started.lock() else {
            return Ok(true);
        };
        let remaining = instr.async_wait().saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Ok(true);
        }
        wait::sleep(remaining.min(max_time), instr.interrupt())?;
        Ok(started.elapsed() >= instr.async_wait())
    }
}

/// Trigger with a command, then poll a status query until it returns the
/// expected reply (`*OPC?` style).
#[derive(Debug, Clone)]
pub struct CommandHooks {
    trigger: String,
    done_query: String,
    expected: String,
    poll_interval: Duration,
    cleanup: Option<String>,
}

impl CommandHooks {
    /// Send `trigger`, then ask `done_query` until it answers `expected`.
    pub fn new(trigger: &str, done_query: &str, expected: &str) -> Self {
        Self {
            trigger: trigger.to_string(),
            done_query: done_query.to_string(),
            expected: expected.to_string(),
            poll_interval: Duration::from_millis(20),
            cleanup: None,
        }
    }

    /// Interval between status queries.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Command sent after completion.
    pub fn with_cleanup(mut self, command: &str) -> Self {
        self.cleanup = Some(command.to_string());
        self
    }
}

impl AsyncHooks for CommandHooks {
    fn trigger(&self, instr: &Instrument) -> AppResult<()> {
        instr.write(&self.trigger)
    }

    fn detect(&self, instr: &Instrument, max_time: Duration) -> AppResult<bool> {
        let deadline = Instant::now() + max_time;
        loop {
            let reply = instr.ask(&self.done_query, false)?.into_text()?;
            if reply.trim() == self.expected {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            wait::sleep(self.poll_interval.min(deadline - now), instr.interrupt())?;
        }
    }

    fn cleanup(&self, instr: &Instrument) -> AppResult<()> {
        match &self.cleanup {
            Some(command) => instr.write(command),
            None => Ok(()),
        }
    }
}

type TriggerFn = Arc<dyn Fn(&Instrument) -> AppResult<()> + Send + Sync>;

#[derive(Default)]
struct Script {
    triggers: usize,
    detects: usize,
    cleanups: usize,
    selected: Vec<String>,
    polls_needed: usize,
    polls: usize,
    held: bool,
    fail_trigger: Option<String>,
    on_trigger: Option<TriggerFn>,
}

/// Programmable hooks for simulations and tests.
///
/// Detection completes after a configurable number of polls, or never while
/// [`hold`](Self::hold) is in effect. Every call is counted.
#[derive(Default)]
pub struct ScriptedHooks {
    script: Mutex<Script>,
}

impl fmt::Debug for ScriptedHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let script = self.script.lock();
        f.debug_struct("ScriptedHooks")
            .field("triggers", &script.triggers)
            .field("detects", &script.detects)
            .field("cleanups", &script.cleanups)
            .field("held", &script.held)
            .finish()
    }
}

impl ScriptedHooks {
    /// Detection completes on the first poll.
    pub fn new() -> Self {
        Self::default()
    }

    /// Detection completes on poll number `polls`.
    pub fn with_polls(self, polls: usize) -> Self {
        self.script.lock().polls_needed = polls;
        self
    }

    /// Run `f` on every trigger (for example to update simulated replies).
    pub fn on_trigger<F>(self, f: F) -> Self
    where
        F: Fn(&Instrument) -> AppResult<()> + Send + Sync + 'static,
    {
        self.script.lock().on_trigger = Some(Arc::new(f));
        self
    }

    /// Make the next trigger fail.
    pub fn fail_next_trigger(&self, message: &str) {
        self.script.lock().fail_trigger = Some(message.to_string());
    }

    /// Keep detection pending until [`release`](Self::release).
    pub fn hold(&self) {
        self.script.lock().held = true;
    }

    /// Let detection complete.
    pub fn release(&self) {
        self.script.lock().held = false;
    }

    /// Number of triggers.
    pub fn triggers(&self) -> usize {
        self.script.lock().triggers
    }

    /// Number of detector polls.
    pub fn detects(&self) -> usize {
        self.script.lock().detects
    }

    /// Number of cleanups.
    pub fn cleanups(&self) -> usize {
        self.script.lock().cleanups
    }

    /// Device names passed to the last `select`.
    pub fn selected(&self) -> Vec<String> {
        self.script.lock().selected.clone()
    }
}

impl AsyncHooks for ScriptedHooks {
    fn select(&self, _instr: &Instrument, requests: &[AsyncRequest]) -> AppResult<()> {
        self.script.lock().selected = requests.iter().map(|r| r.device.name().to_string()).collect();
        Ok(())
    }

    fn trigger(&self, instr: &Instrument) -> AppResult<()> {
        let on_trigger = {
            let mut script = self.script.lock();
            script.triggers += 1;
            script.polls = 0;
            if let Some(message) = script.fail_trigger.take() {
                return Err(DaqError::Communication(message));
            }
            script.on_trigger.clone()
        };
        match on_trigger {
            Some(f) => f(instr),
            None => Ok(()),
        }
    }

    fn detect(&self, instr: &Instrument, max_time: Duration) -> AppResult<bool> {
        {
            let mut script = self.script.lock();
            script.detects += 1;
            if !script.held {
                script.polls += 1;
                if script.polls >= script.polls_needed {
                    return Ok(true);
                }
            }
        }
        wait::sleep(max_time.min(Duration::from_millis(5)), instr.interrupt())?;
        Ok(false)
    }

    fn cleanup(&self, _instr: &Instrument) -> AppResult<()> {
        self.script.lock().cleanups += 1;
        Ok(())
    }
}
