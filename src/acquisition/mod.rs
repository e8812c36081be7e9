//! Staged asynchronous acquisition.
//!
//! Reading a triggered device means: arm the hardware, wait for it to report
//! completion, then read the result. To overlap the waits of several
//! instruments in one sweep, each instrument runs the cycle as four stages:
//!
//! | stage | effect | allowed at level |
//! |---|---|---|
//! | 0 `Register` | queue a (device, options) read; the first call creates the task | idle, registering |
//! | 1 `Start` | spawn the worker (delay, trigger, detect, cleanup, reads) | registering, started |
//! | 2 `Wait` | block the caller until the worker is done | started, waited (before any collect) |
//! | 3 `Collect` | return the next result in registration order | waited |
//!
//! Levels: idle (-1), registering (0), started (1), waited (2). Any other
//! request is a protocol violation: the task is cancelled, the instrument
//! returns to idle and `ProtocolOrder` is returned. Collecting the last result
//! also returns the instrument to idle.
//!
//! A cycle belongs to the thread that registered its first read. Stages
//! requested by any other thread wait (interruptibly, bounded by the lock
//! timeout) until that cycle is over, so concurrent reads queue up instead of
//! tearing each other down.
//!
//! [`read_all`] drives the stages over several instruments at once.

mod task;

use task::AsyncTask;

use crate::device::{Device, OptionValues};
use crate::error::{AppResult, DaqError};
use crate::instrument::Instrument;
use crate::value::Value;
use crate::wait::{self, RetryWait};
use parking_lot::MutexGuard;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, warn};

/// A requested stage of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncStage {
    /// Queue a device read.
    Register,
    /// Start the worker.
    Start,
    /// Wait for the worker.
    Wait,
    /// Collect one result.
    Collect,
}

impl AsyncStage {
    /// Stage number (0 to 3).
    pub fn number(self) -> i8 {
        match self {
            AsyncStage::Register => 0,
            AsyncStage::Start => 1,
            AsyncStage::Wait => 2,
            AsyncStage::Collect => 3,
        }
    }

    /// Stage from its number.
    pub fn from_number(n: i8) -> AppResult<Self> {
        match n {
            0 => Ok(AsyncStage::Register),
            1 => Ok(AsyncStage::Start),
            2 => Ok(AsyncStage::Wait),
            3 => Ok(AsyncStage::Collect),
            other => Err(DaqError::InvalidArgument(format!("no async stage {other}"))),
        }
    }
}

impl fmt::Display for AsyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Progress of the instrument's current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncLevel {
    /// No cycle in progress.
    #[default]
    Idle,
    /// Reads are being registered.
    Registering,
    /// The worker is running.
    Started,
    /// The worker has finished; results are being collected.
    Waited,
}

impl AsyncLevel {
    /// Level number (-1 to 2).
    pub fn number(self) -> i8 {
        match self {
            AsyncLevel::Idle => -1,
            AsyncLevel::Registering => 0,
            AsyncLevel::Started => 1,
            AsyncLevel::Waited => 2,
        }
    }
}

/// One queued read.
#[derive(Debug, Clone)]
pub struct AsyncRequest {
    /// Device to read.
    pub device: Arc<Device>,
    /// Options of the read.
    pub options: OptionValues,
}

/// Per-instrument protocol state.
#[derive(Debug, Default)]
pub(crate) struct AsyncState {
    level: AsyncLevel,
    collecting: bool,
    task: Option<AsyncTask>,
    owner: Option<ThreadId>,
    next_id: u64,
}

impl AsyncState {
    pub(crate) fn level(&self) -> AsyncLevel {
        self.level
    }

    /// Cancel any task and return to idle.
    pub(crate) fn reset(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel();
        }
        self.level = AsyncLevel::Idle;
        self.collecting = false;
        self.owner = None;
    }

    /// No cycle in progress, or one started by `thread`.
    fn free_for(&self, thread: ThreadId) -> bool {
        self.owner.is_none() || self.owner == Some(thread)
    }

    fn allows(&self, stage: AsyncStage) -> bool {
        use AsyncLevel::*;
        match stage {
            AsyncStage::Register => matches!(self.level, Idle | Registering),
            AsyncStage::Start => matches!(self.level, Registering | Started),
            AsyncStage::Wait => {
                self.level == Started || (self.level == Waited && !self.collecting)
            }
            AsyncStage::Collect => self.level == Waited,
        }
    }

    fn violation(&mut self, instrument: &str, stage: AsyncStage) -> DaqError {
        let level = self.level.number();
        warn!(instrument, stage = stage.number(), level, "Async stages out of order, cancelling");
        self.reset();
        DaqError::ProtocolOrder {
            requested: stage.number(),
            level,
        }
    }
}

/// Run one stage for `device` on `instr`.
pub(crate) fn run_stage(
    instr: &Arc<Instrument>,
    stage: AsyncStage,
    device: &Arc<Device>,
    options: &OptionValues,
) -> AppResult<Option<Value>> {
    let name = instr.name();
    let mut state = claim(instr)?;
    if !state.allows(stage) {
        return Err(state.violation(name, stage));
    }
    debug!(instrument = %name, device = %device.name(), %stage, "Async stage");
    match stage {
        AsyncStage::Register => {
            if !Arc::ptr_eq(&device.instrument()?, instr) {
                return Err(DaqError::InvalidArgument(format!(
                    "{} does not belong to {name}",
                    device.name()
                )));
            }
            if state.task.is_none() {
                state.next_id += 1;
                let task = AsyncTask::new(state.next_id, instr.async_delay(), instr.is_checking());
                state.task = Some(task);
                state.owner = Some(thread::current().id());
                state.level = AsyncLevel::Registering;
            }
            if let Some(task) = state.task.as_mut() {
                task.register(AsyncRequest {
                    device: Arc::clone(device),
                    options: options.clone(),
                });
            }
            Ok(None)
        }
        AsyncStage::Start => {
            if state.level == AsyncLevel::Registering {
                let started = match state.task.as_mut() {
                    Some(task) if task.is_started() => Ok(()),
                    Some(task) => task.start(Arc::clone(instr)),
                    None => Err(DaqError::AsyncFailed("no task to start".into())),
                };
                if let Err(err) = started {
                    state.reset();
                    return Err(err);
                }
                state.level = AsyncLevel::Started;
            }
            Ok(None)
        }
        AsyncStage::Wait => {
            let Some((id, waiter)) = state.task.as_ref().map(|t| (t.id(), t.waiter())) else {
                state.reset();
                return Err(DaqError::AsyncFailed("no task to wait for".into()));
            };
            drop(state);

            let slice = instr.timing().wait_slice;
            let waited = instr.lock_ref().released_while(|| {
                wait::wait_on_event_sliced(|t| waiter.wait(t), None, slice, instr.interrupt())
            });

            let mut state = instr.async_state().lock();
            if state.task.as_ref().map(AsyncTask::id) != Some(id) {
                return Err(DaqError::AsyncFailed(
                    "acquisition was reset while waiting".into(),
                ));
            }
            if let Err(err) = waited.and_then(|inner| inner) {
                state.reset();
                return Err(err);
            }
            if let Some(failure) = state.task.as_ref().and_then(AsyncTask::failure) {
                state.reset();
                return Err(DaqError::AsyncFailed(failure));
            }
            state.level = AsyncLevel::Waited;
            Ok(None)
        }
        AsyncStage::Collect => {
            let expected = state
                .task
                .as_ref()
                .and_then(AsyncTask::next_request)
                .map(|r| Arc::clone(&r.device));
            if !expected.is_some_and(|d| Arc::ptr_eq(&d, device)) {
                return Err(state.violation(name, stage));
            }
            state.collecting = true;
            let value = match state.task.as_mut().map(AsyncTask::take_result) {
                Some(Ok(value)) => value,
                Some(Err(err)) => {
                    state.reset();
                    return Err(err);
                }
                None => return Err(state.violation(name, stage)),
            };
            device.cache().store_local(value.clone());
            if state.task.as_ref().is_some_and(AsyncTask::is_drained) {
                if let Some(task) = state.task.take() {
                    task.finish();
                }
                state.level = AsyncLevel::Idle;
                state.collecting = false;
                state.owner = None;
                debug!(instrument = %name, "Async cycle complete");
            }
            Ok(Some(value))
        }
    }
}

/// Lock the protocol state for the calling thread, first waiting out a cycle
/// owned by another thread. The caller's instrument lock is released during
/// that wait so the other cycle can finish.
fn claim(instr: &Instrument) -> AppResult<MutexGuard<'_, AsyncState>> {
    let me = thread::current().id();
    loop {
        let state = instr.async_state().lock();
        if state.free_for(me) {
            return Ok(state);
        }
        drop(state);
        debug!(instrument = %instr.name(), "Waiting for another thread's acquisition");
        let timing = instr.timing();
        let free = instr.lock_ref().released_while(|| {
            RetryWait::new(timing.lock_timeout.unwrap_or(Duration::MAX))
                .with_poll_interval(timing.lock_poll)
                .with_interrupt(instr.interrupt())
                .with_label(format!("acquisition on {}", instr.name()))
                .run(|| instr.async_state().lock().free_for(me))
        })??;
        if !free {
            return Err(DaqError::LockTimeout {
                lock: format!("{} acquisition", instr.name()),
                waited: timing.lock_timeout.unwrap_or_default(),
            });
        }
    }
}

/// Reset `instr` if the calling thread owns its cycle.
fn abandon(instr: &Instrument) {
    let mut state = instr.async_state().lock();
    if state.owner == Some(thread::current().id()) {
        state.reset();
    }
}

/// Full cycle for one triggered device. Waits for cycles of other threads;
/// the calling thread must not be inside a cycle of its own.
pub(crate) fn read_triggered(
    instr: &Arc<Instrument>,
    device: &Arc<Device>,
    options: &OptionValues,
) -> AppResult<Value> {
    {
        let mut state = claim(instr)?;
        if state.level() != AsyncLevel::Idle {
            return Err(state.violation(instr.name(), AsyncStage::Register));
        }
    }
    let cycle = || -> AppResult<Value> {
        for stage in [AsyncStage::Register, AsyncStage::Start, AsyncStage::Wait] {
            run_stage(instr, stage, device, options)?;
        }
        run_stage(instr, AsyncStage::Collect, device, options)?
            .ok_or_else(|| DaqError::AsyncFailed("no value collected".into()))
    };
    cycle().inspect_err(|_| abandon(instr))
}

/// Read several devices, possibly on several instruments, overlapping the
/// trigger waits.
///
/// Triggered devices go through stages 0 to 3 (each instrument waited on
/// once); the others are read directly in between. Values come back in
/// request order. On any error every involved instrument whose cycle this
/// call owns is reset.
///
/// # Example
///
/// ```
/// use instrument_core::acquisition::read_all;
/// use instrument_core::device::{DeviceBuilder, OptionValues};
/// use instrument_core::instrument::Instrument;
/// use instrument_core::transport::NullTransport;
/// use instrument_core::value::Value;
///
/// let instr = Instrument::builder("sim", NullTransport).build().unwrap();
/// let a = instr.add_device(DeviceBuilder::memory("a", 1.0).trig()).unwrap();
/// let b = instr.add_device(DeviceBuilder::memory("b", 2.0)).unwrap();
/// let values = read_all(&[(a, OptionValues::new()), (b, OptionValues::new())]).unwrap();
/// assert_eq!(values, vec![Value::Float(1.0), Value::Float(2.0)]);
/// ```
pub fn read_all(requests: &[(Arc<Device>, OptionValues)]) -> AppResult<Vec<Value>> {
    let mut instruments: Vec<Arc<Instrument>> = Vec::new();
    let mut plan = Vec::with_capacity(requests.len());
    for (device, options) in requests {
        let instr = device.instrument()?;
        let triggered = device.is_trig() && !instr.is_checking();
        if triggered && !instruments.iter().any(|i| Arc::ptr_eq(i, &instr)) {
            instruments.push(Arc::clone(&instr));
        }
        plan.push((device, options, instr, triggered));
    }

    let run = || -> AppResult<Vec<Value>> {
        for (device, options, instr, triggered) in &plan {
            if *triggered {
                run_stage(instr, AsyncStage::Register, device, options)?;
            }
        }
        for stage in [AsyncStage::Start, AsyncStage::Wait] {
            for instr in &instruments {
                run_instrument_stage(instr, stage)?;
            }
        }
        let mut values = Vec::with_capacity(plan.len());
        for (device, options, instr, triggered) in &plan {
            let value = if *triggered {
                run_stage(instr, AsyncStage::Collect, device, options)?
                    .ok_or_else(|| DaqError::AsyncFailed("no value collected".into()))?
            } else {
                device.get_with(options)?
            };
            values.push(value);
        }
        Ok(values)
    };
    run().inspect_err(|_| {
        for instr in &instruments {
            abandon(instr);
        }
    })
}

/// Stage 1 or 2 for an instrument, using its first registered device.
fn run_instrument_stage(instr: &Arc<Instrument>, stage: AsyncStage) -> AppResult<()> {
    let device = {
        let state = instr.async_state().lock();
        state
            .task
            .as_ref()
            .and_then(|t| t.first_request())
            .map(|r| Arc::clone(&r.device))
    };
    match device {
        Some(device) => run_stage(instr, stage, &device, &OptionValues::new()).map(|_| ()),
        None => {
            let mut state = claim(instr)?;
            Err(state.violation(instr.name(), stage))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_window() {
        let mut state = AsyncState::default();
        assert!(state.allows(AsyncStage::Register));
        assert!(!state.allows(AsyncStage::Start));
        assert!(!state.allows(AsyncStage::Wait));
        assert!(!state.allows(AsyncStage::Collect));

        state.level = AsyncLevel::Started;
        assert!(!state.allows(AsyncStage::Register));
        assert!(state.allows(AsyncStage::Start));
        assert!(state.allows(AsyncStage::Wait));

        state.level = AsyncLevel::Waited;
        assert!(state.allows(AsyncStage::Wait));
        state.collecting = true;
        assert!(!state.allows(AsyncStage::Wait));
        assert!(state.allows(AsyncStage::Collect));
        assert!(!state.allows(AsyncStage::Start));
    }

    #[test]
    fn test_violation_resets_to_idle() {
        let mut state = AsyncState {
            level: AsyncLevel::Registering,
            ..AsyncState::default()
        };
        let err = state.violation("dmm", AsyncStage::Wait);
        assert!(matches!(err, DaqError::ProtocolOrder { requested: 2, level: 0 }));
        assert_eq!(state.level(), AsyncLevel::Idle);
    }

    #[test]
    fn test_cycle_belongs_to_registering_thread() {
        let me = thread::current().id();
        let other = thread::spawn(|| thread::current().id()).join().unwrap();
        let mut state = AsyncState::default();
        assert!(state.free_for(other));
        state.owner = Some(me);
        state.level = AsyncLevel::Registering;
        assert!(state.free_for(me));
        assert!(!state.free_for(other));
        state.reset();
        assert!(state.free_for(other));
    }

    #[test]
    fn test_stage_numbers() {
        for n in 0..4 {
            assert_eq!(AsyncStage::from_number(n).unwrap().number(), n);
        }
        assert!(AsyncStage::from_number(4).is_err());
        assert_eq!(AsyncLevel::Idle.number(), -1);
    }
}
