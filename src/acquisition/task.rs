//! Background worker of one acquisition cycle.

use super::AsyncRequest;
use crate::error::{AppResult, DaqError};
use crate::instrument::Instrument;
use crate::value::Value;
use crate::wait::{Interrupt, RetryWait};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// What the worker leaves behind.
#[derive(Debug, Default)]
struct Outcome {
    finished: bool,
    failure: Option<String>,
    results: VecDeque<Value>,
}

#[derive(Debug, Default)]
struct Completion {
    outcome: Mutex<Outcome>,
    done: Condvar,
}

/// Caller-side handle blocking on the worker's completion.
#[derive(Debug, Clone)]
pub(crate) struct TaskWaiter {
    completion: Arc<Completion>,
}

impl TaskWaiter {
    /// Block up to `timeout`; true once the worker has finished.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut outcome = self.completion.outcome.lock();
        if !outcome.finished {
            self.completion.done.wait_for(&mut outcome, timeout);
        }
        outcome.finished
    }
}

/// One cycle: registered requests, the worker thread and its results.
#[derive(Debug)]
pub(crate) struct AsyncTask {
    id: u64,
    requests: Vec<AsyncRequest>,
    delay: Duration,
    checking: bool,
    cancel: Interrupt,
    completion: Arc<Completion>,
    handle: Option<JoinHandle<()>>,
    collected: usize,
}

impl AsyncTask {
    pub(crate) fn new(id: u64, delay: Duration, checking: bool) -> Self {
        Self {
            id,
            requests: Vec::new(),
            delay,
            checking,
            cancel: Interrupt::new(),
            completion: Arc::new(Completion::default()),
            handle: None,
            collected: 0,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn register(&mut self, request: AsyncRequest) {
        self.requests.push(request);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn waiter(&self) -> TaskWaiter {
        TaskWaiter {
            completion: Arc::clone(&self.completion),
        }
    }

    /// Spawn the worker thread.
    pub(crate) fn start(&mut self, instrument: Arc<Instrument>) -> AppResult<()> {
        let job = Job {
            requests: self.requests.clone(),
            delay: self.delay,
            checking: self.checking,
            cancel: self.cancel.clone(),
            completion: Arc::clone(&self.completion),
        };
        let handle = thread::Builder::new()
            .name(format!("async-{}", instrument.name()))
            .spawn(move || job.run(&instrument))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Failure reported by a finished worker.
    pub(crate) fn failure(&self) -> Option<String> {
        self.completion.outcome.lock().failure.clone()
    }

    pub(crate) fn first_request(&self) -> Option<&AsyncRequest> {
        self.requests.first()
    }

    /// Next request expected by stage 3.
    pub(crate) fn next_request(&self) -> Option<&AsyncRequest> {
        self.requests.get(self.collected)
    }

    /// Pop the next result in registration order.
    pub(crate) fn take_result(&mut self) -> AppResult<Value> {
        let value = self
            .completion
            .outcome
            .lock()
            .results
            .pop_front()
            .ok_or_else(|| DaqError::AsyncFailed("no result left to collect".into()))?;
        self.collected += 1;
        Ok(value)
    }

    /// Whether every registered result has been collected.
    pub(crate) fn is_drained(&self) -> bool {
        self.collected >= self.requests.len()
    }

    /// Ask the worker to stop at its next sleep or poll point.
    pub(crate) fn cancel(&self) {
        self.cancel.trigger();
    }

    /// Join a worker that has already finished.
    pub(crate) fn finish(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(task = self.id, "Acquisition worker panicked");
            }
        }
    }
}

impl Drop for AsyncTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel.trigger();
        }
    }
}

/// State moved into the worker thread.
struct Job {
    requests: Vec<AsyncRequest>,
    delay: Duration,
    checking: bool,
    cancel: Interrupt,
    completion: Arc<Completion>,
}

impl Job {
    fn run(self, instrument: &Instrument) {
        let mut results = VecDeque::with_capacity(self.requests.len());
        let outcome = self.acquire(instrument, &mut results);
        let failure = match outcome {
            Ok(()) => None,
            Err(DaqError::Interrupted) => {
                debug!(instrument = %instrument.name(), "Acquisition cancelled");
                Some("cancelled".to_string())
            }
            Err(err) => {
                warn!(instrument = %instrument.name(), error = %err, "Acquisition failed");
                Some(err.to_string())
            }
        };
        let mut state = self.completion.outcome.lock();
        state.results = results;
        state.failure = failure;
        state.finished = true;
        self.completion.done.notify_all();
    }

    fn acquire(&self, instr: &Instrument, results: &mut VecDeque<Value>) -> AppResult<()> {
        let _guard = instr.lock_ref().acquire_observing(&self.cancel)?;
        let hooks = instr.hooks();
        hooks.select(instr, &self.requests)?;

        if !self.checking && !self.delay.is_zero() {
            RetryWait::new(self.delay)
                .quiet()
                .with_poll_interval(instr.timing().delay_poll)
                .with_interrupt(&self.cancel)
                .run(|| false)?;
        }
        self.cancel.check()?;

        if !self.checking && self.requests.iter().any(|r| r.device.is_trig()) {
            let triggered = hooks.trigger(instr).and_then(|()| self.detect(instr));
            let cleaned = hooks.cleanup(instr);
            triggered?;
            cleaned?;
        }
        self.cancel.check()?;

        for request in &self.requests {
            results.push_back(request.device.get_now(instr, &request.options)?);
        }
        debug!(instrument = %instr.name(), count = results.len(), "Acquisition complete");
        Ok(())
    }

    fn detect(&self, instr: &Instrument) -> AppResult<()> {
        let slice = instr.timing().detect_slice;
        loop {
            self.cancel.check()?;
            if instr.hooks().detect(instr, slice)? {
                return Ok(());
            }
        }
    }
}
