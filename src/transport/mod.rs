//! Transport boundary used by instruments.
//!
//! The core never speaks a wire protocol itself: drivers inject a
//! [`Transport`] and devices hand it fully formatted commands. Every call is
//! made while the instrument's composed lock is held.
//!
//! [`SpacedTransport`] wraps any transport to enforce a minimum delay between
//! consecutive writes and between a read and the next write. The timestamps
//! live either in this process or in a [`SharedRecord`] shared with other
//! processes driving the same instrument.

mod mock;

pub use mock::MockTransport;

use crate::codec::Wire;
use crate::error::{AppResult, DaqError};
use crate::lock::shared::SharedRecord;
use crate::wait::{self, Interrupt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Byte/text I/O with one instrument.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send one command.
    fn write(&self, command: &str) -> AppResult<()>;

    /// Read one reply; `raw` asks for bytes instead of text.
    fn read(&self, raw: bool) -> AppResult<Wire>;

    /// Write a query and read its reply.
    fn ask(&self, command: &str, raw: bool) -> AppResult<Wire> {
        self.write(command)?;
        self.read(raw)
    }

    /// Resource description (address) for logs and shared-record names.
    fn description(&self) -> String {
        "transport".to_string()
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn write(&self, command: &str) -> AppResult<()> {
        (**self).write(command)
    }

    fn read(&self, raw: bool) -> AppResult<Wire> {
        (**self).read(raw)
    }

    fn ask(&self, command: &str, raw: bool) -> AppResult<Wire> {
        (**self).ask(command, raw)
    }

    fn description(&self) -> String {
        (**self).description()
    }
}

/// Transport of instruments made only of memory or computed devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn write(&self, command: &str) -> AppResult<()> {
        Err(DaqError::NotImplemented(format!(
            "no transport to send {command:?}"
        )))
    }

    fn read(&self, _raw: bool) -> AppResult<Wire> {
        Err(DaqError::NotImplemented("no transport to read from".into()))
    }

    fn description(&self) -> String {
        "none".to_string()
    }
}

// =============================================================================
// Read/write spacing
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct LocalTimes {
    write_us: Option<u64>,
    read_us: Option<u64>,
}

/// Where the last write/read timestamps are kept.
#[derive(Debug)]
enum TimingRecord {
    Local(Mutex<LocalTimes>),
    Shared(Arc<SharedRecord>),
}

impl TimingRecord {
    fn local() -> Self {
        TimingRecord::Local(Mutex::new(LocalTimes::default()))
    }

    fn last_write(&self) -> Option<u64> {
        match self {
            TimingRecord::Local(t) => t.lock().write_us,
            TimingRecord::Shared(r) => r.last_write_us(),
        }
    }

    fn last_read(&self) -> Option<u64> {
        match self {
            TimingRecord::Local(t) => t.lock().read_us,
            TimingRecord::Shared(r) => r.last_read_us(),
        }
    }

    fn mark_write(&self, now: u64) {
        match self {
            TimingRecord::Local(t) => t.lock().write_us = Some(now),
            TimingRecord::Shared(r) => r.set_last_write_us(now),
        }
    }

    fn mark_read(&self, now: u64) {
        match self {
            TimingRecord::Local(t) => t.lock().read_us = Some(now),
            TimingRecord::Shared(r) => r.set_last_read_us(now),
        }
    }
}

fn now_us() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or_default()
}

/// Enforces minimum write/write and read/write delays around an inner transport.
#[derive(Debug)]
pub struct SpacedTransport<T> {
    inner: T,
    write_write: Duration,
    read_write: Duration,
    record: TimingRecord,
    interrupt: Interrupt,
}

impl<T: Transport> SpacedTransport<T> {
    /// Wrap `inner` with a process-local timing record and no spacing.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            write_write: Duration::ZERO,
            read_write: Duration::ZERO,
            record: TimingRecord::local(),
            interrupt: Interrupt::global().clone(),
        }
    }

    /// Minimum delay between two writes.
    pub fn with_write_write(mut self, delay: Duration) -> Self {
        self.write_write = delay;
        self
    }

    /// Minimum delay between a read and the next write.
    pub fn with_read_write(mut self, delay: Duration) -> Self {
        self.read_write = delay;
        self
    }

    /// Keep timestamps in a shared record.
    pub fn with_shared_record(mut self, record: Arc<SharedRecord>) -> Self {
        self.record = TimingRecord::Shared(record);
        self
    }

    /// Abort spacing waits on `interrupt`.
    pub fn with_interrupt(mut self, interrupt: &Interrupt) -> Self {
        self.interrupt = interrupt.clone();
        self
    }

    /// Wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn wait_before_write(&self) -> AppResult<()> {
        let due = |last: Option<u64>, gap: Duration| {
            last.map_or(0, |t| t.saturating_add(gap.as_micros() as u64))
        };
        let ready_at = due(self.record.last_write(), self.write_write)
            .max(due(self.record.last_read(), self.read_write));
        let now = now_us();
        if ready_at > now {
            let delay = Duration::from_micros(ready_at - now);
            trace!(delay_us = delay.as_micros() as u64, "Spacing write");
            wait::sleep(delay, &self.interrupt)?;
        }
        Ok(())
    }
}

impl<T: Transport> Transport for SpacedTransport<T> {
    fn write(&self, command: &str) -> AppResult<()> {
        self.wait_before_write()?;
        let result = self.inner.write(command);
        self.record.mark_write(now_us());
        result
    }

    fn read(&self, raw: bool) -> AppResult<Wire> {
        let result = self.inner.read(raw);
        self.record.mark_read(now_us());
        result
    }

    fn description(&self) -> String {
        self.inner.description()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_null_transport_refuses_io() {
        assert!(matches!(
            NullTransport.write("*RST"),
            Err(DaqError::NotImplemented(_))
        ));
        assert!(NullTransport.ask("*IDN?", false).is_err());
    }

    #[test]
    fn test_write_write_spacing() {
        let transport = SpacedTransport::new(MockTransport::new())
            .with_write_write(Duration::from_millis(30))
            .with_interrupt(&Interrupt::new());
        let start = Instant::now();
        transport.write("A 1").unwrap();
        transport.write("A 2").unwrap();
        transport.write("A 3").unwrap();
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(transport.inner().writes(), vec!["A 1", "A 2", "A 3"]);
    }

    #[test]
    fn test_read_write_spacing_through_shared_record() {
        let dir = tempfile::tempdir().unwrap();
        let record = Arc::new(SharedRecord::attach(&dir.path().join("t.shm")).unwrap());
        let mock = MockTransport::new().with_reply("V?", "1.0");
        let transport = SpacedTransport::new(mock)
            .with_read_write(Duration::from_millis(40))
            .with_shared_record(Arc::clone(&record))
            .with_interrupt(&Interrupt::new());
        transport.ask("V?", false).unwrap();
        assert!(record.last_read_us().is_some());
        let start = Instant::now();
        transport.write("V 2").unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
