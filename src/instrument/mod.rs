//! One physical instrument: transport, lock, devices and acquisition state.
//!
//! An [`Instrument`] owns its [`Device`]s (devices keep a weak back-reference),
//! the composed lock serializing every transport call, and the state of the
//! staged acquisition protocol (see [`crate::acquisition`]). Dropping the
//! instrument cancels a pending acquisition.
//!
//! Every instrument carries three built-in devices:
//!
//! - `async_delay`: seconds to wait between stage 1 and the trigger;
//! - `async_wait`: duration used by the default [`WaitHooks`] detector;
//! - `header`: name prefixed to device names in output files.
//!
//! # Example
//!
//! ```
//! use instrument_core::device::DeviceBuilder;
//! use instrument_core::instrument::Instrument;
//! use instrument_core::transport::MockTransport;
//! use instrument_core::value::Value;
//!
//! let mock = MockTransport::new().with_reply("*IDN?", "ACME,DMM100,42,1.2");
//! let dmm = Instrument::builder("dmm", mock).build().unwrap();
//! let volt = dmm.add_device(DeviceBuilder::scpi("volt", "VOLT")).unwrap();
//! volt.set(1.5).unwrap();
//! assert_eq!(volt.get().unwrap(), Value::Float(1.5));
//! assert_eq!(dmm.idn_split().unwrap().model, "DMM100");
//! ```

mod hooks;

pub use hooks::{AsyncHooks, CommandHooks, ScriptedHooks, WaitHooks};

use crate::acquisition::{self, AsyncLevel, AsyncStage, AsyncState};
use crate::codec::Wire;
use crate::config::Settings;
use crate::device::{Device, DeviceBuilder, HeaderFn, OptionValues};
use crate::error::{AppResult, DaqError};
use crate::limits::Limits;
use crate::lock::shared::{SharedMemoryLock, SharedRecord};
use crate::lock::{ComposedGuard, ComposedLock, ExtraLock, ForceReleaseReport, NoExtraLock};
use crate::transport::Transport;
use crate::value::Value;
use crate::wait::Interrupt;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Names of the built-in devices.
pub const BUILTIN_DEVICES: [&str; 3] = ["async_delay", "async_wait", "header"];

/// Timing knobs of one instrument, taken from [`Settings`].
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentTiming {
    /// Poll interval of lock acquisition.
    pub lock_poll: Duration,
    /// Lock acquisition timeout (`None`: until interrupted).
    pub lock_timeout: Option<Duration>,
    /// Poll interval of the pre-trigger delay.
    pub delay_poll: Duration,
    /// Longest single detector call.
    pub detect_slice: Duration,
    /// Slice of the stage-2 wait.
    pub wait_slice: Duration,
    /// Minimum time between two `force_get` passes.
    pub force_get_interval: Duration,
}

impl Default for InstrumentTiming {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for InstrumentTiming {
    fn from(settings: &Settings) -> Self {
        Self {
            lock_poll: settings.lock.poll_interval,
            lock_timeout: settings.lock.timeout,
            delay_poll: settings.acquisition.delay_poll,
            detect_slice: settings.acquisition.detect_slice,
            wait_slice: settings.acquisition.wait_slice,
            force_get_interval: settings.instrument.force_get_interval,
        }
    }
}

/// Parsed `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Idn {
    /// Manufacturer.
    pub vendor: String,
    /// Model.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Firmware version.
    pub firmware: String,
}

impl Idn {
    /// Split `vendor,model,serial,firmware`; missing parts are empty and
    /// extra commas stay in the firmware field.
    pub fn parse(reply: &str) -> Self {
        let mut parts = reply.trim().splitn(4, ',').map(|s| s.trim().to_string());
        Self {
            vendor: parts.next().unwrap_or_default(),
            model: parts.next().unwrap_or_default(),
            serial: parts.next().unwrap_or_default(),
            firmware: parts.next().unwrap_or_default(),
        }
    }
}

// =============================================================================
// Instrument
// =============================================================================

/// A physical instrument and its devices.
pub struct Instrument {
    name: String,
    self_ref: Weak<Instrument>,
    transport: Arc<dyn Transport>,
    lock: ComposedLock,
    hooks: Arc<dyn AsyncHooks>,
    devices: RwLock<Vec<Arc<Device>>>,
    async_state: Mutex<AsyncState>,
    checking: AtomicBool,
    last_force_get: Mutex<Option<Instant>>,
    timing: InstrumentTiming,
    interrupt: Interrupt,
    config_header: Option<HeaderFn>,
    idn: Mutex<Option<String>>,
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("name", &self.name)
            .field("transport", &self.transport.description())
            .field("devices", &self.device_names())
            .field("checking", &self.is_checking())
            .finish()
    }
}

impl Instrument {
    /// Start describing an instrument reached through `transport`.
    pub fn builder(name: impl Into<String>, transport: impl Transport + 'static) -> InstrumentBuilder {
        InstrumentBuilder::new(name, transport)
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport description.
    pub fn address(&self) -> String {
        self.transport.description()
    }

    // -------------------------------------------------------------------------
    // devices
    // -------------------------------------------------------------------------

    /// Create a device on this instrument.
    pub fn add_device(&self, builder: DeviceBuilder) -> AppResult<Arc<Device>> {
        // Built outside the map lock: validating the initial value may read
        // other devices of this instrument.
        let device = builder.build(self.self_ref.clone())?;
        let mut devices = self.devices.write();
        if devices.iter().any(|d| d.name() == device.name()) {
            return Err(DaqError::DuplicateDevice(device.name().to_string()));
        }
        debug!(instrument = %self.name, device = %device.name(), "Device added");
        devices.push(Arc::clone(&device));
        Ok(device)
    }

    /// Device by name.
    pub fn device(&self, name: &str) -> AppResult<Arc<Device>> {
        self.devices
            .read()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| DaqError::UnknownDevice(format!("{}.{name}", self.name)))
    }

    /// All devices, built-ins first, in creation order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    fn device_names(&self) -> Vec<String> {
        self.devices.read().iter().map(|d| d.name().to_string()).collect()
    }

    fn builtin_value(&self, name: &str) -> Option<Value> {
        self.device(name).ok().and_then(|d| d.cache().shared())
    }

    fn builtin_seconds(&self, name: &str) -> Duration {
        self.builtin_value(name)
            .and_then(|v| v.as_f64())
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_default()
    }

    /// Pre-trigger delay (`async_delay`).
    pub fn async_delay(&self) -> Duration {
        self.builtin_seconds("async_delay")
    }

    /// Fixed acquisition time used by [`WaitHooks`] (`async_wait`).
    pub fn async_wait(&self) -> Duration {
        self.builtin_seconds("async_wait")
    }

    /// Name used in output headers (`header`), defaulting to the instrument name.
    pub fn header_name(&self) -> String {
        match self.builtin_value("header") {
            Some(Value::Text(s)) if !s.is_empty() => s,
            _ => self.name.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // transport
    // -------------------------------------------------------------------------

    /// Take the composed lock.
    pub fn lock(&self) -> AppResult<ComposedGuard<'_>> {
        self.lock.acquire()
    }

    /// Send a command under the lock.
    pub fn write(&self, command: &str) -> AppResult<()> {
        let _guard = self.lock()?;
        trace!(instrument = %self.name, command, "write");
        self.transport.write(command)
    }

    /// Read a reply under the lock.
    pub fn read(&self, raw: bool) -> AppResult<Wire> {
        let _guard = self.lock()?;
        self.transport.read(raw)
    }

    /// Query under the lock.
    pub fn ask(&self, command: &str, raw: bool) -> AppResult<Wire> {
        let _guard = self.lock()?;
        trace!(instrument = %self.name, command, "ask");
        self.transport.ask(command, raw)
    }

    /// Unwind the lock unconditionally (recovery after a crashed caller).
    pub fn lock_force_release(&self) -> AppResult<ForceReleaseReport> {
        self.lock.force_release()
    }

    /// Whether the calling thread holds the lock.
    pub fn lock_is_owned(&self) -> bool {
        self.lock.is_owned()
    }

    // -------------------------------------------------------------------------
    // checking mode
    // -------------------------------------------------------------------------

    /// Whether hardware I/O is replaced by validation only.
    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::SeqCst)
    }

    /// Enter or leave checking mode; returns the previous state.
    pub fn set_checking(&self, on: bool) -> bool {
        self.checking.swap(on, Ordering::SeqCst)
    }

    /// Checking mode `on` until the guard is dropped.
    pub fn checking_scope(&self, on: bool) -> CheckingGuard<'_> {
        let previous = self.set_checking(on);
        CheckingGuard {
            instrument: self,
            previous,
        }
    }

    // -------------------------------------------------------------------------
    // acquisition
    // -------------------------------------------------------------------------

    /// Run one stage of the acquisition protocol for `device`.
    pub fn get_async(
        self: &Arc<Self>,
        stage: AsyncStage,
        device: &Arc<Device>,
        options: &OptionValues,
    ) -> AppResult<Option<Value>> {
        acquisition::run_stage(self, stage, device, options)
    }

    /// Full trigger/wait/collect cycle for one device.
    pub fn read_triggered(self: &Arc<Self>, device: &Arc<Device>, options: &OptionValues) -> AppResult<Value> {
        acquisition::read_triggered(self, device, options)
    }

    /// Cancel any cycle in progress and return to idle.
    pub fn async_reset(&self) {
        self.async_state.lock().reset();
    }

    /// Current protocol level.
    pub fn async_level(&self) -> AsyncLevel {
        self.async_state.lock().level()
    }

    /// Trigger and wait for completion synchronously, under the lock.
    /// Cleanup always runs once the trigger was attempted.
    pub fn run_and_wait(&self) -> AppResult<()> {
        let _guard = self.lock()?;
        if self.is_checking() {
            return Ok(());
        }
        let triggered = self.hooks.trigger(self).and_then(|()| self.wait_after_trig());
        let cleaned = self.hooks.cleanup(self);
        triggered.and(cleaned)
    }

    /// Poll the detector until the triggered measurement completes.
    pub fn wait_after_trig(&self) -> AppResult<()> {
        loop {
            self.interrupt.check()?;
            if self.hooks.detect(self, self.timing.detect_slice)? {
                return Ok(());
            }
        }
    }

    // -------------------------------------------------------------------------
    // bulk operations
    // -------------------------------------------------------------------------

    /// Re-read every autoinit device, highest priority first, at most once per
    /// `force_get_interval`. Unresolvable options skip the device. Returns
    /// whether a pass ran.
    pub fn force_get(&self) -> AppResult<bool> {
        {
            let mut last = self.last_force_get.lock();
            if last.is_some_and(|t| t.elapsed() < self.timing.force_get_interval) {
                return Ok(false);
            }
            *last = Some(Instant::now());
        }
        let mut devices: Vec<Arc<Device>> = self
            .devices()
            .into_iter()
            .filter(|d| d.autoinit() > 0 && !d.is_trig() && d.can_get())
            .collect();
        devices.sort_by(|a, b| b.autoinit().cmp(&a.autoinit()));
        for device in devices {
            match device.get() {
                Ok(_) => {}
                Err(err) if err.is_recoverable() => {
                    debug!(instrument = %self.name, device = %device.name(), error = %err, "force_get skipped");
                }
                Err(err) => return Err(err),
            }
        }
        info!(instrument = %self.name, "Forced refresh of cached values");
        Ok(true)
    }

    /// `name = value` listing of cached values, optionally refreshed first.
    pub fn iprint(&self, force: bool) -> AppResult<String> {
        if force {
            self.force_get()?;
        }
        Ok(self
            .devices()
            .iter()
            .filter_map(|device| {
                let value = device.cache().shared()?;
                Some(format!("{} = {value}\n", device.name()))
            })
            .collect())
    }

    /// `name=value` configuration lines for output headers.
    ///
    /// Lists `names` (default: every settable, readable device that is not
    /// built in), then the reading's `options`, then `async_delay` when
    /// non-zero and the identification string when known.
    pub fn conf_snapshot(&self, names: Option<&[&str]>, options: &OptionValues) -> AppResult<Vec<String>> {
        let devices: Vec<Arc<Device>> = match names {
            Some(names) => names
                .iter()
                .map(|n| self.device(n))
                .collect::<AppResult<_>>()?,
            None => self
                .devices()
                .into_iter()
                .filter(|d| d.can_set() && d.can_get() && !BUILTIN_DEVICES.contains(&d.name()))
                .collect(),
        };
        let mut lines = Vec::new();
        for device in devices {
            match device.getcache() {
                Ok(Some(value)) => lines.push(format!("{}={value}", device.name())),
                Ok(None) => {}
                Err(err) if err.is_recoverable() => {}
                Err(err) => return Err(err),
            }
        }
        if !options.is_empty() {
            let pairs: Vec<String> = options.iter().map(|(k, v)| format!("{k}: {v}")).collect();
            lines.push(format!("options={{{}}}", pairs.join(", ")));
        }
        let delay = self.async_delay();
        if !delay.is_zero() {
            lines.push(format!("async_delay={:?}", delay.as_secs_f64()));
        }
        if let Some(idn) = self.idn.lock().clone() {
            lines.push(format!("idn={idn}"));
        }
        Ok(lines)
    }

    /// Header callback used by devices that do not declare one.
    pub fn config_header(&self) -> Option<HeaderFn> {
        if let Some(header) = &self.config_header {
            return Some(Arc::clone(header));
        }
        Some(Arc::new(|device: &Device, options: &OptionValues| {
            device.instrument()?.conf_snapshot(None, options)
        }))
    }

    /// `*IDN?` reply, cached after the first successful query.
    pub fn idn(&self) -> AppResult<String> {
        if let Some(idn) = self.idn.lock().clone() {
            return Ok(idn);
        }
        let reply = self.ask("*IDN?", false)?.into_text()?.trim().to_string();
        *self.idn.lock() = Some(reply.clone());
        Ok(reply)
    }

    /// [`idn`](Self::idn) split into its fields.
    pub fn idn_split(&self) -> AppResult<Idn> {
        Ok(Idn::parse(&self.idn()?))
    }

    // -------------------------------------------------------------------------
    // crate internals
    // -------------------------------------------------------------------------

    pub(crate) fn lock_ref(&self) -> &ComposedLock {
        &self.lock
    }

    pub(crate) fn hooks(&self) -> &Arc<dyn AsyncHooks> {
        &self.hooks
    }

    pub(crate) fn async_state(&self) -> &Mutex<AsyncState> {
        &self.async_state
    }

    pub(crate) fn timing(&self) -> &InstrumentTiming {
        &self.timing
    }

    /// Abort flag observed by this instrument's waits.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }
}

impl Drop for Instrument {
    fn drop(&mut self) {
        self.async_state.get_mut().reset();
    }
}

/// Restores the previous checking mode on drop.
#[must_use = "checking mode ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct CheckingGuard<'a> {
    instrument: &'a Instrument,
    previous: bool,
}

impl Drop for CheckingGuard<'_> {
    fn drop(&mut self) {
        self.instrument.set_checking(self.previous);
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures and creates an [`Instrument`].
pub struct InstrumentBuilder {
    name: String,
    transport: Arc<dyn Transport>,
    extra_lock: Arc<dyn ExtraLock>,
    hooks: Arc<dyn AsyncHooks>,
    timing: InstrumentTiming,
    checking: bool,
    interrupt: Interrupt,
    config_header: Option<HeaderFn>,
}

impl fmt::Debug for InstrumentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentBuilder")
            .field("name", &self.name)
            .field("extra_lock", &self.extra_lock)
            .field("hooks", &self.hooks)
            .field("timing", &self.timing)
            .finish()
    }
}

impl InstrumentBuilder {
    /// Instrument `name` on `transport`, with default settings, no extra lock
    /// and the fixed-wait detector.
    pub fn new(name: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self {
            name: name.into(),
            transport: Arc::new(transport),
            extra_lock: Arc::new(NoExtraLock),
            hooks: Arc::new(WaitHooks::new()),
            timing: InstrumentTiming::default(),
            checking: false,
            interrupt: Interrupt::global().clone(),
            config_header: None,
        }
    }

    /// Outer lock composed with the per-process lock.
    pub fn extra_lock(mut self, extra_lock: Arc<dyn ExtraLock>) -> Self {
        self.extra_lock = extra_lock;
        self
    }

    /// Share the lock with every handle (in any process) attached to the
    /// record for this transport's address under `dir`.
    pub fn shared_lock(mut self, kind: &str, dir: &Path) -> AppResult<Self> {
        let path = SharedRecord::path_for(dir, kind, &self.transport.description());
        debug!(instrument = %self.name, path = %path.display(), "Attaching shared lock");
        self.extra_lock = Arc::new(SharedMemoryLock::open(&path)?);
        Ok(self)
    }

    /// Acquisition callbacks.
    pub fn hooks(mut self, hooks: Arc<dyn AsyncHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Timing and initial checking mode from `settings`.
    pub fn settings(mut self, settings: &Settings) -> Self {
        self.timing = InstrumentTiming::from(settings);
        self.checking = settings.instrument.checking;
        self
    }

    /// Observe `interrupt` instead of the global user-abort flag.
    pub fn interrupt(mut self, interrupt: &Interrupt) -> Self {
        self.interrupt = interrupt.clone();
        self
    }

    /// Header callback for devices without their own.
    pub fn config_header(mut self, header: HeaderFn) -> Self {
        self.config_header = Some(header);
        self
    }

    /// Create the instrument and its built-in devices.
    pub fn build(self) -> AppResult<Arc<Instrument>> {
        let lock = ComposedLock::new(self.name.clone(), self.extra_lock)
            .with_poll_interval(self.timing.lock_poll)
            .with_timeout(self.timing.lock_timeout)
            .with_interrupt(&self.interrupt);
        let name = self.name;
        let instrument = Arc::new_cyclic(|self_ref| Instrument {
            name: name.clone(),
            self_ref: self_ref.clone(),
            transport: self.transport,
            lock,
            hooks: self.hooks,
            devices: RwLock::new(Vec::new()),
            async_state: Mutex::new(AsyncState::default()),
            checking: AtomicBool::new(self.checking),
            last_force_get: Mutex::new(None),
            timing: self.timing,
            interrupt: self.interrupt,
            config_header: self.config_header,
            idn: Mutex::new(None),
        });
        instrument.add_device(
            DeviceBuilder::memory("async_delay", 0.0)
                .limits(Limits::at_least(0.0))
                .doc("Seconds to wait between start and trigger of an acquisition"),
        )?;
        instrument.add_device(
            DeviceBuilder::memory("async_wait", 0.0)
                .limits(Limits::at_least(0.0))
                .doc("Acquisition time assumed by the fixed-wait detector"),
        )?;
        instrument.add_device(
            DeviceBuilder::memory("header", name.as_str()).doc("Name used in output headers"),
        )?;
        debug!(instrument = %name, "Instrument created");
        Ok(instrument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_idn_parse() {
        let idn = Idn::parse("ACME, DMM100 ,42,1.2,beta\n");
        assert_eq!(idn.vendor, "ACME");
        assert_eq!(idn.model, "DMM100");
        assert_eq!(idn.firmware, "1.2,beta");
        assert_eq!(Idn::parse("ONLY").model, "");
    }

    #[test]
    fn test_builtin_devices_and_duplicates() {
        let instr = Instrument::builder("dmm", MockTransport::new()).build().unwrap();
        assert_eq!(instr.device_names(), BUILTIN_DEVICES.to_vec());
        assert!(instr.device("async_delay").unwrap().set(-1.0).is_err());
        instr.device("async_delay").unwrap().set(0.25).unwrap();
        assert_eq!(instr.async_delay(), Duration::from_millis(250));
        assert_eq!(instr.header_name(), "dmm");
        assert!(matches!(
            instr.add_device(DeviceBuilder::memory("header", "x")),
            Err(DaqError::DuplicateDevice(_))
        ));
        assert!(matches!(instr.device("nope"), Err(DaqError::UnknownDevice(_))));
    }

    #[test]
    fn test_checking_scope_restores() {
        let instr = Instrument::builder("dmm", MockTransport::new()).build().unwrap();
        {
            let _outer = instr.checking_scope(true);
            {
                let _inner = instr.checking_scope(false);
                assert!(!instr.is_checking());
            }
            assert!(instr.is_checking());
        }
        assert!(!instr.is_checking());
    }

    #[test]
    fn test_force_get_is_rate_limited_and_ordered() {
        let mock = Arc::new(MockTransport::new());
        mock.set_reply("A?", "1");
        mock.set_reply("B?", "2");
        let instr = Instrument::builder("dmm", Arc::clone(&mock)).build().unwrap();
        instr.add_device(DeviceBuilder::scpi("a", "A").autoinit(5)).unwrap();
        instr.add_device(DeviceBuilder::scpi("b", "B").autoinit(20)).unwrap();
        assert!(instr.force_get().unwrap());
        assert_eq!(mock.writes(), vec!["B?", "A?"]);
        assert!(!instr.force_get().unwrap());
        assert_eq!(mock.writes().len(), 2);

        let listing = instr.iprint(false).unwrap();
        assert!(listing.contains("a = 1.0"));
        assert!(listing.contains("b = 2.0"));
        assert_eq!(listing.lines().count(), 2);
        assert!(listing.ends_with('\n'));
    }

    #[test]
    fn test_conf_snapshot_lines() {
        let mock = Arc::new(MockTransport::new().with_reply("*IDN?", "ACME,X,1,2"));
        let instr = Instrument::builder("src", Arc::clone(&mock)).build().unwrap();
        let volt = instr.add_device(DeviceBuilder::scpi("volt", "VOLT")).unwrap();
        volt.set(2.0).unwrap();
        instr.device("async_delay").unwrap().set(0.5).unwrap();
        instr.idn().unwrap();
        let mut opts = OptionValues::new();
        opts.insert("ch".into(), 1.into());
        let lines = instr.conf_snapshot(None, &opts).unwrap();
        assert_eq!(
            lines,
            vec!["volt=2.0", "options={ch: 1}", "async_delay=0.5", "idn=ACME,X,1,2"]
        );
    }

    #[test]
    fn test_run_and_wait_cleans_up_after_failed_trigger() {
        let hooks = Arc::new(ScriptedHooks::new());
        let instr = Instrument::builder("scope", MockTransport::new())
            .hooks(hooks.clone())
            .build()
            .unwrap();
        instr.run_and_wait().unwrap();
        hooks.fail_next_trigger("no trigger");
        assert!(instr.run_and_wait().is_err());
        assert_eq!(hooks.triggers(), 2);
        assert_eq!(hooks.cleanups(), 2);
        assert!(!instr.lock_is_owned());
    }
}
