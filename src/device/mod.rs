//! The device: unit of control on an instrument.
//!
//! A [`Device`] wraps a codec, a cache, limits, options and a
//! [`DeviceBackend`], and exposes the uniform contract:
//!
//! - [`Device::check`]: validate a value (and the options) without touching hardware;
//! - [`Device::set`]: check, write under the instrument lock, optionally read back,
//!   then update the cache (only after the write succeeded);
//! - [`Device::get`]: read under the lock (or through the asynchronous protocol
//!   for triggered devices) and update the cache;
//! - [`Device::getcache`]: last confirmed value, reading it if `autoinit` allows.
//!
//! Devices are created by [`Instrument::add_device`] from a [`DeviceBuilder`]
//! and keep only a weak reference to their instrument.
//!
//! # Example
//!
//! ```
//! use instrument_core::device::DeviceBuilder;
//! use instrument_core::instrument::Instrument;
//! use instrument_core::limits::Limits;
//! use instrument_core::transport::NullTransport;
//! use instrument_core::value::Value;
//!
//! let instr = Instrument::builder("sim", NullTransport).build().unwrap();
//! let level = instr
//!     .add_device(DeviceBuilder::memory("level", 0.0).limits(Limits::range(0.0, 10.0)))
//!     .unwrap();
//! level.set(5.0).unwrap();
//! assert_eq!(level.get().unwrap(), Value::Float(5.0));
//! assert!(level.check(999.0).is_err());
//! ```

mod backend;
mod cache;
mod format;
mod options;

pub use backend::{DeviceBackend, DeviceContext, FieldBackend, FnBackend, GetFn, MemoryBackend, ScpiBackend, SetFn};
pub use cache::DeviceCache;
pub use format::{write_row, BinFormat, DeviceFormat, HeaderFn};
pub use options::{OptionConverter, OptionDefault, OptionSpec, OptionValues, ResolvedOptions};

use crate::acquisition::AsyncStage;
use crate::codec::{
    BoolCodec, BytesCodec, CheckFailure, FloatCodec, IntCodec, SharedCodec, TextCodec,
};
use crate::error::{AppResult, DaqError};
use crate::instrument::Instrument;
use crate::limits::Limits;
use crate::value::{Record, Value};
use format::FormatSpec;
use options::OptionSet;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Default autoinit priority of readable devices.
pub const DEFAULT_AUTOINIT: u32 = 10;

/// What to do when a record value lacks some fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingFields {
    /// Refuse the value.
    #[default]
    Reject,
    /// Complete it from a fresh read.
    FromGet,
    /// Complete it from the cache (reading only if empty).
    FromCache,
}

// =============================================================================
// Device
// =============================================================================

/// A controllable quantity of an instrument.
pub struct Device {
    name: String,
    instrument: Weak<Instrument>,
    self_ref: Weak<Device>,
    backend: Box<dyn DeviceBackend>,
    codec: SharedCodec,
    limits: Limits,
    options: OptionSet,
    autoinit: u32,
    trig: bool,
    setget: bool,
    missing_fields: MissingFields,
    format: FormatSpec,
    doc: String,
    cache: DeviceCache,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("limits", &self.limits)
            .field("autoinit", &self.autoinit)
            .field("trig", &self.trig)
            .field("setget", &self.setget)
            .field("cache", &self.cache.shared())
            .finish()
    }
}

impl Device {
    /// Device name, unique on its instrument.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `header.name`, used as column and log name.
    pub fn full_name(&self) -> String {
        match self.instrument.upgrade() {
            Some(instr) => format!("{}.{}", instr.header_name(), self.name),
            None => self.name.clone(),
        }
    }

    /// Documentation supplied by the driver.
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Owning instrument.
    pub fn instrument(&self) -> AppResult<Arc<Instrument>> {
        self.instrument
            .upgrade()
            .ok_or_else(|| DaqError::Detached(self.name.clone()))
    }

    /// Value codec.
    pub fn codec(&self) -> &SharedCodec {
        &self.codec
    }

    /// Value limits.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Declared options.
    pub fn options(&self) -> &[OptionSpec] {
        self.options.specs()
    }

    /// Autoinit priority (0: never read automatically).
    pub fn autoinit(&self) -> u32 {
        self.autoinit
    }

    /// Whether reads go through the asynchronous trigger protocol.
    pub fn is_trig(&self) -> bool {
        self.trig
    }

    /// Whether a set is followed by a read-back.
    pub fn is_setget(&self) -> bool {
        self.setget
    }

    /// Whether the device can be read.
    pub fn can_get(&self) -> bool {
        self.backend.can_get()
    }

    /// Whether the device can be set.
    pub fn can_set(&self) -> bool {
        self.backend.can_set()
    }

    /// Value cache.
    pub fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    fn arc(&self) -> AppResult<Arc<Device>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| DaqError::Detached(self.name.clone()))
    }

    // -------------------------------------------------------------------------
    // check
    // -------------------------------------------------------------------------

    /// Validate `value` with default options.
    pub fn check(&self, value: impl Into<Value>) -> AppResult<()> {
        self.check_with(value, &OptionValues::new())
    }

    /// Validate `value` and `options` without touching hardware.
    pub fn check_with(&self, value: impl Into<Value>, options: &OptionValues) -> AppResult<()> {
        let instr = self.instrument()?;
        self.check_inner(&instr, value.into(), options).map(|_| ())
    }

    fn check_inner(
        &self,
        instr: &Instrument,
        value: Value,
        options: &OptionValues,
    ) -> AppResult<(Value, ResolvedOptions)> {
        if !self.backend.can_set() {
            return Err(DaqError::NotImplemented(format!(
                "{} does not handle set/check",
                self.name
            )));
        }
        let resolved = self.options.resolve(&self.name, options)?;
        let value = match self.validate(&value) {
            Ok(()) => value,
            Err(CheckFailure::MissingFields(missing)) if self.missing_fields != MissingFields::Reject => {
                debug!(device = %self.name, ?missing, "Completing partial record");
                let completed = self.complete_record(value, options)?;
                self.validate(&completed)
                    .map_err(|e| DaqError::InvalidArgument(format!("{}: {e}", self.name)))?;
                completed
            }
            Err(e) => return Err(DaqError::InvalidArgument(format!("{}: {e}", self.name))),
        };
        let value = canonical(&self.codec, value)?;
        let ctx = DeviceContext {
            device: self,
            instrument: instr,
        };
        self.backend.check(&ctx, &value, &resolved)?;
        Ok((value, resolved))
    }

    fn validate(&self, value: &Value) -> Result<(), CheckFailure> {
        self.limits.check(value)?;
        if self.limits.choices.is_none() {
            self.codec.validate(value)?;
        }
        Ok(())
    }

    fn complete_record(&self, partial: Value, options: &OptionValues) -> AppResult<Value> {
        let Value::Record(given) = partial else {
            return Ok(partial);
        };
        let base = match self.missing_fields {
            MissingFields::FromGet => Some(self.get_with(options)?),
            _ => match self.getcache()? {
                Some(v) => Some(v),
                None => Some(self.get_with(options)?),
            },
        };
        let mut record: Record = base
            .and_then(|v| v.as_record().cloned())
            .unwrap_or_default();
        record.extend(given);
        Ok(Value::Record(record))
    }

    // -------------------------------------------------------------------------
    // set
    // -------------------------------------------------------------------------

    /// Set with default options.
    pub fn set(&self, value: impl Into<Value>) -> AppResult<()> {
        self.set_with(value, &OptionValues::new())
    }

    /// Validate, write, optionally read back, then cache.
    ///
    /// Nothing is written if validation fails; a failed write leaves the cache
    /// untouched. In checking mode only validation runs and the cache records
    /// the value.
    pub fn set_with(&self, value: impl Into<Value>, options: &OptionValues) -> AppResult<()> {
        let instr = self.instrument()?;
        let _guard = instr.lock()?;
        let (value, resolved) = self.check_inner(&instr, value.into(), options)?;
        if instr.is_checking() {
            self.cache.store(value, resolved.into_values());
            return Ok(());
        }
        self.options.apply(options)?;
        let ctx = DeviceContext {
            device: self,
            instrument: &instr,
        };
        self.backend.set(&ctx, &value, &resolved)?;
        debug!(device = %self.name, %value, "Set");
        if self.setget {
            self.get_now(&instr, options)?;
        } else {
            self.cache.store(value, resolved.into_values());
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // get
    // -------------------------------------------------------------------------

    /// Read with default options.
    pub fn get(&self) -> AppResult<Value> {
        self.get_with(&OptionValues::new())
    }

    /// Read the device.
    ///
    /// Triggered devices run a complete trigger/wait/collect cycle on their
    /// instrument; other devices read immediately under the lock.
    pub fn get_with(&self, options: &OptionValues) -> AppResult<Value> {
        let instr = self.instrument()?;
        if !self.backend.can_get() {
            return Err(DaqError::NotImplemented(format!(
                "{} does not handle get",
                self.name
            )));
        }
        if self.trig && !instr.is_checking() {
            return instr.read_triggered(&self.arc()?, options);
        }
        self.get_now(&instr, options)
    }

    /// Run one stage of the asynchronous protocol for this device.
    ///
    /// Stage 3 returns the collected value; the other stages return `None`.
    pub fn get_async(&self, stage: AsyncStage, options: &OptionValues) -> AppResult<Option<Value>> {
        let instr = self.instrument()?;
        instr.get_async(stage, &self.arc()?, options)
    }

    /// Immediate read under the lock, bypassing the trigger protocol.
    pub(crate) fn get_now(&self, instr: &Instrument, options: &OptionValues) -> AppResult<Value> {
        if !self.backend.can_get() {
            return Err(DaqError::NotImplemented(format!(
                "{} does not handle get",
                self.name
            )));
        }
        let _guard = instr.lock()?;
        let resolved = match self.options.resolve(&self.name, options) {
            Ok(resolved) => resolved,
            Err(err) => {
                if err.is_recoverable() {
                    self.cache.invalidate();
                }
                return Err(err);
            }
        };
        if instr.is_checking() && !self.backend.answers_in_checking() {
            return self.cache.shared_for(resolved.values()).ok_or_else(|| {
                DaqError::InvalidAutoArgument(format!(
                    "{} has no cached value to return in checking mode",
                    self.name
                ))
            });
        }
        self.options.apply(options)?;
        let ctx = DeviceContext {
            device: self,
            instrument: instr,
        };
        let value = self.backend.get(&ctx, &resolved)?;
        self.cache.store(value.clone(), resolved.into_values());
        Ok(value)
    }

    // -------------------------------------------------------------------------
    // cache
    // -------------------------------------------------------------------------

    /// Last confirmed value for the current options.
    ///
    /// An empty cache is filled by a read when `autoinit` is enabled (and not in
    /// checking mode); `InvalidAutoArgument` from that read yields `None`.
    pub fn getcache(&self) -> AppResult<Option<Value>> {
        let instr = self.instrument()?;
        let cached = match self.options.resolve_values(&self.name, &OptionValues::new()) {
            Ok(current) => self.cache.shared_for(&current),
            Err(err) if err.is_recoverable() => None,
            Err(err) => return Err(err),
        };
        if cached.is_some() {
            return Ok(cached);
        }
        if self.autoinit == 0 || instr.is_checking() || !self.backend.can_get() {
            return Ok(None);
        }
        match self.get() {
            Ok(v) => Ok(Some(v)),
            Err(err) if err.is_recoverable() => {
                debug!(device = %self.name, error = %err, "Autoinit read skipped");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// The calling thread's own last value, falling back to [`getcache`](Self::getcache).
    pub fn getcache_local(&self) -> AppResult<Option<Value>> {
        match self.cache.local() {
            Some(v) => Ok(Some(v)),
            None => self.getcache(),
        }
    }

    /// Overwrite the cache (shared and local) as if `value` had been read with
    /// the current default options. `None` empties it.
    pub fn setcache(&self, value: Option<Value>) -> AppResult<()> {
        match value {
            Some(v) => {
                let key = self
                    .options
                    .resolve_values(&self.name, &OptionValues::new())
                    .unwrap_or_default();
                self.cache.store(v, key);
            }
            None => self.cache.invalidate(),
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // format
    // -------------------------------------------------------------------------

    /// Display/persistence hints for a reading taken with `options`.
    pub fn getformat(&self, options: &OptionValues) -> AppResult<DeviceFormat> {
        let instr = self.instrument()?;
        let resolved = match self.options.resolve_values(&self.name, options) {
            Ok(values) => values,
            Err(err) if err.is_recoverable() => options.clone(),
            Err(err) => return Err(err),
        };
        let multi = self.format.multi.clone().or_else(|| {
            self.codec
                .as_multiple()
                .map(|m| m.field_names())
        });
        Ok(DeviceFormat {
            multi,
            graph: self.format.graph.clone(),
            bin: self.format.bin.clone(),
            options: resolved,
            header: self.format.header.clone().or_else(|| instr.config_header()),
        })
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Declarative description of a device, turned into a [`Device`] by
/// [`Instrument::add_device`].
pub struct DeviceBuilder {
    name: String,
    backend: Option<Box<dyn DeviceBackend>>,
    codec: Option<SharedCodec>,
    limits: Limits,
    options: Vec<OptionSpec>,
    autoinit: Option<u32>,
    trig: bool,
    setget: bool,
    missing_fields: MissingFields,
    format: FormatSpec,
    doc: String,
    initial: Option<Value>,
}

impl fmt::Debug for DeviceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuilder")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("limits", &self.limits)
            .finish()
    }
}

impl DeviceBuilder {
    /// Device `name` without backend yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: None,
            codec: None,
            limits: Limits::none(),
            options: Vec::new(),
            autoinit: None,
            trig: false,
            setget: false,
            missing_fields: MissingFields::Reject,
            format: FormatSpec::default(),
            doc: String::new(),
            initial: None,
        }
    }

    /// Memory device holding `initial`; its codec follows the value type.
    pub fn memory(name: impl Into<String>, initial: impl Into<Value>) -> Self {
        let initial = initial.into();
        let codec: SharedCodec = match &initial {
            Value::Int(_) => Arc::new(IntCodec),
            Value::Bool(_) => Arc::new(BoolCodec),
            Value::Text(_) => Arc::new(TextCodec::new()),
            Value::Bytes(_) => Arc::new(BytesCodec),
            _ => Arc::new(FloatCodec),
        };
        let mut builder = Self::new(name).backend(MemoryBackend).codec(codec);
        builder.initial = Some(initial);
        builder
    }

    /// Template-command device (`cmd {val}` / `cmd?`).
    pub fn scpi(name: impl Into<String>, cmd: &str) -> Self {
        Self::new(name).backend(ScpiBackend::command(cmd))
    }

    /// Device exposing field `field` of the record-valued `parent`.
    ///
    /// Codec and limits come from the parent's record codec when it has one.
    pub fn field(name: impl Into<String>, parent: &Arc<Device>, field: &str) -> Self {
        let mut builder = Self::new(name).backend(FieldBackend::new(parent, field));
        if let Some(spec) = parent.codec().as_multiple().and_then(|m| m.field(field)) {
            builder.codec = Some(Arc::clone(&spec.codec));
            builder.limits = spec.limits.clone();
        }
        builder
    }

    /// Hardware backend.
    pub fn backend(mut self, backend: impl DeviceBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Value codec (defaults to the choice codec of the limits, else float).
    pub fn codec(mut self, codec: SharedCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Value limits.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Restrict values to `codec`, also used as the value codec.
    pub fn choices(mut self, codec: SharedCodec) -> Self {
        self.limits.choices = Some(codec);
        self
    }

    /// Declare an option.
    pub fn option(mut self, spec: OptionSpec) -> Self {
        self.options.push(spec);
        self
    }

    /// Autoinit priority; 0 disables automatic reads.
    pub fn autoinit(mut self, priority: u32) -> Self {
        self.autoinit = Some(priority);
        self
    }

    /// Reads go through the asynchronous trigger protocol.
    pub fn trig(mut self) -> Self {
        self.trig = true;
        self
    }

    /// Read back after every set.
    pub fn setget(mut self) -> Self {
        self.setget = true;
        self
    }

    /// Accept partial records.
    pub fn missing_fields(mut self, policy: MissingFields) -> Self {
        self.missing_fields = policy;
        self
    }

    /// Column names of multi-column readings.
    pub fn multi<S: Into<String>>(mut self, columns: Vec<S>) -> Self {
        self.format.multi = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Columns to plot.
    pub fn graph(mut self, columns: Vec<usize>) -> Self {
        self.format.graph = Some(columns);
        self
    }

    /// Readings are written as binary files with `extension`.
    pub fn binary(mut self, extension: &str) -> Self {
        self.format.bin = Some(BinFormat::new(extension));
        self
    }

    /// Header lines written with readings of this device.
    pub fn header(mut self, header: HeaderFn) -> Self {
        self.format.header = Some(header);
        self
    }

    /// Documentation.
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn build(self, instrument: Weak<Instrument>) -> AppResult<Arc<Device>> {
        let backend = self.backend.ok_or_else(|| {
            DaqError::Configuration(format!("device {} has no backend", self.name))
        })?;
        let options = OptionSet::new(self.options);
        let autoinit = self.autoinit.unwrap_or_else(|| {
            if !backend.can_get() || self.trig {
                0
            } else if let Some(priority) = backend.default_autoinit() {
                priority
            } else if options.references_devices() {
                1
            } else {
                DEFAULT_AUTOINIT
            }
        });
        let codec = self
            .codec
            .or_else(|| self.limits.choices.clone())
            .unwrap_or_else(|| Arc::new(FloatCodec));
        if let Some(initial) = &self.initial {
            self.limits.check(initial).map_err(|e| {
                DaqError::Configuration(format!("device {} initial value: {e}", self.name))
            })?;
        }
        let device = Arc::new_cyclic(|self_ref| Device {
            name: self.name,
            instrument,
            self_ref: self_ref.clone(),
            backend,
            codec,
            limits: self.limits,
            options,
            autoinit,
            trig: self.trig,
            setget: self.setget,
            missing_fields: self.missing_fields,
            format: self.format,
            doc: self.doc,
            cache: DeviceCache::default(),
        });
        if let Some(initial) = self.initial {
            device.cache.store(canonical(&device.codec, initial)?, OptionValues::new());
        }
        Ok(device)
    }
}

/// `value` as the codec reads it back; values outside the codec (accepted by
/// a choices limit instead) are kept as given.
fn canonical(codec: &SharedCodec, value: Value) -> AppResult<Value> {
    if codec.contains(&value) {
        codec.normalize(&value)
    } else {
        Ok(value)
    }
}
