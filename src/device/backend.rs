//! How a device actually reads and writes.
//!
//! A [`DeviceBackend`] is composed into a [`Device`](super::Device) by the
//! driver: the device handles validation, options, caching and locking, the
//! backend only talks to the instrument. Backends are always called with the
//! instrument lock held and never in checking mode (unless
//! [`answers_in_checking`](DeviceBackend::answers_in_checking) says otherwise).

use super::options::{OptionValues, ResolvedOptions};
use super::Device;
use crate::codec::{SharedCodec, Wire};
use crate::error::{AppResult, DaqError};
use crate::instrument::Instrument;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// What a backend sees of its device and instrument.
pub struct DeviceContext<'a> {
    pub(crate) device: &'a Device,
    pub(crate) instrument: &'a Instrument,
}

impl<'a> DeviceContext<'a> {
    /// The device being operated.
    pub fn device(&self) -> &'a Device {
        self.device
    }

    /// Its instrument.
    pub fn instrument(&self) -> &'a Instrument {
        self.instrument
    }

    /// The device codec.
    pub fn codec(&self) -> &'a SharedCodec {
        self.device.codec()
    }

    /// Send a command through the instrument transport.
    pub fn write(&self, command: &str) -> AppResult<()> {
        self.instrument.write(command)
    }

    /// Query through the instrument transport.
    pub fn ask(&self, command: &str, raw: bool) -> AppResult<Wire> {
        self.instrument.ask(command, raw)
    }
}

/// Hardware side of a device.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    /// Whether `get` is supported.
    fn can_get(&self) -> bool {
        true
    }

    /// Whether `set` (and therefore `check`) is supported.
    fn can_set(&self) -> bool {
        true
    }

    /// Read the current value.
    fn get(&self, ctx: &DeviceContext<'_>, options: &ResolvedOptions) -> AppResult<Value>;

    /// Write an already validated value.
    fn set(&self, ctx: &DeviceContext<'_>, value: &Value, options: &ResolvedOptions) -> AppResult<()>;

    /// Extra validation after limits, still without touching hardware.
    fn check(&self, _ctx: &DeviceContext<'_>, _value: &Value, _options: &ResolvedOptions) -> AppResult<()> {
        Ok(())
    }

    /// Whether `get` is pure and may run in checking mode.
    fn answers_in_checking(&self) -> bool {
        false
    }

    /// Autoinit priority when the builder does not choose one.
    fn default_autoinit(&self) -> Option<u32> {
        None
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Value kept only in the device cache (settings of the software itself).
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBackend;

impl DeviceBackend for MemoryBackend {
    fn get(&self, ctx: &DeviceContext<'_>, _options: &ResolvedOptions) -> AppResult<Value> {
        ctx.device
            .cache()
            .shared()
            .ok_or_else(|| DaqError::NotImplemented(format!("{} holds no value", ctx.device.name())))
    }

    fn set(&self, _ctx: &DeviceContext<'_>, _value: &Value, _options: &ResolvedOptions) -> AppResult<()> {
        Ok(())
    }

    fn answers_in_checking(&self) -> bool {
        true
    }

    fn default_autoinit(&self) -> Option<u32> {
        Some(0)
    }
}

// =============================================================================
// Command templates
// =============================================================================

/// Text commands built from templates.
///
/// Templates use `{name}` placeholders for option wire strings; set templates
/// also receive `{val}`. A set template without `{val}` gets ` {val}`
/// appended, and [`ScpiBackend::command`] derives the query by appending `?`.
///
/// # Example
///
/// ```
/// use instrument_core::device::ScpiBackend;
///
/// let volt = ScpiBackend::command("SOUR{ch}:VOLT");
/// assert_eq!(volt.set_template(), Some("SOUR{ch}:VOLT {val}"));
/// assert_eq!(volt.get_template(), Some("SOUR{ch}:VOLT?"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScpiBackend {
    set_template: Option<String>,
    get_template: Option<String>,
    raw: bool,
}

impl ScpiBackend {
    /// Settable and readable: `cmd {val}` / `cmd?`.
    pub fn command(cmd: &str) -> Self {
        Self::new(Some(cmd), Some(&format!("{cmd}?")))
    }

    /// Explicit templates; either may be absent.
    pub fn new(set_template: Option<&str>, get_template: Option<&str>) -> Self {
        let set_template = set_template.map(|s| {
            if s.contains("{val}") {
                s.to_string()
            } else {
                format!("{s} {{val}}")
            }
        });
        Self {
            set_template,
            get_template: get_template.map(str::to_string),
            raw: false,
        }
    }

    /// Read-only.
    pub fn query(get_template: &str) -> Self {
        Self::new(None, Some(get_template))
    }

    /// Write-only.
    pub fn write_only(set_template: &str) -> Self {
        Self::new(Some(set_template), None)
    }

    /// Read replies as raw bytes.
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    /// Set template after normalization.
    pub fn set_template(&self) -> Option<&str> {
        self.set_template.as_deref()
    }

    /// Get template.
    pub fn get_template(&self) -> Option<&str> {
        self.get_template.as_deref()
    }
}

fn render(template: &str, vars: &HashMap<String, String>) -> AppResult<String> {
    strfmt::strfmt(template, vars)
        .map_err(|e| DaqError::Conversion(format!("cannot format {template:?}: {e}")))
}

fn template_vars(options: &ResolvedOptions) -> HashMap<String, String> {
    options
        .wire()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl DeviceBackend for ScpiBackend {
    fn can_get(&self) -> bool {
        self.get_template.is_some()
    }

    fn can_set(&self) -> bool {
        self.set_template.is_some()
    }

    fn get(&self, ctx: &DeviceContext<'_>, options: &ResolvedOptions) -> AppResult<Value> {
        let template = self
            .get_template
            .as_deref()
            .ok_or_else(|| DaqError::NotImplemented(format!("{} does not handle get", ctx.device.name())))?;
        let command = render(template, &template_vars(options))?;
        let reply = ctx.ask(&command, self.raw)?;
        ctx.codec().from_wire(&reply)
    }

    fn set(&self, ctx: &DeviceContext<'_>, value: &Value, options: &ResolvedOptions) -> AppResult<()> {
        let template = self
            .set_template
            .as_deref()
            .ok_or_else(|| DaqError::NotImplemented(format!("{} does not handle set", ctx.device.name())))?;
        let mut vars = template_vars(options);
        vars.insert("val".to_string(), ctx.codec().to_wire(value)?.into_text()?);
        let command = render(template, &vars)?;
        ctx.write(&command)
    }
}

// =============================================================================
// Closures
// =============================================================================

/// Getter closure.
pub type GetFn = Arc<dyn Fn(&DeviceContext<'_>, &ResolvedOptions) -> AppResult<Value> + Send + Sync>;
/// Setter closure.
pub type SetFn = Arc<dyn Fn(&DeviceContext<'_>, &Value, &ResolvedOptions) -> AppResult<()> + Send + Sync>;

/// Backend made of driver-supplied closures.
#[derive(Clone, Default)]
pub struct FnBackend {
    getter: Option<GetFn>,
    setter: Option<SetFn>,
}

impl fmt::Debug for FnBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnBackend")
            .field("get", &self.getter.is_some())
            .field("set", &self.setter.is_some())
            .finish()
    }
}

impl FnBackend {
    /// Neither get nor set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read with `f`.
    pub fn getter<F>(mut self, f: F) -> Self
    where
        F: Fn(&DeviceContext<'_>, &ResolvedOptions) -> AppResult<Value> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(f));
        self
    }

    /// Write with `f`.
    pub fn setter<F>(mut self, f: F) -> Self
    where
        F: Fn(&DeviceContext<'_>, &Value, &ResolvedOptions) -> AppResult<()> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(f));
        self
    }
}

impl DeviceBackend for FnBackend {
    fn can_get(&self) -> bool {
        self.getter.is_some()
    }

    fn can_set(&self) -> bool {
        self.setter.is_some()
    }

    fn get(&self, ctx: &DeviceContext<'_>, options: &ResolvedOptions) -> AppResult<Value> {
        match &self.getter {
            Some(f) => f(ctx, options),
            None => Err(DaqError::NotImplemented(format!("{} does not handle get", ctx.device.name()))),
        }
    }

    fn set(&self, ctx: &DeviceContext<'_>, value: &Value, options: &ResolvedOptions) -> AppResult<()> {
        match &self.setter {
            Some(f) => f(ctx, value, options),
            None => Err(DaqError::NotImplemented(format!("{} does not handle set", ctx.device.name()))),
        }
    }
}

// =============================================================================
// Record field
// =============================================================================

/// One field of a record-valued sibling device.
///
/// Reading gets the whole record; writing replaces the field in the parent's
/// cached (or freshly read) record and sets the parent.
#[derive(Debug, Clone)]
pub struct FieldBackend {
    parent: Weak<Device>,
    parent_name: String,
    field: String,
}

impl FieldBackend {
    /// Field `field` of `parent`.
    pub fn new(parent: &Arc<Device>, field: impl Into<String>) -> Self {
        Self {
            parent: Arc::downgrade(parent),
            parent_name: parent.name().to_string(),
            field: field.into(),
        }
    }

    /// Parent device.
    pub fn parent(&self) -> AppResult<Arc<Device>> {
        self.parent
            .upgrade()
            .ok_or_else(|| DaqError::Detached(self.parent_name.clone()))
    }

    /// Field name.
    pub fn field(&self) -> &str {
        &self.field
    }

    fn extract(&self, record: Value) -> AppResult<Value> {
        match record {
            Value::Record(mut fields) => fields.remove(&self.field).ok_or_else(|| {
                DaqError::Conversion(format!("{} has no field {}", self.parent_name, self.field))
            }),
            other => Err(DaqError::Conversion(format!(
                "{} returned {} instead of a record",
                self.parent_name,
                other.kind()
            ))),
        }
    }
}

impl DeviceBackend for FieldBackend {
    fn get(&self, _ctx: &DeviceContext<'_>, _options: &ResolvedOptions) -> AppResult<Value> {
        let record = self.parent()?.get()?;
        self.extract(record)
    }

    fn set(&self, _ctx: &DeviceContext<'_>, value: &Value, _options: &ResolvedOptions) -> AppResult<()> {
        let parent = self.parent()?;
        let current = match parent.getcache()? {
            Some(v) => v,
            None => parent.get()?,
        };
        let mut record = match current {
            Value::Record(r) => r,
            other => {
                return Err(DaqError::Conversion(format!(
                    "{} holds {} instead of a record",
                    self.parent_name,
                    other.kind()
                )))
            }
        };
        record.insert(self.field.clone(), value.clone());
        parent.set_with(Value::Record(record), &OptionValues::new())
    }
}
