//! Device options: named parameters of a get/set (channel, range, ...).
//!
//! Each device declares a closed set of [`OptionSpec`]s. An option's default is
//! a literal or a reference to another device, whose *cache* supplies the value.
//! Resolution validates explicit values (`InvalidArgument` on failure) and
//! defaults (`InvalidAutoArgument`: the caller may not need that option, and
//! can always pass it explicitly). The resolved values double as the device's
//! cache-consistency key.

use super::Device;
use crate::error::{AppResult, DaqError};
use crate::limits::Limits;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Option values keyed by option name.
pub type OptionValues = BTreeMap<String, Value>;

/// Rewrites an option's wire string: `(value, wire) -> wire`.
pub type OptionConverter = Arc<dyn Fn(&Value, String) -> String + Send + Sync>;

/// Where an option's value comes from when the caller does not supply it.
#[derive(Clone)]
pub enum OptionDefault {
    /// The caller must supply it.
    Required,
    /// Fixed value.
    Value(Value),
    /// The cached value of another device.
    Device(Weak<Device>),
}

impl fmt::Debug for OptionDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionDefault::Required => write!(f, "Required"),
            OptionDefault::Value(v) => write!(f, "Value({v})"),
            OptionDefault::Device(d) => match d.upgrade() {
                Some(dev) => write!(f, "Device({})", dev.name()),
                None => write!(f, "Device(<dropped>)"),
            },
        }
    }
}

/// Declaration of one option.
#[derive(Clone)]
pub struct OptionSpec {
    name: String,
    default: OptionDefault,
    limits: Option<Limits>,
    converter: Option<OptionConverter>,
    apply: bool,
}

impl fmt::Debug for OptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionSpec")
            .field("name", &self.name)
            .field("default", &self.default)
            .field("limits", &self.limits)
            .field("apply", &self.apply)
            .finish()
    }
}

impl OptionSpec {
    /// Option with a fixed default.
    pub fn value(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self::with_default(name, OptionDefault::Value(default.into()))
    }

    /// Option defaulting to `device`'s cached value, validated with its limits.
    pub fn device(name: impl Into<String>, device: &Arc<Device>) -> Self {
        Self::with_default(name, OptionDefault::Device(Arc::downgrade(device)))
    }

    /// Option without default.
    pub fn required(name: impl Into<String>) -> Self {
        Self::with_default(name, OptionDefault::Required)
    }

    fn with_default(name: impl Into<String>, default: OptionDefault) -> Self {
        Self {
            name: name.into(),
            default,
            limits: None,
            converter: None,
            apply: false,
        }
    }

    /// Own limits, replacing the referenced device's.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Custom wire conversion.
    pub fn with_converter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, String) -> String + Send + Sync + 'static,
    {
        self.converter = Some(Arc::new(f));
        self
    }

    /// Set the referenced device to an explicitly supplied value before the
    /// operation (for instruments where the option is modal state).
    pub fn applied(mut self) -> Self {
        self.apply = true;
        self
    }

    /// Option name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Referenced device, if any and still alive.
    pub fn referenced(&self) -> Option<Arc<Device>> {
        match &self.default {
            OptionDefault::Device(d) => d.upgrade(),
            _ => None,
        }
    }

    /// An explicit value as the referenced device would cache it.
    fn canonical(&self, value: &Value) -> AppResult<Value> {
        match self.referenced() {
            Some(dev) if dev.codec().contains(value) => dev.codec().normalize(value),
            _ => Ok(value.clone()),
        }
    }

    fn limits(&self) -> Limits {
        if let Some(limits) = &self.limits {
            return limits.clone();
        }
        self.referenced()
            .map(|d| d.limits().clone())
            .unwrap_or_default()
    }
}

/// Options after validation: values plus their wire strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedOptions {
    values: OptionValues,
    wire: BTreeMap<String, String>,
}

impl ResolvedOptions {
    /// Resolved values (the cache key).
    pub fn values(&self) -> &OptionValues {
        &self.values
    }

    /// Wire strings, for command templates.
    pub fn wire(&self) -> &BTreeMap<String, String> {
        &self.wire
    }

    /// One resolved value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Consume into the value map.
    pub fn into_values(self) -> OptionValues {
        self.values
    }
}

/// The closed option set of one device.
#[derive(Debug, Clone, Default)]
pub(crate) struct OptionSet {
    specs: Vec<OptionSpec>,
}

impl OptionSet {
    pub(crate) fn new(specs: Vec<OptionSpec>) -> Self {
        Self { specs }
    }

    pub(crate) fn specs(&self) -> &[OptionSpec] {
        &self.specs
    }

    pub(crate) fn references_devices(&self) -> bool {
        self.specs
            .iter()
            .any(|s| matches!(s.default, OptionDefault::Device(_)))
    }

    /// Validate explicit options and fill in defaults.
    pub(crate) fn resolve_values(&self, device: &str, given: &OptionValues) -> AppResult<OptionValues> {
        if let Some(unknown) = given.keys().find(|k| !self.specs.iter().any(|s| &s.name == *k)) {
            return Err(DaqError::InvalidArgument(format!(
                "{device} does not handle option {unknown}"
            )));
        }
        let mut values = OptionValues::new();
        for spec in &self.specs {
            let value = match given.get(&spec.name) {
                Some(v) => {
                    spec.limits().check(v).map_err(|e| {
                        DaqError::InvalidArgument(format!("{device} option {}: {e}", spec.name))
                    })?;
                    spec.canonical(v)?
                }
                None => {
                    let v = default_value(device, spec)?;
                    spec.limits().check(&v).map_err(|e| {
                        DaqError::InvalidAutoArgument(format!("{device} option {}: {e}", spec.name))
                    })?;
                    v
                }
            };
            values.insert(spec.name.clone(), value);
        }
        Ok(values)
    }

    /// Resolve and convert to wire strings.
    pub(crate) fn resolve(&self, device: &str, given: &OptionValues) -> AppResult<ResolvedOptions> {
        let values = self.resolve_values(device, given)?;
        let mut wire = BTreeMap::new();
        for spec in &self.specs {
            let Some(value) = values.get(&spec.name) else {
                continue;
            };
            let mut text = match spec.referenced() {
                Some(dev) => dev.codec().to_wire(value)?.into_text()?,
                None => value.to_string(),
            };
            if let Some(convert) = &spec.converter {
                text = convert(value, text);
            }
            wire.insert(spec.name.clone(), text);
        }
        Ok(ResolvedOptions { values, wire })
    }

    /// Push explicitly supplied values of `applied` options to their devices.
    pub(crate) fn apply(&self, given: &OptionValues) -> AppResult<()> {
        for spec in self.specs.iter().filter(|s| s.apply) {
            let (Some(value), Some(dev)) = (given.get(&spec.name), spec.referenced()) else {
                continue;
            };
            let current = dev.getcache()?;
            if !current.is_some_and(|c| c.loosely_equals(value)) {
                dev.set(value.clone())?;
            }
        }
        Ok(())
    }
}

fn default_value(device: &str, spec: &OptionSpec) -> AppResult<Value> {
    match &spec.default {
        OptionDefault::Required => Err(DaqError::InvalidArgument(format!(
            "{device} requires option {}",
            spec.name
        ))),
        OptionDefault::Value(v) => Ok(v.clone()),
        OptionDefault::Device(weak) => {
            let dev = weak
                .upgrade()
                .ok_or_else(|| DaqError::Detached(format!("{device} option {}", spec.name)))?;
            dev.getcache()?.ok_or_else(|| {
                DaqError::InvalidAutoArgument(format!(
                    "{device} option {}: {} has no confirmed value",
                    spec.name,
                    dev.name()
                ))
            })
        }
    }
}
