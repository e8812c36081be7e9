//! Choice set selected by another device's current value.

use super::{CheckFailure, Codec, SharedCodec, Wire};
use crate::device::Device;
use crate::error::{AppResult, DaqError};
use crate::value::Value;
use std::fmt;
use std::sync::{Arc, Weak};

/// Delegates to one of several codecs depending on the cached value of a
/// selector device (for example the legal ranges depend on the function).
///
/// The selector is held weakly: it belongs to its instrument.
pub struct ChoiceDevDep {
    selector: Weak<Device>,
    selector_name: String,
    table: Vec<(Value, SharedCodec)>,
    fallback: Option<SharedCodec>,
}

impl fmt::Debug for ChoiceDevDep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChoiceDevDep")
            .field("selector", &self.selector_name)
            .field("cases", &self.table.len())
            .finish()
    }
}

impl ChoiceDevDep {
    /// Select among `table` by the value of `selector`.
    pub fn new(selector: &Arc<Device>, table: Vec<(Value, SharedCodec)>) -> Self {
        Self {
            selector: Arc::downgrade(selector),
            selector_name: selector.name().to_string(),
            table,
            fallback: None,
        }
    }

    /// Codec used when the selector value matches no case.
    pub fn with_fallback(mut self, codec: SharedCodec) -> Self {
        self.fallback = Some(codec);
        self
    }

    /// Codec selected by the selector's current cached value.
    pub fn current(&self) -> AppResult<SharedCodec> {
        let selector = self
            .selector
            .upgrade()
            .ok_or_else(|| DaqError::Detached(self.selector_name.clone()))?;
        let key = selector.getcache()?.ok_or_else(|| {
            DaqError::InvalidAutoArgument(format!(
                "{} has no value to select choices from",
                self.selector_name
            ))
        })?;
        self.table
            .iter()
            .find(|(k, _)| k.loosely_equals(&key))
            .map(|(_, codec)| Arc::clone(codec))
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| {
                DaqError::InvalidAutoArgument(format!(
                    "no choices for {}={key}",
                    self.selector_name
                ))
            })
    }
}

impl Codec for ChoiceDevDep {
    fn to_wire(&self, value: &Value) -> AppResult<Wire> {
        self.current()?.to_wire(value)
    }

    fn from_wire(&self, wire: &Wire) -> AppResult<Value> {
        self.current()?.from_wire(wire)
    }

    fn contains(&self, value: &Value) -> bool {
        self.current().is_ok_and(|codec| codec.contains(value))
    }

    fn validate(&self, value: &Value) -> Result<(), CheckFailure> {
        match self.current() {
            Ok(codec) => codec.validate(value),
            Err(err) => Err(CheckFailure::Invalid(err.to_string())),
        }
    }

    fn describe(&self) -> String {
        match self.current() {
            Ok(codec) => codec.describe(),
            Err(_) => format!("<depends on {}>", self.selector_name),
        }
    }
}
