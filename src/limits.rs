//! Value constraints shared by devices and device options.

use crate::codec::{CheckFailure, ChoiceList, SharedCodec};
use crate::value::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Custom validation function; returns a message on failure.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Inclusive min/max bounds, an optional choice set and an optional custom check.
///
/// All present constraints must hold. The choice set is checked first so
/// record-valued devices report missing fields before range errors.
#[derive(Clone, Default)]
pub struct Limits {
    /// Smallest legal value (inclusive).
    pub min: Option<Value>,
    /// Largest legal value (inclusive).
    pub max: Option<Value>,
    /// Codec whose membership defines the legal values.
    pub choices: Option<SharedCodec>,
    /// Additional check.
    pub validator: Option<Validator>,
}

impl fmt::Debug for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limits")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("choices", &self.choices.as_ref().map(|c| c.describe()))
            .field("validator", &self.validator.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Limits {
    /// No constraint.
    pub fn none() -> Self {
        Self::default()
    }

    /// `min <= value <= max`.
    pub fn range(min: impl Into<Value>, max: impl Into<Value>) -> Self {
        Self {
            min: Some(min.into()),
            max: Some(max.into()),
            ..Self::default()
        }
    }

    /// `value >= min`.
    pub fn at_least(min: impl Into<Value>) -> Self {
        Self {
            min: Some(min.into()),
            ..Self::default()
        }
    }

    /// `value <= max`.
    pub fn at_most(max: impl Into<Value>) -> Self {
        Self {
            max: Some(max.into()),
            ..Self::default()
        }
    }

    /// Membership in `codec`.
    pub fn choices(codec: SharedCodec) -> Self {
        Self {
            choices: Some(codec),
            ..Self::default()
        }
    }

    /// Membership in a fixed list of values.
    pub fn one_of(values: Vec<Value>) -> Self {
        Self::choices(Arc::new(ChoiceList::new(values)))
    }

    /// Add a custom check.
    pub fn with_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }

    /// Whether nothing is constrained.
    pub fn is_unconstrained(&self) -> bool {
        self.min.is_none() && self.max.is_none() && self.choices.is_none() && self.validator.is_none()
    }

    /// Validate `value` against every present constraint.
    pub fn check(&self, value: &Value) -> Result<(), CheckFailure> {
        if let Some(choices) = &self.choices {
            choices.validate(value)?;
        }
        if let Some(min) = &self.min {
            match value.compare(min) {
                Some(Ordering::Less) => {
                    return Err(CheckFailure::Invalid(format!("{value} is below MIN={min}")))
                }
                None => {
                    return Err(CheckFailure::Invalid(format!(
                        "{value} cannot be compared with MIN={min}"
                    )))
                }
                _ => {}
            }
        }
        if let Some(max) = &self.max {
            match value.compare(max) {
                Some(Ordering::Greater) => {
                    return Err(CheckFailure::Invalid(format!("{value} is above MAX={max}")))
                }
                None => {
                    return Err(CheckFailure::Invalid(format!(
                        "{value} cannot be compared with MAX={max}"
                    )))
                }
                _ => {}
            }
        }
        if let Some(validator) = &self.validator {
            validator(value).map_err(CheckFailure::Invalid)?;
        }
        Ok(())
    }
}
