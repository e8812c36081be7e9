//! Conversion between device values and their wire representation.
//!
//! A [`Codec`] is pure: it turns a [`Value`] into the text (or bytes) sent to
//! an instrument and parses replies back. Codecs that restrict the legal values
//! ("choices") also answer membership questions used by validation.
//!
//! For every legal `v`, `from_wire(&to_wire(&v)?)? == v`, and `to_wire` rejects
//! values that `contains` refuses.
//!
//! # Provided codecs
//!
//! - scalar: [`FloatCodec`], [`IntCodec`], [`BoolCodec`], [`TextCodec`], [`BytesCodec`]
//! - choices: [`ChoiceStrings`], [`ChoiceSimpleMap`], [`ChoiceIndex`], [`ChoiceList`],
//!   [`ChoiceMultiple`], [`ChoiceDevDep`]

mod choice;
mod dependent;
mod scalar;

pub use choice::{ChoiceIndex, ChoiceList, ChoiceMultiple, ChoiceSimpleMap, ChoiceStrings, FieldSpec};
pub use dependent::ChoiceDevDep;
pub use scalar::{BoolCodec, BytesCodec, FloatCodec, IntCodec, TextCodec};

use crate::error::{AppResult, DaqError};
use crate::value::Value;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Shared, type-erased codec.
pub type SharedCodec = Arc<dyn Codec>;

// =============================================================================
// Wire representation
// =============================================================================

/// What travels over the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wire {
    /// Text command or reply.
    Text(String),
    /// Raw reply bytes.
    Bytes(Vec<u8>),
}

impl Wire {
    /// Text view; bytes must be valid UTF-8.
    pub fn as_text(&self) -> AppResult<Cow<'_, str>> {
        match self {
            Wire::Text(s) => Ok(Cow::Borrowed(s)),
            Wire::Bytes(b) => std::str::from_utf8(b)
                .map(Cow::Borrowed)
                .map_err(|e| DaqError::Conversion(format!("reply is not text: {e}"))),
        }
    }

    /// Owned text; bytes must be valid UTF-8.
    pub fn into_text(self) -> AppResult<String> {
        match self {
            Wire::Text(s) => Ok(s),
            Wire::Bytes(b) => String::from_utf8(b)
                .map_err(|e| DaqError::Conversion(format!("reply is not text: {e}"))),
        }
    }

    /// Raw bytes of either variant.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Wire::Text(s) => s.into_bytes(),
            Wire::Bytes(b) => b,
        }
    }
}

impl From<String> for Wire {
    fn from(s: String) -> Self {
        Wire::Text(s)
    }
}

impl From<&str> for Wire {
    fn from(s: &str) -> Self {
        Wire::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Wire {
    fn from(b: Vec<u8>) -> Self {
        Wire::Bytes(b)
    }
}

// =============================================================================
// Validation outcome
// =============================================================================

/// Why a value was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckFailure {
    /// Out of range, not a member, or wrong type.
    Invalid(String),
    /// A record lacks some of the fields a multi-field codec requires.
    MissingFields(Vec<String>),
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckFailure::Invalid(msg) => write!(f, "{msg}"),
            CheckFailure::MissingFields(keys) => write!(f, "missing fields: {}", keys.join(", ")),
        }
    }
}

// =============================================================================
// Codec trait
// =============================================================================

/// Bidirectional converter between a [`Value`] and its wire form.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Encode a legal value. Values refused by [`contains`](Self::contains) are errors.
    fn to_wire(&self, value: &Value) -> AppResult<Wire>;

    /// Decode a reply.
    fn from_wire(&self, wire: &Wire) -> AppResult<Value>;

    /// Whether `value` is legal for this codec.
    fn contains(&self, value: &Value) -> bool;

    /// Human-readable description of the legal values.
    fn describe(&self) -> String;

    /// Canonical form of a legal value: what reading it back would return.
    fn normalize(&self, value: &Value) -> AppResult<Value> {
        self.from_wire(&self.to_wire(value)?)
    }

    /// Detailed membership check used by device validation.
    fn validate(&self, value: &Value) -> Result<(), CheckFailure> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(CheckFailure::Invalid(format!(
                "invalid value ({value}): use one of {}",
                self.describe()
            )))
        }
    }

    /// Downcast to a record codec.
    fn as_multiple(&self) -> Option<&ChoiceMultiple> {
        None
    }
}

/// Refuse values the codec does not contain, with a `Conversion` error.
pub(crate) fn ensure_contains(codec: &dyn Codec, value: &Value) -> AppResult<()> {
    codec
        .validate(value)
        .map_err(|failure| DaqError::Conversion(failure.to_string()))
}

/// Strip one pair of matching surrounding quotes.
pub(crate) fn strip_quotes(s: &str) -> &str {
    let t = s.trim();
    for q in ['"', '\''] {
        if t.len() >= 2 && t.starts_with(q) && t.ends_with(q) {
            return &t[1..t.len() - 1];
        }
    }
    t
}
