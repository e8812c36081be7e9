//! Codecs restricting values to a set of choices.

use super::{ensure_contains, strip_quotes, CheckFailure, Codec, SharedCodec, Wire};
use crate::error::{AppResult, DaqError};
use crate::limits::Limits;
use crate::value::{Record, Value};
use std::fmt;

// =============================================================================
// ChoiceStrings
// =============================================================================

/// Case-insensitive keywords with optional abbreviations.
///
/// Each keyword is given SCPI style: the uppercase prefix is the short form,
/// the whole word the long form (`"VOLTage"` accepts `volt` and `voltage`).
/// Values are canonicalized to the lowercase long form.
#[derive(Debug, Clone)]
pub struct ChoiceStrings {
    /// (short, long), both lowercase
    names: Vec<(String, String)>,
    quoted: bool,
}

impl ChoiceStrings {
    /// Keywords in SCPI mixed-case notation.
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Self {
        let names = keywords
            .iter()
            .map(|k| {
                let k = k.as_ref();
                let short: String = k.chars().take_while(|c| !c.is_ascii_lowercase()).collect();
                let short = if short.is_empty() { k } else { short.as_str() };
                (short.to_ascii_lowercase(), k.to_ascii_lowercase())
            })
            .collect();
        Self {
            names,
            quoted: false,
        }
    }

    /// Send keywords inside double quotes.
    pub fn quoted(mut self) -> Self {
        self.quoted = true;
        self
    }

    fn canonical(&self, text: &str) -> Option<&str> {
        let t = text.to_ascii_lowercase();
        self.names
            .iter()
            .find(|(short, long)| *short == t || *long == t)
            .map(|(_, long)| long.as_str())
    }
}

impl Codec for ChoiceStrings {
    fn to_wire(&self, value: &Value) -> AppResult<Wire> {
        ensure_contains(self, value)?;
        let s = value.as_str().and_then(|s| self.canonical(s)).unwrap_or_default();
        Ok(Wire::Text(if self.quoted {
            format!("\"{s}\"")
        } else {
            s.to_string()
        }))
    }

    fn from_wire(&self, wire: &Wire) -> AppResult<Value> {
        let text = wire.as_text()?;
        let t = strip_quotes(&text);
        self.canonical(t)
            .map(|long| Value::Text(long.to_string()))
            .ok_or_else(|| DaqError::Conversion(format!("unknown keyword {t:?}")))
    }

    fn contains(&self, value: &Value) -> bool {
        value.as_str().is_some_and(|s| self.canonical(s).is_some())
    }

    fn describe(&self) -> String {
        let names: Vec<&str> = self.names.iter().map(|(_, long)| long.as_str()).collect();
        format!("[{}]", names.join(", "))
    }
}

// =============================================================================
// ChoiceSimpleMap
// =============================================================================

/// Explicit table between wire keys and values.
///
/// `to_wire` uses the first entry matching the value; `from_wire` accepts
/// every entry, so aliases (`"1"` for `"ON"`) can follow the canonical key.
#[derive(Debug, Clone)]
pub struct ChoiceSimpleMap {
    entries: Vec<(String, Value)>,
    uppercase: bool,
}

impl ChoiceSimpleMap {
    /// Table of `(wire, value)` pairs.
    pub fn new<K: Into<String>, V: Into<Value>>(entries: Vec<(K, V)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            uppercase: false,
        }
    }

    /// Compare replies case-insensitively (keys must be uppercase).
    pub fn uppercase_replies(mut self) -> Self {
        self.uppercase = true;
        self
    }

    /// `ON`/`OFF` boolean, also parsing `1`/`0` replies.
    pub fn on_off() -> Self {
        Self::new(vec![("ON", true), ("OFF", false), ("1", true), ("0", false)]).uppercase_replies()
    }
}

impl Codec for ChoiceSimpleMap {
    fn to_wire(&self, value: &Value) -> AppResult<Wire> {
        self.entries
            .iter()
            .find(|(_, v)| v.loosely_equals(value))
            .map(|(k, _)| Wire::Text(k.clone()))
            .ok_or_else(|| {
                DaqError::Conversion(format!("invalid value ({value}): use one of {}", self.describe()))
            })
    }

    fn from_wire(&self, wire: &Wire) -> AppResult<Value> {
        let text = wire.as_text()?;
        let mut key = strip_quotes(&text).to_string();
        if self.uppercase {
            key = key.to_ascii_uppercase();
        }
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| DaqError::Conversion(format!("unexpected reply {key:?}")))
    }

    fn contains(&self, value: &Value) -> bool {
        self.entries.iter().any(|(_, v)| v.loosely_equals(value))
    }

    fn describe(&self) -> String {
        let mut seen: Vec<String> = Vec::new();
        for (_, v) in &self.entries {
            let s = v.to_string();
            if !seen.contains(&s) {
                seen.push(s);
            }
        }
        format!("[{}]", seen.join(", "))
    }
}

// =============================================================================
// ChoiceIndex
// =============================================================================

/// Values addressed on the wire by their position (plus an offset).
#[derive(Debug, Clone)]
pub struct ChoiceIndex {
    values: Vec<Value>,
    offset: i64,
    normalize: bool,
}

impl ChoiceIndex {
    /// `values[i]` is sent as `i`.
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            offset: 0,
            normalize: false,
        }
    }

    /// `values[i]` is sent as `i + offset`.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    /// Compare floats at 13 significant digits, so `0.1 + 0.2` finds `0.3`.
    pub fn normalized(mut self) -> Self {
        self.normalize = true;
        self
    }

    fn position(&self, value: &Value) -> Option<usize> {
        if self.normalize {
            if let Some(f) = value.as_f64() {
                let key = format!("{f:.12e}");
                return self
                    .values
                    .iter()
                    .position(|v| v.as_f64().is_some_and(|g| format!("{g:.12e}") == key));
            }
        }
        self.values.iter().position(|v| v.loosely_equals(value))
    }
}

impl Codec for ChoiceIndex {
    fn to_wire(&self, value: &Value) -> AppResult<Wire> {
        let pos = self.position(value).ok_or_else(|| {
            DaqError::Conversion(format!("invalid value ({value}): use one of {}", self.describe()))
        })?;
        Ok(Wire::Text((pos as i64 + self.offset).to_string()))
    }

    fn from_wire(&self, wire: &Wire) -> AppResult<Value> {
        let text = wire.as_text()?;
        let t = text.trim();
        let index: i64 = t
            .parse()
            .map_err(|_| DaqError::Conversion(format!("invalid index {t:?}")))?;
        usize::try_from(index - self.offset)
            .ok()
            .and_then(|i| self.values.get(i))
            .cloned()
            .ok_or_else(|| DaqError::Conversion(format!("index {index} out of range")))
    }

    fn contains(&self, value: &Value) -> bool {
        self.position(value).is_some()
    }

    fn describe(&self) -> String {
        let items: Vec<String> = self.values.iter().map(Value::to_string).collect();
        format!("[{}]", items.join(", "))
    }
}

// =============================================================================
// ChoiceList
// =============================================================================

/// Fixed list of legal values, encoded with an inner codec.
#[derive(Debug, Clone)]
pub struct ChoiceList {
    values: Vec<Value>,
    inner: Option<SharedCodec>,
}

impl ChoiceList {
    /// Legal `values`, written with their display form.
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            inner: None,
        }
    }

    /// Encode and decode through `codec`.
    pub fn with_codec(mut self, codec: SharedCodec) -> Self {
        self.inner = Some(codec);
        self
    }
}

impl ChoiceList {
    fn entry(&self, value: &Value) -> Option<&Value> {
        self.values.iter().find(|v| v.loosely_equals(value))
    }
}

impl Codec for ChoiceList {
    fn to_wire(&self, value: &Value) -> AppResult<Wire> {
        let entry = self.entry(value).ok_or_else(|| {
            DaqError::Conversion(format!("invalid value ({value}): use one of {}", self.describe()))
        })?;
        match &self.inner {
            Some(codec) => codec.to_wire(entry),
            None => Ok(Wire::Text(entry.to_string())),
        }
    }

    /// Replies matching an entry come back as that entry.
    fn from_wire(&self, wire: &Wire) -> AppResult<Value> {
        match &self.inner {
            Some(codec) => {
                let value = codec.from_wire(wire)?;
                Ok(self.entry(&value).cloned().unwrap_or(value))
            }
            None => {
                let text = wire.as_text()?;
                let t = text.trim();
                self.values
                    .iter()
                    .find(|v| v.to_string() == t)
                    .cloned()
                    .ok_or_else(|| DaqError::Conversion(format!("unexpected reply {t:?}")))
            }
        }
    }

    fn contains(&self, value: &Value) -> bool {
        self.entry(value).is_some()
    }

    fn describe(&self) -> String {
        let items: Vec<String> = self.values.iter().map(Value::to_string).collect();
        format!("[{}]", items.join(", "))
    }
}

// =============================================================================
// ChoiceMultiple
// =============================================================================

/// One field of a [`ChoiceMultiple`] record.
#[derive(Clone)]
pub struct FieldSpec {
    /// Record key.
    pub name: String,
    /// Codec of this field.
    pub codec: SharedCodec,
    /// Constraint on this field.
    pub limits: Limits,
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("name", &self.name)
            .field("codec", &self.codec.describe())
            .field("limits", &self.limits)
            .finish()
    }
}

impl FieldSpec {
    /// Field `name` encoded with `codec`, unconstrained.
    pub fn new(name: impl Into<String>, codec: SharedCodec) -> Self {
        Self {
            name: name.into(),
            codec,
            limits: Limits::none(),
        }
    }

    /// Constrain this field.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

/// Record of named fields sent as one separated string (`"1.5,ON,3"`).
#[derive(Debug, Clone)]
pub struct ChoiceMultiple {
    fields: Vec<FieldSpec>,
    separator: String,
}

impl ChoiceMultiple {
    /// Fields in wire order, comma separated.
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            separator: ",".to_string(),
        }
    }

    /// Use another separator.
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Field specs in wire order.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Field spec by name.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field names in wire order.
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }
}

impl Codec for ChoiceMultiple {
    fn to_wire(&self, value: &Value) -> AppResult<Wire> {
        ensure_contains(self, value)?;
        let record = value.as_record().cloned().unwrap_or_default();
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let v = record
                .get(&field.name)
                .ok_or_else(|| DaqError::Conversion(format!("missing field {}", field.name)))?;
            parts.push(field.codec.to_wire(v)?.into_text()?);
        }
        Ok(Wire::Text(parts.join(&self.separator)))
    }

    fn from_wire(&self, wire: &Wire) -> AppResult<Value> {
        let text = wire.as_text()?;
        let parts: Vec<&str> = text
            .trim_end_matches(['\r', '\n'])
            .split(self.separator.as_str())
            .collect();
        if parts.len() != self.fields.len() {
            return Err(DaqError::Conversion(format!(
                "expected {} fields, got {} in {text:?}",
                self.fields.len(),
                parts.len()
            )));
        }
        let mut record = Record::new();
        for (field, part) in self.fields.iter().zip(parts) {
            record.insert(field.name.clone(), field.codec.from_wire(&Wire::from(part))?);
        }
        Ok(Value::Record(record))
    }

    fn contains(&self, value: &Value) -> bool {
        self.validate(value).is_ok()
    }

    fn validate(&self, value: &Value) -> Result<(), CheckFailure> {
        let record = value
            .as_record()
            .ok_or_else(|| CheckFailure::Invalid(format!("expected a record, got {}", value.kind())))?;
        let unknown: Vec<&String> = record.keys().filter(|k| self.field(k).is_none()).collect();
        if !unknown.is_empty() {
            let names: Vec<&str> = unknown.iter().map(|s| s.as_str()).collect();
            return Err(CheckFailure::Invalid(format!(
                "unknown fields {} (use {})",
                names.join(", "),
                self.field_names().join(", ")
            )));
        }
        let missing: Vec<String> = self
            .fields
            .iter()
            .filter(|f| !record.contains_key(&f.name))
            .map(|f| f.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(CheckFailure::MissingFields(missing));
        }
        for field in &self.fields {
            let v = &record[&field.name];
            field.codec.validate(v).map_err(|e| prefix(&field.name, e))?;
            field.limits.check(v).map_err(|e| prefix(&field.name, e))?;
            let wire = field
                .codec
                .to_wire(v)
                .and_then(Wire::into_text)
                .map_err(|e| CheckFailure::Invalid(format!("{}: {e}", field.name)))?;
            if wire.contains(self.separator.as_str()) {
                return Err(CheckFailure::Invalid(format!(
                    "{}: {wire:?} contains the separator {:?}",
                    field.name, self.separator
                )));
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let items: Vec<String> = self
            .fields
            .iter()
            .map(|f| format!("{}: {}", f.name, f.codec.describe()))
            .collect();
        format!("{{{}}}", items.join(", "))
    }

    fn as_multiple(&self) -> Option<&ChoiceMultiple> {
        Some(self)
    }
}

fn prefix(field: &str, failure: CheckFailure) -> CheckFailure {
    match failure {
        CheckFailure::Invalid(msg) => CheckFailure::Invalid(format!("{field}: {msg}")),
        other => other,
    }
}
