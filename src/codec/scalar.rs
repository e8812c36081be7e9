//! Codecs for plain scalar values.

use super::{ensure_contains, strip_quotes, Codec, Wire};
use crate::error::{AppResult, DaqError};
use crate::value::Value;

fn parse_error(kind: &str, text: &str) -> DaqError {
    DaqError::Conversion(format!("cannot parse {kind} from {text:?}"))
}

/// Floating point, written with full round-trip precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct FloatCodec;

impl Codec for FloatCodec {
    fn to_wire(&self, value: &Value) -> AppResult<Wire> {
        ensure_contains(self, value)?;
        let v = value.as_f64().unwrap_or_default();
        Ok(Wire::Text(format!("{v:?}")))
    }

    fn from_wire(&self, wire: &Wire) -> AppResult<Value> {
        let text = wire.as_text()?;
        let t = text.trim();
        t.parse::<f64>()
            .map(Value::Float)
            .map_err(|_| parse_error("float", t))
    }

    fn contains(&self, value: &Value) -> bool {
        matches!(value, Value::Float(_) | Value::Int(_))
    }

    fn describe(&self) -> String {
        "float".to_string()
    }
}

/// Integer. Replies such as `5.000E+00` are accepted when integral.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntCodec;

impl Codec for IntCodec {
    fn to_wire(&self, value: &Value) -> AppResult<Wire> {
        ensure_contains(self, value)?;
        let v = value.as_i64().unwrap_or_default();
        Ok(Wire::Text(v.to_string()))
    }

    fn from_wire(&self, wire: &Wire) -> AppResult<Value> {
        let text = wire.as_text()?;
        let t = text.trim();
        if let Ok(v) = t.parse::<i64>() {
            return Ok(Value::Int(v));
        }
        match t.parse::<f64>() {
            Ok(f) if f.fract() == 0.0 && f.is_finite() => Ok(Value::Int(f as i64)),
            _ => Err(parse_error("int", t)),
        }
    }

    fn contains(&self, value: &Value) -> bool {
        !matches!(value, Value::Bool(_)) && value.as_i64().is_some()
    }

    fn describe(&self) -> String {
        "int".to_string()
    }
}

/// Boolean written as `1`/`0`; replies `ON`/`OFF`/`TRUE`/`FALSE` are accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolCodec;

impl Codec for BoolCodec {
    fn to_wire(&self, value: &Value) -> AppResult<Wire> {
        ensure_contains(self, value)?;
        let v = value.as_bool().unwrap_or_default();
        Ok(Wire::Text(if v { "1" } else { "0" }.to_string()))
    }

    fn from_wire(&self, wire: &Wire) -> AppResult<Value> {
        let text = wire.as_text()?;
        let t = strip_quotes(&text).to_ascii_uppercase();
        match t.as_str() {
            "1" | "ON" | "TRUE" => Ok(Value::Bool(true)),
            "0" | "OFF" | "FALSE" => Ok(Value::Bool(false)),
            other => other
                .parse::<i64>()
                .map(|v| Value::Bool(v != 0))
                .map_err(|_| parse_error("bool", other)),
        }
    }

    fn contains(&self, value: &Value) -> bool {
        value.as_bool().is_some()
    }

    fn describe(&self) -> String {
        "bool".to_string()
    }
}

/// Free text, optionally sent inside double quotes.
///
/// Unquoted text cannot end with a line terminator: replies are read up to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec {
    quoted: bool,
}

impl TextCodec {
    /// Unquoted text.
    pub fn new() -> Self {
        Self { quoted: false }
    }

    /// Text sent as `"value"`; quotes are stripped from replies.
    pub fn quoted() -> Self {
        Self { quoted: true }
    }
}

impl Codec for TextCodec {
    fn to_wire(&self, value: &Value) -> AppResult<Wire> {
        ensure_contains(self, value)?;
        let s = value.as_str().unwrap_or_default();
        Ok(Wire::Text(if self.quoted {
            format!("\"{s}\"")
        } else {
            s.to_string()
        }))
    }

    fn from_wire(&self, wire: &Wire) -> AppResult<Value> {
        let text = wire.as_text()?;
        let t = if self.quoted {
            strip_quotes(&text)
        } else {
            text.trim_end_matches(['\r', '\n'])
        };
        Ok(Value::Text(t.to_string()))
    }

    fn contains(&self, value: &Value) -> bool {
        match value {
            Value::Text(s) => self.quoted || !s.ends_with(['\r', '\n']),
            _ => false,
        }
    }

    fn describe(&self) -> String {
        "text".to_string()
    }
}

/// Raw bytes, passed through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn to_wire(&self, value: &Value) -> AppResult<Wire> {
        match value {
            Value::Bytes(b) => Ok(Wire::Bytes(b.clone())),
            other => Err(DaqError::Conversion(format!(
                "expected bytes, got {}",
                other.kind()
            ))),
        }
    }

    fn from_wire(&self, wire: &Wire) -> AppResult<Value> {
        Ok(Value::Bytes(wire.clone().into_bytes()))
    }

    fn contains(&self, value: &Value) -> bool {
        matches!(value, Value::Bytes(_))
    }

    fn describe(&self) -> String {
        "bytes".to_string()
    }
}
