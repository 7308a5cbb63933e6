//! Helpers for reading a decoded protocol document.
//!
//! Documents arrive as generic `serde_json::Value` trees. YAML authors often write
//! a single record where a list is expected, so every sequence-shaped field goes
//! through [`as_sequence`] before anything else looks at it.

use serde_json::Value;

use crate::error::{AppResult, ExperimentError};
use crate::protocol::model::Params;

/// Normalize a singleton-or-list field into an ordered, possibly empty sequence.
///
/// `None` and `null` become an empty sequence, a list is returned as-is, and any
/// other value becomes a one-element sequence.
pub fn as_sequence(value: Option<&Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

/// Read an integer, accepting integral floats (`3.0`) as YAML tooling sometimes emits them.
pub fn as_integer(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    if let Some(u) = value.as_u64() {
        return i64::try_from(u).ok();
    }
    value
        .as_f64()
        .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64)
        .map(|f| f as i64)
}

/// A record within the document together with its path, used for error context.
#[derive(Debug, Clone, Copy)]
pub struct Section<'a> {
    pub path: &'a str,
    pub map: &'a Params,
}

impl<'a> Section<'a> {
    /// View `value` as a record or fail with a validation error naming `path`.
    pub fn new(path: &'a str, value: &'a Value) -> AppResult<Self> {
        match value.as_object() {
            Some(map) => Ok(Self { path, map }),
            None => Err(ExperimentError::validation(
                path,
                format!("expected a record, got {}", type_name(value)),
            )),
        }
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    pub fn error(&self, message: impl Into<String>) -> ExperimentError {
        ExperimentError::validation(self.path, message)
    }

    pub fn require(&self, key: &str) -> AppResult<&'a Value> {
        self.get(key)
            .ok_or_else(|| self.error(format!("missing required field '{}'", key)))
    }

    pub fn require_str(&self, key: &str) -> AppResult<&'a str> {
        match self.require(key)? {
            Value::String(s) if !s.trim().is_empty() => Ok(s.as_str()),
            Value::String(_) => Err(self.error(format!("'{}' must not be empty", key))),
            other => Err(self.error(format!(
                "'{}' must be a string, got {}",
                key,
                type_name(other)
            ))),
        }
    }

    pub fn optional_str(&self, key: &str) -> AppResult<Option<&'a str>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(self.error(format!(
                "'{}' must be a string, got {}",
                key,
                type_name(other)
            ))),
        }
    }

    /// Required integer `>= min`.
    pub fn require_u64(&self, key: &str, min: u64) -> AppResult<u64> {
        let value = self.require(key)?;
        self.to_u64(key, value, min)
    }

    pub fn optional_u64(&self, key: &str, min: u64) -> AppResult<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => self.to_u64(key, value, min).map(Some),
        }
    }

    fn to_u64(&self, key: &str, value: &Value, min: u64) -> AppResult<u64> {
        if let Some(u) = value.as_u64() {
            return if u >= min {
                Ok(u)
            } else {
                Err(self.error(format!("'{}' must be >= {}, got {}", key, min, u)))
            };
        }
        match as_integer(value) {
            Some(i) if i >= 0 && (i as u64) >= min => Ok(i as u64),
            Some(i) => Err(self.error(format!("'{}' must be >= {}, got {}", key, min, i))),
            None => Err(self.error(format!(
                "'{}' must be an integer, got {}",
                key,
                type_name(value)
            ))),
        }
    }

    pub fn optional_bool(&self, key: &str) -> AppResult<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(self.error(format!(
                "'{}' must be true or false, got {}",
                key,
                type_name(other)
            ))),
        }
    }

    pub fn optional_record(&self, key: &str) -> AppResult<Option<&'a Params>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(other) => Err(self.error(format!(
                "'{}' must be a record, got {}",
                key,
                type_name(other)
            ))),
        }
    }
}

/// JSON-ish type name for error messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a record",
    }
}
