//! Conversions between the wire [`Value`] type and ordinary Rust values.
//!
//! The wire format intentionally mirrors the JSON data model (null, bool,
//! number, string, list, map) rather than carrying Rust-specific typing, so
//! kwargs and results can cross the process boundary without the sender and
//! receiver sharing a schema. Call sites build these with `Value::from(...)`
//! and read them back with the `as_*`/`into_*` helpers below.

use std::collections::HashMap;

use crate::proto::{value::Kind, ListValue, StructValue, Value};

impl Value {
    pub fn null() -> Self {
        Value { kind: Some(Kind::NullValue(true)) }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, None | Some(Kind::NullValue(_)))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.kind {
            Some(Kind::BoolValue(b)) => Some(b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.kind {
            Some(Kind::NumberValue(n)) => Some(n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            Some(Kind::StringValue(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match &self.kind {
            Some(Kind::ListValue(l)) => Some(&l.values),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match &self.kind {
            Some(Kind::StructValue(s)) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value { kind: Some(Kind::BoolValue(b)) }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value { kind: Some(Kind::NumberValue(n)) }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value { kind: Some(Kind::NumberValue(n as f64)) }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value { kind: Some(Kind::StringValue(s)) }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value { kind: Some(Kind::StringValue(s.to_string())) }
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value { kind: Some(Kind::ListValue(ListValue { values })) }
    }
}

impl From<StructValue> for Value {
    fn from(s: StructValue) -> Self {
        Value { kind: Some(Kind::StructValue(s)) }
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::null(),
        }
    }
}

impl StructValue {
    pub fn new() -> Self {
        Self { fields: HashMap::new() }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

impl Default for StructValue {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a kwargs struct from `(name, value)` pairs.
///
/// ```ignore
/// let kwargs = kwargs([("x", Value::from(1.0)), ("y", Value::from("hi"))]);
/// ```
pub fn kwargs<const N: usize>(pairs: [(&str, Value); N]) -> StructValue {
    let mut s = StructValue::new();
    for (k, v) in pairs {
        s.fields.insert(k.to_string(), v);
    }
    s
}
