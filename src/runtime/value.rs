// src/runtime/value.rs
//! Dynamic value type flowing through template rendering
//!
//! `Missing` (a failed lookup) and `Null` (an explicit null) are distinct so
//! helper fallback chains can tell "not there" from "there and null".
//! Objects use a `BTreeMap` so iteration order — and therefore `each` output —
//! is deterministic for both backends.

use crate::RenderError;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

pub type ValueMap = BTreeMap<String, Value>;

/// Dynamic value type.
#[derive(Debug, Clone)]
pub enum Value {
    Missing,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Pre-escaped content; bypasses the escaping step.
    SafeString(String),
    Array(Vec<Value>),
    Object(ValueMap),
    /// A callable context value, resolved before use.
    Lambda(Lambda),
}

/// Arguments handed to a context lambda when it is resolved or used as a
/// helper-chain fallback.
pub struct LambdaCall<'a> {
    pub context: &'a Value,
    pub params: &'a [Value],
}

/// Callable wrapper; context values of this shape are invoked with the
/// current context before rendering.
#[derive(Clone)]
pub struct Lambda(Rc<dyn Fn(&LambdaCall<'_>) -> Result<Value, RenderError>>);

impl Lambda {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&LambdaCall<'_>) -> Result<Value, RenderError> + 'static,
    {
        Lambda(Rc::new(f))
    }

    pub fn call(&self, context: &Value, params: &[Value]) -> Result<Value, RenderError> {
        (self.0)(&LambdaCall { context, params })
    }
}

impl fmt::Debug for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lambda(..)")
    }
}

impl Value {
    /// Falsy test used by conditionals and falsy-mode path walks: missing,
    /// null, false, zero, the empty string and the empty array.
    pub fn is_falsy(&self) -> bool {
        match self {
            Value::Missing | Value::Null => true,
            Value::Bool(b) => !*b,
            Value::Int(n) => *n == 0,
            Value::Float(f) => *f == 0.0,
            Value::String(s) | Value::SafeString(s) => s.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(_) | Value::Lambda(_) => false,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// Missing or explicit null.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Missing | Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::SafeString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_lambda(&self) -> Option<&Lambda> {
        match self {
            Value::Lambda(l) => Some(l),
            _ => None,
        }
    }

    /// Member access: object key or numeric array index.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    /// Stringification for unescaped output. Missing and null render empty;
    /// `js_compat` controls whether arrays and objects stringify the way a
    /// JavaScript host would.
    pub fn render(&self, js_compat: bool) -> String {
        match self {
            Value::Missing | Value::Null | Value::Lambda(_) => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => format_float(*f),
            Value::String(s) | Value::SafeString(s) => s.clone(),
            Value::Array(items) => {
                if js_compat {
                    items
                        .iter()
                        .map(|v| v.render(js_compat))
                        .collect::<Vec<_>>()
                        .join(",")
                } else {
                    String::new()
                }
            }
            Value::Object(_) => {
                if js_compat {
                    "[object Object]".to_string()
                } else {
                    String::new()
                }
            }
        }
    }

    pub fn object(map: ValueMap) -> Self {
        Value::Object(map)
    }
}

/// Whole floats print without a fraction, matching the source host's
/// number-to-string behavior.
fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Missing, Value::Missing) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::SafeString(a), Value::SafeString(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Lambda(a), Value::Lambda(b)) => Rc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", format_float(*n)),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::SafeString(s) => write!(f, "{}", s),
            Value::Lambda(_) => write!(f, "<lambda>"),
            Value::Array(arr) => {
                write!(f, "[")?;
                for (i, val) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", val)?;
                }
                write!(f, "]")
            }
            Value::Object(obj) => {
                write!(f, "{{")?;
                for (i, (k, v)) in obj.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

// Convenient conversions
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(|x| x.into()).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}
