//! Dynamic value type stored under table keys.

use std::cmp::Ordering;

/// A dynamic value.
///
/// This type represents any value MikroDB can store. Integers are limited
/// to the signed 32-bit range; anything wider is carried as a [`Value::Float`].
/// Objects preserve insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed 32-bit integer.
    Int(i32),
    /// Double-precision float.
    Float(f64),
    /// Text string (UTF-8).
    Str(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Object of key-value pairs, in insertion order.
    Object(Vec<(String, Value)>),
    /// Timestamp in milliseconds since the Unix epoch.
    Date(i64),
}

impl Value {
    /// Create an integer value from an `i64`, widening to a float when the
    /// value does not fit the signed 32-bit range.
    #[must_use]
    pub fn from_i64(n: i64) -> Self {
        match i32::try_from(n) {
            Ok(n) => Value::Int(n),
            #[allow(clippy::cast_precision_loss)]
            Err(_) => Value::Float(n as f64),
        }
    }

    /// Check if this value is null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    #[must_use]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value on the shared numeric axis, if it is numeric.
    ///
    /// Integers, floats and dates all compare as `f64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(f64::from(*n)),
            Value::Float(f) => Some(*f),
            #[allow(clippy::cast_precision_loss)]
            Value::Date(ms) => Some(*ms as f64),
            _ => None,
        }
    }

    /// Get this value as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as an object, if it is one.
    #[must_use]
    pub fn as_object(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Look up a key in this object value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Compare two values for equality, treating all numeric variants as
    /// one domain: `Int(5)`, `Float(5.0)` and `Date(5)` are equal.
    #[must_use]
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self == other,
            _ => false,
        }
    }

    /// Compare two values on the numeric axis.
    ///
    /// Returns `None` when either side is not numeric or the comparison is
    /// undefined (NaN).
    #[must_use]
    pub fn numeric_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::from_i64(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}
