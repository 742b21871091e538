//! Dynamically typed values crossing the bridge

use std::fmt;

use crate::handle::RawHandle;

/// A value as seen by the bridge when the static type is not known
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value (`nil` on the script side)
    Ignored,
    /// Boolean value
    Bool(bool),
    /// Number value
    Number(f64),
    /// String value, owned by the host
    String(String),
    /// Handle to a registered host object
    Handle(RawHandle),
    /// Fixed-arity group of values
    Tuple(Vec<Value>),
}

impl Value {
    /// Get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&RawHandle> {
        match self {
            Value::Handle(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, Value::Ignored)
    }

    /// Short kind name used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Ignored => "ignored",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Handle(_) => "handle",
            Value::Tuple(_) => "tuple",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Ignored => write!(f, "nil"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Number(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Handle(h) => write!(f, "{}@{:p}", h.type_name, h.ptr),
            Value::Tuple(values) => {
                write!(f, "(")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<A: Into<Value>, B: Into<Value>> From<(A, B)> for Value {
    fn from((a, b): (A, B)) -> Self {
        Value::Tuple(vec![a.into(), b.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(Value::from(2.5).as_number(), Some(2.5));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert!(Value::Ignored.is_ignored());
        assert_eq!(Value::from(1).as_bool(), None);
    }

    #[test]
    fn test_tuple_display() {
        let pair = Value::from((1.0, "a"));
        assert_eq!(pair.kind(), "tuple");
        assert_eq!(pair.to_string(), "(1, \"a\")");
    }
}
