use crate::heap::HeapId;
use std::fmt::{self, Display, Formatter};

/// The tagged union held by every stack slot and heap field.
///
/// Values are copied by assignment. The reference variants copy the heap
/// identifier only, so two values can alias the same list or object;
/// that aliasing is intentional and observable through mutation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    StringRef(HeapId),
    ListRef(HeapId),
    ObjectRef(HeapId),
    #[default]
    Null,
}

impl Value {
    /// The kind string the `type` syscall reports; instances report
    /// their type name instead, which needs the type table.
    pub fn kind_name(self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::StringRef(_) => "string",
            Value::ListRef(_) => "list",
            Value::ObjectRef(_) => "object",
            Value::Null => "null",
        }
    }

    pub fn heap_id(&self) -> Option<HeapId> {
        match self {
            Value::StringRef(id) | Value::ListRef(id) | Value::ObjectRef(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
            _ => f64::NAN,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::StringRef(id) => write!(f, "string@{}", id),
            Value::ListRef(id) => write!(f, "list@{}", id),
            Value::ObjectRef(id) => write!(f, "object@{}", id),
            Value::Null => write!(f, "null"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}
