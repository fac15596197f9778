use super::document::Document;
use super::scalars::{Binary, DateTime, ObjectId, Regex, Timestamp};

/// BSON element type tags.
pub mod tag {
    pub const DOUBLE: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const DOCUMENT: u8 = 0x03;
    pub const ARRAY: u8 = 0x04;
    pub const BINARY: u8 = 0x05;
    pub const OBJECT_ID: u8 = 0x07;
    pub const BOOL: u8 = 0x08;
    pub const DATETIME: u8 = 0x09;
    pub const NULL: u8 = 0x0A;
    pub const REGEX: u8 = 0x0B;
    pub const INT32: u8 = 0x10;
    pub const TIMESTAMP: u8 = 0x11;
    pub const INT64: u8 = 0x12;
}

/// A single value carried inside a [`Document`].
///
/// Equality is bitwise for doubles, so `NaN == NaN` and `0.0 != -0.0`. This is the
/// equality the codec round-trip guarantees.
#[derive(Debug, Clone)]
pub enum Value {
    Double(f64),
    String(String),
    Document(Document),
    Array(Vec<Value>),
    Binary(Binary),
    ObjectId(ObjectId),
    Bool(bool),
    DateTime(DateTime),
    Null,
    Regex(Regex),
    Int32(i32),
    Timestamp(Timestamp),
    Int64(i64),
}

impl Value {
    pub fn tag(&self) -> u8 {
        match self {
            Value::Double(_) => tag::DOUBLE,
            Value::String(_) => tag::STRING,
            Value::Document(_) => tag::DOCUMENT,
            Value::Array(_) => tag::ARRAY,
            Value::Binary(_) => tag::BINARY,
            Value::ObjectId(_) => tag::OBJECT_ID,
            Value::Bool(_) => tag::BOOL,
            Value::DateTime(_) => tag::DATETIME,
            Value::Null => tag::NULL,
            Value::Regex(_) => tag::REGEX,
            Value::Int32(_) => tag::INT32,
            Value::Timestamp(_) => tag::TIMESTAMP,
            Value::Int64(_) => tag::INT64,
        }
    }

    /// Type name as reported by the server in error messages (`$type` aliases).
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Document(_) => "object",
            Value::Array(_) => "array",
            Value::Binary(_) => "binData",
            Value::ObjectId(_) => "objectId",
            Value::Bool(_) => "bool",
            Value::DateTime(_) => "date",
            Value::Null => "null",
            Value::Regex(_) => "regex",
            Value::Int32(_) => "int",
            Value::Timestamp(_) => "timestamp",
            Value::Int64(_) => "long",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Integral view of any numeric variant; doubles only when they hold a whole number.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(n) => Some(*n as i64),
            Value::Int64(n) => Some(*n),
            Value::Double(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(f) => Some(*f),
            Value::Int32(n) => Some(*n as f64),
            Value::Int64(n) => Some(*n as f64),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Document(a), Value::Document(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::ObjectId(a), Value::ObjectId(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Regex(a), Value::Regex(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    f64 => Double,
    String => String,
    Document => Document,
    Binary => Binary,
    ObjectId => ObjectId,
    bool => Bool,
    DateTime => DateTime,
    Regex => Regex,
    i32 => Int32,
    Timestamp => Timestamp,
    i64 => Int64,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::String(v.clone())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
