//! BSON binary encoding.
//!
//! Every decode failure is a [`DecodeError`]; callers treat all of them as malformed
//! input. Encoding is total.

use bytes::{Buf, BufMut};

use super::document::Document;
use super::json::JsonError;
use super::scalars::{Binary, DateTime, ObjectId, Regex, Timestamp};
use super::value::{Value, tag};

/// Maximum nesting of documents and arrays accepted by the decoder.
pub const MAX_DEPTH: usize = 150;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of input: need {needed} bytes, {available} available")]
    UnexpectedEnd { needed: usize, available: usize },

    #[error("unknown type tag {tag:#04x} for key {key:?}")]
    UnknownTag { tag: u8, key: String },

    #[error("invalid length field {0}")]
    InvalidLength(i64),

    #[error("missing NUL terminator")]
    MissingTerminator,

    #[error("invalid UTF-8 in string or key")]
    InvalidUtf8,

    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    #[error("duplicate key {0:?}")]
    DuplicateKey(String),

    #[error("key {0:?} contains NUL")]
    NulInKey(String),

    #[error("array element {expected} has key {found:?}")]
    ArrayKey { expected: usize, found: String },

    #[error("{0} trailing bytes after document")]
    TrailingBytes(usize),

    #[error("nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

/// A fixed-shape BSON value: one type tag, one binary layout, one JSON projection.
pub trait Scalar: Sized {
    const TAG: u8;
    /// Name used in JSON error messages.
    const NAME: &'static str;

    fn read_from(buf: &mut &[u8]) -> Result<Self, DecodeError>;
    fn write_to(&self, out: &mut Vec<u8>);
    fn binary_size(&self) -> usize;
    fn to_json(&self) -> serde_json::Value;
    fn from_json(json: &serde_json::Value) -> Result<Self, JsonError>;
}

pub(crate) fn ensure(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::UnexpectedEnd {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

pub(crate) fn read_i32(buf: &mut &[u8]) -> Result<i32, DecodeError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub(crate) fn read_cstring(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or(DecodeError::MissingTerminator)?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| DecodeError::InvalidUtf8)?
        .to_string();
    buf.advance(end + 1);
    Ok(s)
}

pub(crate) fn write_cstring(out: &mut Vec<u8>, s: &str) {
    debug_assert!(!s.contains('\0'), "cstring with interior NUL");
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

/// Walks the elements of one embedded document, returning its declared length.
fn decode_elements(
    buf: &[u8],
    depth: usize,
    mut push: impl FnMut(String, Value) -> Result<(), DecodeError>,
) -> Result<usize, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::TooDeep);
    }
    let mut head = buf;
    let len = read_i32(&mut head)?;
    if len < 5 {
        return Err(DecodeError::InvalidLength(len as i64));
    }
    let len = len as usize;
    ensure(buf, len)?;

    let mut body = &buf[4..len];
    loop {
        if body.is_empty() {
            return Err(DecodeError::MissingTerminator);
        }
        let t = body.get_u8();
        if t == 0 {
            if !body.is_empty() {
                return Err(DecodeError::InvalidLength(len as i64));
            }
            break;
        }
        let key = read_cstring(&mut body)?;
        let value = read_value(t, &key, &mut body, depth)?;
        push(key, value)?;
    }
    Ok(len)
}

fn decode_document(buf: &[u8], depth: usize) -> Result<(Document, usize), DecodeError> {
    let mut doc = Document::new();
    let len = decode_elements(buf, depth, |k, v| doc.try_push(k, v))?;
    Ok((doc, len))
}

fn decode_array(buf: &[u8], depth: usize) -> Result<(Vec<Value>, usize), DecodeError> {
    let mut items = Vec::new();
    let len = decode_elements(buf, depth, |k, v| {
        if k != items.len().to_string() {
            return Err(DecodeError::ArrayKey {
                expected: items.len(),
                found: k,
            });
        }
        items.push(v);
        Ok(())
    })?;
    Ok((items, len))
}

fn read_value(t: u8, key: &str, buf: &mut &[u8], depth: usize) -> Result<Value, DecodeError> {
    let value = match t {
        tag::DOUBLE => Value::Double(f64::read_from(buf)?),
        tag::STRING => Value::String(String::read_from(buf)?),
        tag::DOCUMENT => {
            let (doc, n) = decode_document(buf, depth + 1)?;
            buf.advance(n);
            Value::Document(doc)
        }
        tag::ARRAY => {
            let (items, n) = decode_array(buf, depth + 1)?;
            buf.advance(n);
            Value::Array(items)
        }
        tag::BINARY => Value::Binary(Binary::read_from(buf)?),
        tag::OBJECT_ID => Value::ObjectId(ObjectId::read_from(buf)?),
        tag::BOOL => Value::Bool(bool::read_from(buf)?),
        tag::DATETIME => Value::DateTime(DateTime::read_from(buf)?),
        tag::NULL => Value::Null,
        tag::REGEX => Value::Regex(Regex::read_from(buf)?),
        tag::INT32 => Value::Int32(i32::read_from(buf)?),
        tag::TIMESTAMP => Value::Timestamp(Timestamp::read_from(buf)?),
        tag::INT64 => Value::Int64(i64::read_from(buf)?),
        other => {
            return Err(DecodeError::UnknownTag {
                tag: other,
                key: key.to_string(),
            });
        }
    };
    Ok(value)
}

fn write_elements<'a>(out: &mut Vec<u8>, elements: impl Iterator<Item = (&'a str, &'a Value)>) {
    let start = out.len();
    out.put_i32_le(0);
    for (key, value) in elements {
        out.put_u8(value.tag());
        write_cstring(out, key);
        value.write_to(out);
    }
    out.put_u8(0);
    let len = (out.len() - start) as i32;
    out[start..start + 4].copy_from_slice(&len.to_le_bytes());
}

fn array_size(items: &[Value]) -> usize {
    let elements: usize = items
        .iter()
        .enumerate()
        .map(|(i, v)| 1 + decimal_len(i) + 1 + v.binary_size())
        .sum();
    4 + elements + 1
}

fn decimal_len(mut n: usize) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

impl Value {
    /// Decodes the payload of an element with type tag `t`, returning the value and
    /// the number of bytes consumed.
    pub fn decode(t: u8, bytes: &[u8]) -> Result<(Value, usize), DecodeError> {
        let mut buf = bytes;
        let value = read_value(t, "", &mut buf, 0)?;
        Ok((value, bytes.len() - buf.len()))
    }

    /// Appends the element payload (without tag and key).
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Value::Double(v) => v.write_to(out),
            Value::String(v) => v.write_to(out),
            Value::Document(d) => d.write_to(out),
            Value::Array(items) => write_array(out, items),
            Value::Binary(v) => v.write_to(out),
            Value::ObjectId(v) => v.write_to(out),
            Value::Bool(v) => v.write_to(out),
            Value::DateTime(v) => v.write_to(out),
            Value::Null => {}
            Value::Regex(v) => v.write_to(out),
            Value::Int32(v) => v.write_to(out),
            Value::Timestamp(v) => v.write_to(out),
            Value::Int64(v) => v.write_to(out),
        }
    }

    /// Size of the element payload in bytes.
    pub fn binary_size(&self) -> usize {
        match self {
            Value::Double(v) => v.binary_size(),
            Value::String(v) => v.binary_size(),
            Value::Document(d) => d.binary_size(),
            Value::Array(items) => array_size(items),
            Value::Binary(v) => v.binary_size(),
            Value::ObjectId(v) => v.binary_size(),
            Value::Bool(v) => v.binary_size(),
            Value::DateTime(v) => v.binary_size(),
            Value::Null => 0,
            Value::Regex(v) => v.binary_size(),
            Value::Int32(v) => v.binary_size(),
            Value::Timestamp(v) => v.binary_size(),
            Value::Int64(v) => v.binary_size(),
        }
    }
}

fn write_array(out: &mut Vec<u8>, items: &[Value]) {
    let keys: Vec<String> = (0..items.len()).map(|i| i.to_string()).collect();
    write_elements(out, keys.iter().map(String::as_str).zip(items.iter()));
}

impl Document {
    /// Decodes one document from the front of `bytes`, returning it with the number
    /// of bytes consumed. Trailing bytes are left to the caller.
    pub fn decode(bytes: &[u8]) -> Result<(Document, usize), DecodeError> {
        decode_document(bytes, 0)
    }

    /// Decodes a document that must span all of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<Document, DecodeError> {
        let (doc, n) = Self::decode(bytes)?;
        if n != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - n));
        }
        Ok(doc)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        write_elements(out, self.iter());
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.binary_size());
        self.write_to(&mut out);
        out
    }

    pub fn binary_size(&self) -> usize {
        let elements: usize = self
            .iter()
            .map(|(k, v)| 1 + k.len() + 1 + v.binary_size())
            .sum();
        4 + elements + 1
    }
}
