//! Scalar types and their per-type binary and JSON projections.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, BufMut};
use serde_json::{Value as JsonValue, json};

use super::binary::{DecodeError, Scalar, ensure, read_cstring, read_i32, write_cstring};
use super::json::{JsonError, expect_wrapper, json_type_name};
use super::value::tag;

impl Scalar for f64 {
    const TAG: u8 = tag::DOUBLE;
    const NAME: &'static str = "double";

    fn read_from(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        ensure(buf, 8)?;
        Ok(buf.get_f64_le())
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.put_f64_le(*self);
    }

    fn binary_size(&self) -> usize {
        8
    }

    fn to_json(&self) -> JsonValue {
        // jsonb has no negative zero and no non-finite numbers
        let inner = if self.is_nan() {
            nan_to_json(*self)
        } else if self.is_infinite() {
            json!(if *self > 0.0 { "Infinity" } else { "-Infinity" })
        } else if *self == 0.0 && self.is_sign_negative() {
            json!("-0")
        } else {
            match serde_json::Number::from_f64(*self) {
                Some(n) => JsonValue::Number(n),
                None => nan_to_json(*self),
            }
        };
        json!({ "$f": inner })
    }

    fn from_json(json: &JsonValue) -> Result<Self, JsonError> {
        let map = expect_wrapper(json, Self::NAME, &["$f"])?;
        match &map["$f"] {
            JsonValue::Number(n) => n
                .as_f64()
                .ok_or_else(|| JsonError::InvalidValue(n.to_string())),
            JsonValue::String(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                "-0" => Ok(-0.0),
                other => nan_from_json(other),
            },
            other => Err(JsonError::TypeMismatch {
                expected: "number",
                found: json_type_name(other),
            }),
        }
    }
}

const CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

/// Canonical quiet NaN is `"NaN"`; any other payload or sign keeps its bits as
/// `"NaN:<16 hex digits>"`.
fn nan_to_json(v: f64) -> JsonValue {
    match v.to_bits() {
        CANONICAL_NAN => json!("NaN"),
        bits => json!(format!("NaN:{bits:016x}")),
    }
}

fn nan_from_json(s: &str) -> Result<f64, JsonError> {
    let invalid = || JsonError::InvalidValue(s.to_string());
    let digits = s.strip_prefix("NaN:").ok_or_else(invalid)?;
    if digits.len() != 16 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let bits = u64::from_str_radix(digits, 16).map_err(|_| invalid())?;
    let v = f64::from_bits(bits);
    if !v.is_nan() {
        return Err(invalid());
    }
    Ok(v)
}

impl Scalar for String {
    const TAG: u8 = tag::STRING;
    const NAME: &'static str = "string";

    fn read_from(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = read_i32(buf)?;
        if len < 1 {
            return Err(DecodeError::InvalidLength(len as i64));
        }
        let len = len as usize;
        ensure(buf, len)?;
        if buf[len - 1] != 0 {
            return Err(DecodeError::MissingTerminator);
        }
        let s = std::str::from_utf8(&buf[..len - 1])
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_string();
        buf.advance(len);
        Ok(s)
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.put_i32_le(self.len() as i32 + 1);
        out.put_slice(self.as_bytes());
        out.put_u8(0);
    }

    fn binary_size(&self) -> usize {
        4 + self.len() + 1
    }

    fn to_json(&self) -> JsonValue {
        JsonValue::String(self.clone())
    }

    fn from_json(json: &JsonValue) -> Result<Self, JsonError> {
        match json {
            JsonValue::String(s) => Ok(s.clone()),
            JsonValue::Null => Err(JsonError::UnexpectedNull(Self::NAME)),
            other => Err(JsonError::TypeMismatch {
                expected: Self::NAME,
                found: json_type_name(other),
            }),
        }
    }
}

impl Scalar for bool {
    const TAG: u8 = tag::BOOL;
    const NAME: &'static str = "bool";

    fn read_from(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        ensure(buf, 1)?;
        match buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(DecodeError::InvalidBool(b)),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.put_u8(*self as u8);
    }

    fn binary_size(&self) -> usize {
        1
    }

    fn to_json(&self) -> JsonValue {
        JsonValue::Bool(*self)
    }

    fn from_json(json: &JsonValue) -> Result<Self, JsonError> {
        match json {
            JsonValue::Bool(b) => Ok(*b),
            JsonValue::Null => Err(JsonError::UnexpectedNull(Self::NAME)),
            other => Err(JsonError::TypeMismatch {
                expected: Self::NAME,
                found: json_type_name(other),
            }),
        }
    }
}

impl Scalar for i32 {
    const TAG: u8 = tag::INT32;
    const NAME: &'static str = "int32";

    fn read_from(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        read_i32(buf)
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.put_i32_le(*self);
    }

    fn binary_size(&self) -> usize {
        4
    }

    fn to_json(&self) -> JsonValue {
        json!(*self)
    }

    fn from_json(json: &JsonValue) -> Result<Self, JsonError> {
        match json {
            JsonValue::Number(n) if n.is_f64() => Err(JsonError::TypeMismatch {
                expected: "integer",
                found: "float",
            }),
            JsonValue::Number(n) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| JsonError::InvalidValue(n.to_string())),
            JsonValue::Null => Err(JsonError::UnexpectedNull(Self::NAME)),
            other => Err(JsonError::TypeMismatch {
                expected: "integer",
                found: json_type_name(other),
            }),
        }
    }
}

impl Scalar for i64 {
    const TAG: u8 = tag::INT64;
    const NAME: &'static str = "int64";

    fn read_from(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        ensure(buf, 8)?;
        Ok(buf.get_i64_le())
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.put_i64_le(*self);
    }

    fn binary_size(&self) -> usize {
        8
    }

    fn to_json(&self) -> JsonValue {
        json!({ "$l": self.to_string() })
    }

    fn from_json(json: &JsonValue) -> Result<Self, JsonError> {
        let map = expect_wrapper(json, Self::NAME, &["$l"])?;
        match &map["$l"] {
            JsonValue::String(s) => s
                .parse::<i64>()
                .map_err(|_| JsonError::InvalidValue(s.clone())),
            other => Err(JsonError::TypeMismatch {
                expected: "string",
                found: json_type_name(other),
            }),
        }
    }
}

/// 12-byte document identifier: 4-byte big-endian seconds, 5 random bytes fixed per
/// process, 3-byte big-endian counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        static PROCESS_UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();
        static COUNTER: OnceLock<AtomicU32> = OnceLock::new();

        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let unique = PROCESS_UNIQUE.get_or_init(rand::random::<[u8; 5]>);
        let count = COUNTER
            .get_or_init(|| AtomicU32::new(rand::random::<u32>() & 0x00ff_ffff))
            .fetch_add(1, Ordering::Relaxed);

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(unique);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 12] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Scalar for ObjectId {
    const TAG: u8 = tag::OBJECT_ID;
    const NAME: &'static str = "objectId";

    fn read_from(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        ensure(buf, 12)?;
        let mut bytes = [0u8; 12];
        buf.copy_to_slice(&mut bytes);
        Ok(Self(bytes))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.put_slice(&self.0);
    }

    fn binary_size(&self) -> usize {
        12
    }

    fn to_json(&self) -> JsonValue {
        json!({ "$o": self.to_hex() })
    }

    fn from_json(json: &JsonValue) -> Result<Self, JsonError> {
        let map = expect_wrapper(json, Self::NAME, &["$o"])?;
        match &map["$o"] {
            JsonValue::String(s) => s
                .parse::<ObjectId>()
                .map_err(|_| JsonError::InvalidValue(s.clone())),
            other => Err(JsonError::TypeMismatch {
                expected: "string",
                found: json_type_name(other),
            }),
        }
    }
}

/// Binary blob with its BSON subtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub subtype: u8,
    pub bytes: Vec<u8>,
}

impl Scalar for Binary {
    const TAG: u8 = tag::BINARY;
    const NAME: &'static str = "binData";

    fn read_from(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = read_i32(buf)?;
        if len < 0 {
            return Err(DecodeError::InvalidLength(len as i64));
        }
        let len = len as usize;
        ensure(buf, len + 1)?;
        let subtype = buf.get_u8();
        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(Self { subtype, bytes })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.put_i32_le(self.bytes.len() as i32);
        out.put_u8(self.subtype);
        out.put_slice(&self.bytes);
    }

    fn binary_size(&self) -> usize {
        4 + 1 + self.bytes.len()
    }

    fn to_json(&self) -> JsonValue {
        json!({ "$b": BASE64.encode(&self.bytes), "s": self.subtype })
    }

    fn from_json(json: &JsonValue) -> Result<Self, JsonError> {
        let map = expect_wrapper(json, Self::NAME, &["$b", "s"])?;
        let bytes = match &map["$b"] {
            JsonValue::String(s) => BASE64
                .decode(s)
                .map_err(|_| JsonError::InvalidValue(s.clone()))?,
            other => {
                return Err(JsonError::TypeMismatch {
                    expected: "string",
                    found: json_type_name(other),
                });
            }
        };
        let subtype = match &map["s"] {
            JsonValue::Number(n) => n
                .as_u64()
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| JsonError::InvalidValue(n.to_string()))?,
            other => {
                return Err(JsonError::TypeMismatch {
                    expected: "integer",
                    found: json_type_name(other),
                });
            }
        };
        Ok(Self { subtype, bytes })
    }
}

/// UTC datetime as milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime(i64);

impl DateTime {
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(ms)
    }

    pub const fn timestamp_millis(&self) -> i64 {
        self.0
    }
}

impl Scalar for DateTime {
    const TAG: u8 = tag::DATETIME;
    const NAME: &'static str = "date";

    fn read_from(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        i64::read_from(buf).map(Self)
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.put_i64_le(self.0);
    }

    fn binary_size(&self) -> usize {
        8
    }

    fn to_json(&self) -> JsonValue {
        json!({ "$d": self.0 })
    }

    fn from_json(json: &JsonValue) -> Result<Self, JsonError> {
        let map = expect_wrapper(json, Self::NAME, &["$d"])?;
        match &map["$d"] {
            JsonValue::Number(n) if n.is_f64() => Err(JsonError::TypeMismatch {
                expected: "integer",
                found: "float",
            }),
            JsonValue::Number(n) => n
                .as_i64()
                .map(Self)
                .ok_or_else(|| JsonError::InvalidValue(n.to_string())),
            other => Err(JsonError::TypeMismatch {
                expected: "integer",
                found: json_type_name(other),
            }),
        }
    }
}

/// Replication timestamp: seconds in the high 32 bits, ordinal in the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub time: u32,
    pub increment: u32,
}

impl Timestamp {
    pub const fn from_u64(v: u64) -> Self {
        Self {
            time: (v >> 32) as u32,
            increment: v as u32,
        }
    }

    pub const fn to_u64(&self) -> u64 {
        ((self.time as u64) << 32) | self.increment as u64
    }
}

impl Scalar for Timestamp {
    const TAG: u8 = tag::TIMESTAMP;
    const NAME: &'static str = "timestamp";

    fn read_from(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        ensure(buf, 8)?;
        Ok(Self::from_u64(buf.get_u64_le()))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.put_u64_le(self.to_u64());
    }

    fn binary_size(&self) -> usize {
        8
    }

    fn to_json(&self) -> JsonValue {
        json!({ "$t": self.to_u64().to_string() })
    }

    fn from_json(json: &JsonValue) -> Result<Self, JsonError> {
        let map = expect_wrapper(json, Self::NAME, &["$t"])?;
        match &map["$t"] {
            JsonValue::String(s) => s
                .parse::<u64>()
                .map(Self::from_u64)
                .map_err(|_| JsonError::InvalidValue(s.clone())),
            other => Err(JsonError::TypeMismatch {
                expected: "string",
                found: json_type_name(other),
            }),
        }
    }
}

/// Regular expression literal. Neither part may contain NUL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Regex {
    pattern: String,
    options: String,
}

impl Regex {
    pub fn new(pattern: impl Into<String>, options: impl Into<String>) -> Option<Self> {
        let pattern = pattern.into();
        let options = options.into();
        if pattern.contains('\0') || options.contains('\0') {
            return None;
        }
        Some(Self { pattern, options })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn options(&self) -> &str {
        &self.options
    }
}

impl Scalar for Regex {
    const TAG: u8 = tag::REGEX;
    const NAME: &'static str = "regex";

    fn read_from(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let pattern = read_cstring(buf)?;
        let options = read_cstring(buf)?;
        Ok(Self { pattern, options })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        write_cstring(out, &self.pattern);
        write_cstring(out, &self.options);
    }

    fn binary_size(&self) -> usize {
        self.pattern.len() + 1 + self.options.len() + 1
    }

    fn to_json(&self) -> JsonValue {
        json!({ "$r": self.pattern, "o": self.options })
    }

    fn from_json(json: &JsonValue) -> Result<Self, JsonError> {
        let map = expect_wrapper(json, Self::NAME, &["$r", "o"])?;
        let pattern = String::from_json(&map["$r"])?;
        let options = String::from_json(&map["o"])?;
        Regex::new(pattern.clone(), options).ok_or(JsonError::InvalidValue(pattern))
    }
}
