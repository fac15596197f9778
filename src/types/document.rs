use super::binary::DecodeError;
use super::value::Value;

/// Ordered collection of unique string keys mapped to values.
///
/// Insertion order is preserved through every codec. Lookups are linear.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

/// A typed field lookup failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("required field {0:?} is missing")]
    Missing(String),

    #[error("field {key:?} must be of type {expected}, found {actual}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replaces the value under `key` in place, or appends a new entry.
    ///
    /// # Panics
    ///
    /// If `key` contains NUL, which no BSON key can hold. Use [`Document::try_push`]
    /// for keys that are not known in advance.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        assert!(!key.contains('\0'), "document key {key:?} contains NUL");
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Appends a new entry, refusing keys that already exist or contain NUL.
    pub fn try_push(&mut self, key: String, value: Value) -> Result<(), DecodeError> {
        if key.contains('\0') {
            return Err(DecodeError::NulInKey(key));
        }
        if self.contains_key(&key) {
            return Err(DecodeError::DuplicateKey(key));
        }
        self.entries.push((key, value));
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// The first key names the command in a command document.
    pub fn command_name(&self) -> Option<&str> {
        self.entries.first().map(|(k, _)| k.as_str())
    }

    fn require(&self, key: &str) -> Result<&Value, FieldError> {
        self.get(key)
            .ok_or_else(|| FieldError::Missing(key.to_string()))
    }

    fn wrong_type(key: &str, expected: &'static str, actual: &Value) -> FieldError {
        FieldError::WrongType {
            key: key.to_string(),
            expected,
            actual: actual.type_name(),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<&str, FieldError> {
        let v = self.require(key)?;
        v.as_str().ok_or_else(|| Self::wrong_type(key, "string", v))
    }

    pub fn get_document(&self, key: &str) -> Result<&Document, FieldError> {
        let v = self.require(key)?;
        v.as_document()
            .ok_or_else(|| Self::wrong_type(key, "object", v))
    }

    pub fn get_array(&self, key: &str) -> Result<&[Value], FieldError> {
        let v = self.require(key)?;
        v.as_array().ok_or_else(|| Self::wrong_type(key, "array", v))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, FieldError> {
        match self.require(key)? {
            Value::Bool(b) => Ok(*b),
            v => Err(Self::wrong_type(key, "bool", v)),
        }
    }

    /// Any numeric type holding a whole number.
    pub fn get_i64(&self, key: &str) -> Result<i64, FieldError> {
        let v = self.require(key)?;
        v.as_i64().ok_or_else(|| Self::wrong_type(key, "number", v))
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}
