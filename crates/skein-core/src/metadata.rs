//! Call metadata: an ordered multimap of header values.
//!
//! Keys are lowercase ASCII. Keys ending in `-bin` carry opaque byte values;
//! every other key carries a UTF-8 string. Reserved keys (`grpc-*`, `:*`,
//! `content-type`, `user-agent`, `te`) belong to the transport and are
//! rejected here.
//!
//! Iteration yields entries in insertion order, one key with all of its
//! values at a time. Multi-valued text keys are never comma-joined by this
//! layer; if the wire wants joining, that is the transport's concern.

use bytes::Bytes;
use thiserror::Error;

/// A single metadata value: UTF-8 text for ordinary keys, raw bytes for
/// `-bin` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b,
        }
    }

    fn is_binary(&self) -> bool {
        matches!(self, MetadataValue::Binary(_))
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Ascii(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Ascii(s)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(b: Bytes) -> Self {
        MetadataValue::Binary(b)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(b: Vec<u8>) -> Self {
        MetadataValue::Binary(Bytes::from(b))
    }
}

impl From<&[u8]> for MetadataValue {
    fn from(b: &[u8]) -> Self {
        MetadataValue::Binary(Bytes::copy_from_slice(b))
    }
}

/// Errors from metadata mutation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    /// Key contains characters outside lowercase ASCII header charset.
    #[error("invalid metadata key: {key:?}")]
    InvalidKey { key: String },

    /// Key is reserved for the transport.
    #[error("reserved metadata key: {key:?}")]
    ReservedKey { key: String },

    /// Text value on a `-bin` key, or binary value on a text key.
    #[error("value kind does not match key {key:?}")]
    ValueKind { key: String },

    /// `set_all` with an empty value list.
    #[error("empty value list for key {key:?}")]
    EmptyValues { key: String },
}

/// Ordered multimap of call metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Vec<MetadataValue>)>,
}

fn is_binary_key(key: &str) -> bool {
    key.ends_with("-bin")
}

fn validate_key(key: &str) -> Result<(), MetadataError> {
    let valid = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'));
    if !valid {
        return Err(MetadataError::InvalidKey {
            key: key.to_string(),
        });
    }
    let reserved = key.starts_with("grpc-")
        || key.starts_with(':')
        || matches!(key, "content-type" | "user-agent" | "te");
    if reserved {
        return Err(MetadataError::ReservedKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

fn validate_value(key: &str, value: &MetadataValue) -> Result<(), MetadataError> {
    if is_binary_key(key) != value.is_binary() {
        return Err(MetadataError::ValueKind {
            key: key.to_string(),
        });
    }
    Ok(())
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(key: &str) -> String {
        key.to_ascii_lowercase()
    }

    fn entry_mut(&mut self, key: &str) -> Option<&mut Vec<MetadataValue>> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Replace all values of `key` with a single value.
    pub fn set(
        &mut self,
        key: &str,
        value: impl Into<MetadataValue>,
    ) -> Result<(), MetadataError> {
        self.set_all(key, vec![value.into()])
    }

    /// Replace all values of `key`. The list must be non-empty.
    pub fn set_all(
        &mut self,
        key: &str,
        values: Vec<MetadataValue>,
    ) -> Result<(), MetadataError> {
        let key = Self::normalize(key);
        validate_key(&key)?;
        if values.is_empty() {
            return Err(MetadataError::EmptyValues { key });
        }
        for value in &values {
            validate_value(&key, value)?;
        }
        match self.entry_mut(&key) {
            Some(slot) => *slot = values,
            None => self.entries.push((key, values)),
        }
        Ok(())
    }

    /// Append one value to `key`, creating the entry if absent.
    pub fn append(
        &mut self,
        key: &str,
        value: impl Into<MetadataValue>,
    ) -> Result<(), MetadataError> {
        let key = Self::normalize(key);
        validate_key(&key)?;
        let value = value.into();
        validate_value(&key, &value)?;
        match self.entry_mut(&key) {
            Some(slot) => slot.push(value),
            None => self.entries.push((key, vec![value])),
        }
        Ok(())
    }

    /// First value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.get_all(key).first()
    }

    /// First value of `key` as text, if present and textual.
    pub fn get_text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_str)
    }

    /// All values of `key`, in insertion order. Empty slice if absent.
    pub fn get_all(&self, key: &str) -> &[MetadataValue] {
        let key = Self::normalize(key);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn has(&self, key: &str) -> bool {
        !self.get_all(key).is_empty()
    }

    /// Remove `key` entirely. Returns whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let key = Self::normalize(key);
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.len() != before
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[MetadataValue])> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append every entry of `other` onto this map, keeping both value
    /// lists where keys collide.
    pub fn merge(&mut self, other: Metadata) {
        for (key, values) in other.entries {
            match self.entry_mut(&key) {
                Some(slot) => slot.extend(values),
                None => self.entries.push((key, values)),
            }
        }
    }
}
