//! Shard key patterns and extracted shard keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use twox_hash::XxHash64;

use super::value::{Document, Value};
use crate::error::{Error, Result};

/// Seed used for hashed shard key fields. Changing it reshuffles every
/// hashed collection, so it is fixed.
const HASHED_KEY_SEED: u64 = 0;

/// How a shard key field maps document values onto the key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    /// The raw value, ascending.
    Ascending,
    /// A 64-bit hash of the value.
    Hashed,
}

/// One field of a shard key pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    pub kind: KeyKind,
}

/// An ordered shard key pattern, e.g. `{_id: 1}` or `{a: 1, b: 1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    fields: Vec<KeyField>,
}

impl ShardKeyPattern {
    /// Create a pattern. Fails if empty, if a field repeats, or if more than
    /// one field is hashed.
    pub fn new(fields: Vec<KeyField>) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::InvalidArgument(
                "shard key pattern must have at least one field".to_string(),
            ));
        }
        for (i, f) in fields.iter().enumerate() {
            if f.name.is_empty() {
                return Err(Error::InvalidArgument("empty shard key field name".to_string()));
            }
            if fields[..i].iter().any(|g| g.name == f.name) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate shard key field '{}'",
                    f.name
                )));
            }
        }
        if fields.iter().filter(|f| f.kind == KeyKind::Hashed).count() > 1 {
            return Err(Error::InvalidArgument(
                "at most one hashed field is allowed in a shard key".to_string(),
            ));
        }
        Ok(Self { fields })
    }

    /// Ascending pattern over the given fields.
    pub fn ascending(names: &[&str]) -> Result<Self> {
        Self::new(
            names
                .iter()
                .map(|n| KeyField {
                    name: n.to_string(),
                    kind: KeyKind::Ascending,
                })
                .collect(),
        )
    }

    /// Single hashed field pattern, e.g. `{a: "hashed"}`.
    pub fn hashed(name: &str) -> Result<Self> {
        Self::new(vec![KeyField {
            name: name.to_string(),
            kind: KeyKind::Hashed,
        }])
    }

    /// The pattern fields in order.
    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Patterns are never empty; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether any field is hashed.
    pub fn is_hashed(&self) -> bool {
        self.fields.iter().any(|f| f.kind == KeyKind::Hashed)
    }

    /// Smallest key: every field `MinKey`.
    pub fn global_min(&self) -> ShardKey {
        ShardKey(vec![Value::MinKey; self.fields.len()])
    }

    /// Largest key: every field `MaxKey`.
    pub fn global_max(&self) -> ShardKey {
        ShardKey(vec![Value::MaxKey; self.fields.len()])
    }

    /// Extract the shard key of a stored document. Missing fields map to `Null`.
    pub fn extract_key(&self, doc: &Document) -> ShardKey {
        ShardKey(
            self.fields
                .iter()
                .map(|f| {
                    let raw = doc.get(&f.name).cloned().unwrap_or(Value::Null);
                    match f.kind {
                        KeyKind::Ascending => raw,
                        KeyKind::Hashed => Value::Int(hash_value(&raw)),
                    }
                })
                .collect(),
        )
    }

    /// Interpret a key-space document (e.g. `startingFromKey`) as a shard key.
    ///
    /// The document must have exactly the pattern's field count and names.
    /// Values are taken as already in key space (hashed fields are not re-hashed).
    pub fn parse_key(&self, key_doc: &Document) -> Result<ShardKey> {
        if key_doc.len() != self.fields.len() {
            return Err(Error::InvalidArgument(format!(
                "could not determine shard key from {}: expected {} field(s) matching {}",
                key_doc,
                self.fields.len(),
                self
            )));
        }
        let mut values = Vec::with_capacity(self.fields.len());
        for f in &self.fields {
            let v = key_doc.get(&f.name).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "could not determine shard key from {}: missing field '{}' of {}",
                    key_doc, f.name, self
                ))
            })?;
            values.push(v.clone());
        }
        Ok(ShardKey(values))
    }

    /// Render a shard key as a key-space document.
    pub fn key_to_document(&self, key: &ShardKey) -> Document {
        let mut doc = Document::new();
        for (f, v) in self.fields.iter().zip(key.values()) {
            doc.insert(f.name.clone(), v.clone());
        }
        doc
    }
}

impl fmt::Display for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match field.kind {
                KeyKind::Ascending => write!(f, " {}: 1", field.name)?,
                KeyKind::Hashed => write!(f, " {}: \"hashed\"", field.name)?,
            }
        }
        write!(f, " }}")
    }
}

/// 64-bit hash of a value for hashed shard keys. Integral doubles hash like
/// the equal integer.
pub fn hash_value(value: &Value) -> i64 {
    let mut hasher = XxHash64::with_seed(HASHED_KEY_SEED);
    match value {
        Value::MinKey => hasher.write_u8(0),
        Value::Null => hasher.write_u8(1),
        Value::Int(_) | Value::Double(_) => match value.as_i64() {
            Some(i) => {
                hasher.write_u8(2);
                hasher.write_i64(i);
            }
            None => {
                hasher.write_u8(3);
                hasher.write_u64(value.as_f64().unwrap_or_default().to_bits());
            }
        },
        Value::String(s) => {
            hasher.write_u8(4);
            hasher.write(s.as_bytes());
        }
        Value::Bool(b) => {
            hasher.write_u8(5);
            hasher.write_u8(*b as u8);
        }
        Value::MaxKey => hasher.write_u8(6),
    }
    hasher.finish() as i64
}

/// An extracted shard key: an ordered tuple compared lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardKey(Vec<Value>);

impl ShardKey {
    /// Build a key from values.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Single-field key.
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// Key values in pattern order.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}", v)?;
        }
        write!(f, " }}")
    }
}
