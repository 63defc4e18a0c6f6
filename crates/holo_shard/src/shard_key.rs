//! Shard key patterns.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Result, ShardingError};
use crate::key::{hash_key_value, lookup_path, KeyValue, ShardKey};

/// Seed used for hashed shard keys and the indexes that back them.
pub const DEFAULT_HASH_SEED: i32 = 0;

/// How a field participates in a key pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDirection {
    Ascending,
    Descending,
    Hashed,
    /// Index types that can never back a shard key (`"text"`, `"2d"`, ...).
    Special(String),
}

impl KeyDirection {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_f64() {
                Some(v) if v > 0.0 => Some(KeyDirection::Ascending),
                Some(v) if v < 0.0 => Some(KeyDirection::Descending),
                _ => None,
            },
            Value::String(s) if s == "hashed" => Some(KeyDirection::Hashed),
            Value::String(s) => Some(KeyDirection::Special(s.clone())),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            KeyDirection::Ascending => Value::from(1),
            KeyDirection::Descending => Value::from(-1),
            KeyDirection::Hashed => Value::from("hashed"),
            KeyDirection::Special(kind) => Value::from(kind.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyField {
    pub name: String,
    pub direction: KeyDirection,
}

impl KeyField {
    pub fn new(name: impl Into<String>, direction: KeyDirection) -> Self {
        Self {
            name: name.into(),
            direction,
        }
    }
}

/// Parses an ordered key document such as `{"a": 1, "b": -1}`.
pub fn parse_key_fields(doc: &Value) -> Option<Vec<KeyField>> {
    let obj = doc.as_object()?;
    obj.iter()
        .map(|(name, value)| Some(KeyField::new(name.clone(), KeyDirection::from_json(value)?)))
        .collect()
}

pub fn key_fields_to_document(fields: &[KeyField]) -> Value {
    let mut map = Map::new();
    for field in fields {
        map.insert(field.name.clone(), field.direction.to_json());
    }
    Value::Object(map)
}

/// Ordered list of fields that determines chunk placement for a collection.
///
/// Construction enforces the shape rules: at least one field, unique field
/// names, and either a single hashed field or only ascending fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardKeyPattern {
    fields: Vec<KeyField>,
}

impl ShardKeyPattern {
    pub fn new(fields: Vec<KeyField>) -> Result<Self> {
        if fields.is_empty() {
            return Err(ShardingError::InvalidShardKey(
                "shard key pattern must not be empty".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for field in &fields {
            if field.name.is_empty() || field.name.starts_with('$') {
                return Err(ShardingError::InvalidShardKey(format!(
                    "invalid field name '{}'",
                    field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(ShardingError::InvalidShardKey(format!(
                    "duplicate field '{}'",
                    field.name
                )));
            }
        }
        let hashed = fields
            .iter()
            .filter(|f| f.direction == KeyDirection::Hashed)
            .count();
        let ascending = fields
            .iter()
            .all(|f| f.direction == KeyDirection::Ascending);
        if hashed > 1 || (hashed == 1 && fields.len() != 1) || (hashed == 0 && !ascending) {
            return Err(ShardingError::InvalidShardKey(format!(
                "{}: pattern must either be a single hashed field, or a list of ascending fields",
                key_fields_to_document(&fields)
            )));
        }
        Ok(Self { fields })
    }

    pub fn from_document(doc: &Value) -> Result<Self> {
        let fields = parse_key_fields(doc)
            .ok_or_else(|| ShardingError::InvalidShardKey(format!("{doc} is not a key pattern")))?;
        Self::new(fields)
    }

    pub fn to_document(&self) -> Value {
        key_fields_to_document(&self.fields)
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_hashed(&self) -> bool {
        self.fields
            .iter()
            .any(|f| f.direction == KeyDirection::Hashed)
    }

    pub fn global_min(&self) -> ShardKey {
        ShardKey::new(vec![KeyValue::MinKey; self.fields.len()])
    }

    pub fn global_max(&self) -> ShardKey {
        ShardKey::new(vec![KeyValue::MaxKey; self.fields.len()])
    }

    /// Extracts the shard key of a stored document or point query.
    ///
    /// Hashed fields are hashed with the default seed. Returns `None` when a
    /// field is missing or holds an array or operator object.
    pub fn extract_key(&self, doc: &Value) -> Option<ShardKey> {
        self.fields
            .iter()
            .map(|field| {
                let value = KeyValue::from_json(lookup_path(doc, &field.name)?)?;
                Some(self.encode(field, value))
            })
            .collect::<Option<Vec<_>>>()
            .map(ShardKey::new)
    }

    /// Like [`extract_key`](Self::extract_key) but treats missing fields as
    /// null, which is where storage places such documents.
    pub fn extract_key_or_null(&self, doc: &Value) -> ShardKey {
        ShardKey::new(
            self.fields
                .iter()
                .map(|field| {
                    let value = lookup_path(doc, &field.name)
                        .and_then(KeyValue::from_json)
                        .unwrap_or(KeyValue::Null);
                    self.encode(field, value)
                })
                .collect(),
        )
    }

    fn encode(&self, field: &KeyField, value: KeyValue) -> KeyValue {
        match field.direction {
            KeyDirection::Hashed => KeyValue::Int(hash_key_value(&value, DEFAULT_HASH_SEED)),
            _ => value,
        }
    }

    /// Reads a chunk bound or split point given as a document with exactly
    /// the pattern's fields. Values are taken as-is, so hashed patterns
    /// expect hash values here.
    pub fn parse_key_document(&self, doc: &Value) -> Result<ShardKey> {
        let obj = doc
            .as_object()
            .ok_or_else(|| ShardingError::BadRequest(format!("{doc} is not a document")))?;
        if obj.len() != self.fields.len() {
            return Err(ShardingError::BadRequest(format!(
                "{doc} is not a shard key for pattern {}",
                self.to_document()
            )));
        }
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = obj
                .get(&field.name)
                .and_then(KeyValue::from_json)
                .ok_or_else(|| {
                    ShardingError::BadRequest(format!(
                        "{doc} is not a shard key for pattern {}",
                        self.to_document()
                    ))
                })?;
            values.push(value);
        }
        Ok(ShardKey::new(values))
    }

    /// Renders a key as a document keyed by pattern field names.
    pub fn key_document(&self, key: &ShardKey) -> Value {
        let mut map = Map::new();
        for (field, value) in self.fields.iter().zip(key.values()) {
            map.insert(field.name.clone(), value.to_json());
        }
        Value::Object(map)
    }

    /// True when this pattern's fields, with their directions, lead `index_key`.
    pub fn is_prefix_of(&self, index_key: &[KeyField]) -> bool {
        self.fields.len() <= index_key.len()
            && self.fields.iter().zip(index_key).all(|(a, b)| a == b)
    }

    /// A unique index can coexist with this shard key when it is the `_id`
    /// index family or when the shard key field names lead it.
    pub fn is_unique_index_compatible(&self, index_key: &[KeyField]) -> bool {
        if index_key.first().map(|f| f.name.as_str()) == Some("_id") {
            return true;
        }
        self.fields.len() <= index_key.len()
            && self
                .fields
                .iter()
                .zip(index_key)
                .all(|(a, b)| a.name == b.name)
    }
}

impl fmt::Display for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_document())
    }
}

impl Serialize for ShardKeyPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_document().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ShardKeyPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let doc = Value::deserialize(deserializer)?;
        ShardKeyPattern::from_document(&doc).map_err(serde::de::Error::custom)
    }
}
