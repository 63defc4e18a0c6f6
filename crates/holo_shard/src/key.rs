//! Shard key values and their total order.
//!
//! Documents are plain JSON objects. A shard key value is one field pulled
//! out of a document, and a [`ShardKey`] is the tuple of those values in
//! pattern order. Comparison follows a fixed type ranking so that every
//! pair of keys is ordered:
//!
//! `MinKey < null < numbers < strings < booleans < MaxKey`
//!
//! The sentinels are spelled `{"$minKey": 1}` and `{"$maxKey": 1}` in JSON.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

const MIN_KEY_FIELD: &str = "$minKey";
const MAX_KEY_FIELD: &str = "$maxKey";

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// One component of a shard key.
#[derive(Debug, Clone)]
pub enum KeyValue {
    MinKey,
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    MaxKey,
}

impl KeyValue {
    fn type_rank(&self) -> u8 {
        match self {
            KeyValue::MinKey => 0,
            KeyValue::Null => 1,
            KeyValue::Int(_) | KeyValue::Float(_) => 2,
            KeyValue::Str(_) => 3,
            KeyValue::Bool(_) => 4,
            KeyValue::MaxKey => 5,
        }
    }

    /// Converts a JSON value into a key value.
    ///
    /// Arrays and objects other than the two sentinels are not valid key
    /// values and return `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(KeyValue::Null),
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(KeyValue::Int(i)),
                None => n.as_f64().map(KeyValue::Float),
            },
            Value::String(s) => Some(KeyValue::Str(s.clone())),
            Value::Object(map) if map.len() == 1 => {
                if map.contains_key(MIN_KEY_FIELD) {
                    Some(KeyValue::MinKey)
                } else if map.contains_key(MAX_KEY_FIELD) {
                    Some(KeyValue::MaxKey)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::MinKey => json!({ MIN_KEY_FIELD: 1 }),
            KeyValue::Null => Value::Null,
            KeyValue::Int(i) => json!(i),
            KeyValue::Float(f) => json!(f),
            KeyValue::Str(s) => Value::String(s.clone()),
            KeyValue::Bool(b) => Value::Bool(*b),
            KeyValue::MaxKey => json!({ MAX_KEY_FIELD: 1 }),
        }
    }

    pub fn is_min(&self) -> bool {
        matches!(self, KeyValue::MinKey)
    }

    pub fn is_max(&self) -> bool {
        matches!(self, KeyValue::MaxKey)
    }

    /// Integral floats are folded into `Int` so that `1` and `1.0` hash alike.
    fn canonical_number(&self) -> Option<KeyValue> {
        match self {
            KeyValue::Float(f)
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 =>
            {
                Some(KeyValue::Int(*f as i64))
            }
            _ => None,
        }
    }
}

/// Exact comparison of an integer with a float. NaN sorts like `total_cmp`:
/// positive NaN above every number, negative NaN below.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    // 2^63, the first float above i64::MAX.
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() {
        return if f.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if f >= TWO_POW_63 {
        return Ordering::Less;
    }
    if f < -TWO_POW_63 {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal if f > whole => Ordering::Less,
        Ordering::Equal if f < whole => Ordering::Greater,
        other => other,
    }
}

fn cmp_numbers(a: &KeyValue, b: &KeyValue) -> Ordering {
    match (a, b) {
        (KeyValue::Int(x), KeyValue::Int(y)) => x.cmp(y),
        (KeyValue::Float(x), KeyValue::Float(y)) => {
            x.partial_cmp(y).unwrap_or_else(|| x.total_cmp(y))
        }
        (KeyValue::Int(x), KeyValue::Float(y)) => cmp_int_float(*x, *y),
        (KeyValue::Float(x), KeyValue::Int(y)) => cmp_int_float(*y, *x).reverse(),
        _ => Ordering::Equal,
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (KeyValue::Str(a), KeyValue::Str(b)) => a.cmp(b),
            (KeyValue::Bool(a), KeyValue::Bool(b)) => a.cmp(b),
            (a, b) if a.type_rank() == 2 => cmp_numbers(a, b),
            _ => Ordering::Equal,
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for KeyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        KeyValue::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid shard key value: {value}")))
    }
}

/// Tuple of key values, one per shard key pattern field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardKey(pub Vec<KeyValue>);

impl std::hash::Hash for KeyValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let canonical = self.canonical_number();
        hash_key_value(canonical.as_ref().unwrap_or(self), 0).hash(state);
    }
}

impl ShardKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_global_min(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(KeyValue::is_min)
    }

    pub fn is_global_max(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(KeyValue::is_max)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Seeded FNV-1a over a canonical encoding of the value, reinterpreted as a
/// signed 64-bit integer. Stable across processes and releases.
pub fn hash_key_value(value: &KeyValue, seed: i32) -> i64 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut feed = |bytes: &[u8]| {
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    feed(&seed.to_le_bytes());
    let canonical = value.canonical_number();
    match canonical.as_ref().unwrap_or(value) {
        KeyValue::MinKey => feed(&[0]),
        KeyValue::Null => feed(&[1]),
        KeyValue::Int(i) => {
            feed(&[2]);
            feed(&i.to_le_bytes());
        }
        KeyValue::Float(f) => {
            feed(&[3]);
            feed(&f.to_bits().to_le_bytes());
        }
        KeyValue::Str(s) => {
            feed(&[4]);
            feed(s.as_bytes());
        }
        KeyValue::Bool(b) => feed(&[5, u8::from(*b)]),
        KeyValue::MaxKey => feed(&[6]),
    }
    hash as i64
}

/// Looks up a possibly dotted field path in a document.
///
/// A literal key containing dots wins over path traversal.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let obj = doc.as_object()?;
    if let Some(value) = obj.get(path) {
        return Some(value);
    }
    let (head, rest) = path.split_once('.')?;
    lookup_path(obj.get(head)?, rest)
}
