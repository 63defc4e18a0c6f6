//! Index requirements for sharding a collection.
//!
//! Every sharded collection needs an index whose leading fields are the
//! shard key, and no unique index may constrain fields the shard key does
//! not lead, since uniqueness can only be enforced within a single shard.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ShardingError};
use crate::shard_key::{
    key_fields_to_document, parse_key_fields, KeyDirection, KeyField, ShardKeyPattern,
    DEFAULT_HASH_SEED,
};

/// Description of an existing index as reported by a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    #[serde(with = "key_fields_serde")]
    pub key: Vec<KeyField>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default)]
    pub multikey: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_seed: Option<i32>,
}

impl IndexDescriptor {
    pub fn new(name: impl Into<String>, key: Vec<KeyField>) -> Self {
        Self {
            name: name.into(),
            key,
            unique: false,
            sparse: false,
            multikey: false,
            hash_seed: None,
        }
    }

    /// The implicit unique index every collection has on `_id`.
    pub fn id_index() -> Self {
        Self {
            unique: true,
            ..Self::new("_id_", vec![KeyField::new("_id", KeyDirection::Ascending)])
        }
    }

    /// Index name derived from its key, e.g. `a_1_b_-1`.
    pub fn default_name(key: &[KeyField]) -> String {
        key_fields_to_document(key)
            .as_object()
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| match v {
                        Value::String(s) => format!("{k}_{s}"),
                        other => format!("{k}_{other}"),
                    })
                    .collect::<Vec<_>>()
                    .join("_")
            })
            .unwrap_or_default()
    }

    pub fn is_id_index(&self) -> bool {
        self.key.len() == 1 && self.key[0].name == "_id"
    }

    fn effective_seed(&self) -> i32 {
        self.hash_seed.unwrap_or(DEFAULT_HASH_SEED)
    }

    pub fn key_document(&self) -> Value {
        key_fields_to_document(&self.key)
    }
}

mod key_fields_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    use crate::shard_key::{key_fields_to_document, parse_key_fields, KeyField};

    pub fn serialize<S: Serializer>(key: &[KeyField], serializer: S) -> Result<S::Ok, S::Error> {
        key_fields_to_document(key).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<KeyField>, D::Error> {
        let doc = Value::deserialize(deserializer)?;
        parse_key_fields(&doc)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid index key {doc}")))
    }
}

/// What the caller must do to satisfy the index requirement.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexVerdict {
    /// An existing index already supports the shard key.
    Supported { index: String },
    /// The collection is empty and the shard key index has to be built.
    CreateIndex { key: Vec<KeyField>, unique: bool },
}

/// Decides whether the indexes of `ns` can back `pattern`.
///
/// Inputs:
/// - `existing`: every index currently on the collection.
/// - `collection_is_empty`: whether a missing index may be created.
/// - `want_unique`: whether the shard key must also enforce uniqueness.
///
/// Output:
/// - `Ok(IndexVerdict)` naming the supporting index or the one to build.
/// - `Err` with the first violated rule.
pub fn validate_candidate(
    ns: &str,
    pattern: &ShardKeyPattern,
    existing: &[IndexDescriptor],
    collection_is_empty: bool,
    want_unique: bool,
) -> Result<IndexVerdict> {
    if pattern.is_hashed() && want_unique && pattern.len() != 1 {
        return Err(ShardingError::InvalidShardKey(format!(
            "hashed shard key {pattern} must have exactly one field to be unique"
        )));
    }

    for index in existing.iter().filter(|idx| idx.unique) {
        if !pattern.is_unique_index_compatible(&index.key) {
            return Err(ShardingError::IncompatibleUniqueIndex {
                ns: ns.to_string(),
                index: index.key_document().to_string(),
                key: pattern.to_string(),
            });
        }
    }

    let mut useful = None;
    for index in existing {
        if index.sparse || index.multikey || !pattern.is_prefix_of(&index.key) {
            continue;
        }
        if pattern.is_hashed() && index.effective_seed() != DEFAULT_HASH_SEED {
            return Err(ShardingError::NonDefaultHashSeed {
                ns: ns.to_string(),
                key: pattern.to_string(),
                seed: index.effective_seed(),
            });
        }
        useful.get_or_insert(index);
    }

    let Some(useful) = useful else {
        if !collection_is_empty {
            return Err(ShardingError::NoSupportingIndex { ns: ns.to_string() });
        }
        return Ok(IndexVerdict::CreateIndex {
            key: pattern.fields().to_vec(),
            unique: want_unique,
        });
    };

    if want_unique {
        let exact = existing
            .iter()
            .find(|idx| idx.key.as_slice() == pattern.fields());
        return match exact {
            Some(idx) if idx.unique || idx.is_id_index() => Ok(IndexVerdict::Supported {
                index: idx.name.clone(),
            }),
            _ => Err(ShardingError::UniqueConstraintUnsatisfiable { ns: ns.to_string() }),
        };
    }

    Ok(IndexVerdict::Supported {
        index: useful.name.clone(),
    })
}

/// Builds a descriptor from a `{name, key, unique, ...}` document.
pub fn descriptor_from_document(doc: &Value) -> Result<IndexDescriptor> {
    let key = doc
        .get("key")
        .and_then(parse_key_fields)
        .ok_or_else(|| ShardingError::BadRequest(format!("index document {doc} has no valid key")))?;
    let name = doc
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| IndexDescriptor::default_name(&key));
    let flag = |field: &str| doc.get(field).and_then(Value::as_bool).unwrap_or(false);
    Ok(IndexDescriptor {
        name,
        key,
        unique: flag("unique"),
        sparse: flag("sparse"),
        multikey: flag("multikey"),
        hash_seed: doc
            .get("seed")
            .and_then(Value::as_i64)
            .and_then(|s| i32::try_from(s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pattern(doc: Value) -> ShardKeyPattern {
        ShardKeyPattern::from_document(&doc).expect("pattern")
    }

    fn index(doc: Value) -> IndexDescriptor {
        descriptor_from_document(&doc).expect("index")
    }

    #[test]
    fn unique_index_must_be_led_by_shard_key() {
        let existing = vec![
            IndexDescriptor::id_index(),
            index(json!({"key": {"a": 1, "b": 1}, "unique": true})),
        ];

        let verdict = validate_candidate("db.c", &pattern(json!({"a": 1})), &existing, false, false)
            .expect("a leads the unique index");
        assert_eq!(
            verdict,
            IndexVerdict::Supported {
                index: "a_1_b_1".into()
            }
        );

        let err = validate_candidate("db.c", &pattern(json!({"b": 1})), &existing, false, false)
            .expect_err("b does not lead the unique index");
        assert_eq!(err.code_name(), "IncompatibleUniqueIndex");
    }

    #[test]
    fn sparse_and_multikey_indexes_are_not_useful() {
        let existing = vec![
            IndexDescriptor::id_index(),
            index(json!({"key": {"a": 1}, "sparse": true})),
            index(json!({"key": {"a": 1, "z": 1}, "multikey": true})),
        ];
        let err = validate_candidate("db.c", &pattern(json!({"a": 1})), &existing, false, false)
            .expect_err("no useful index");
        assert_eq!(err, ShardingError::NoSupportingIndex { ns: "db.c".into() });
    }

    #[test]
    fn empty_collection_gets_index_created() {
        let verdict = validate_candidate(
            "db.c",
            &pattern(json!({"a": 1})),
            &[IndexDescriptor::id_index()],
            true,
            true,
        )
        .expect("create");
        assert_eq!(
            verdict,
            IndexVerdict::CreateIndex {
                key: pattern(json!({"a": 1})).fields().to_vec(),
                unique: true
            }
        );
    }

    #[test]
    fn hashed_index_needs_default_seed() {
        let existing = vec![index(json!({"key": {"a": "hashed"}, "seed": 7}))];
        let err = validate_candidate("db.c", &pattern(json!({"a": "hashed"})), &existing, true, false)
            .expect_err("seed");
        assert_eq!(err.code_name(), "NonDefaultHashSeed");

        let existing = vec![index(json!({"key": {"a": "hashed"}, "seed": 0}))];
        assert!(
            validate_candidate("db.c", &pattern(json!({"a": "hashed"})), &existing, false, false)
                .is_ok()
        );
    }

    #[test]
    fn unique_request_needs_exact_unique_index() {
        let existing = vec![IndexDescriptor::id_index(), index(json!({"key": {"a": 1, "b": 1}}))];
        let err = validate_candidate("db.c", &pattern(json!({"a": 1})), &existing, false, true)
            .expect_err("no exact unique index");
        assert_eq!(err.code_name(), "UniqueConstraintUnsatisfiable");

        let existing = vec![
            IndexDescriptor::id_index(),
            index(json!({"key": {"a": 1}, "unique": true, "name": "a_unique"})),
        ];
        let verdict = validate_candidate("db.c", &pattern(json!({"a": 1})), &existing, false, true)
            .expect("exact unique");
        assert_eq!(
            verdict,
            IndexVerdict::Supported {
                index: "a_unique".into()
            }
        );
    }

    #[test]
    fn id_index_backs_id_shard_key() {
        let verdict = validate_candidate(
            "db.c",
            &pattern(json!({"_id": 1})),
            &[IndexDescriptor::id_index()],
            false,
            true,
        )
        .expect("id index");
        assert_eq!(verdict, IndexVerdict::Supported { index: "_id_".into() });
    }
}
