use std::fmt;

use crate::error::{Result, ShardingError};

/// Databases that can never have sharding enabled.
pub const RESERVED_DATABASES: [&str; 2] = ["admin", "local"];
pub const CONFIG_DATABASE: &str = "config";

/// A `database.collection` name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    pub fn parse(ns: &str) -> Result<Self> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(ShardingError::BadRequest(format!("bad ns[{ns}]"))),
        }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }

    pub fn is_system(&self) -> bool {
        self.coll.starts_with("system.") || self.coll.contains(".system.")
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

pub fn validate_db_name(db: &str) -> Result<()> {
    if db.is_empty() || db.contains(&['.', ' ', '/', '\\', '$', '"'][..]) {
        return Err(ShardingError::BadRequest(format!("invalid db name '{db}'")));
    }
    Ok(())
}
