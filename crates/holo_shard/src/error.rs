//! Error types for sharding administration.

use serde::Serialize;
use thiserror::Error;

use crate::chunk::ChunkVersion;

pub type Result<T> = std::result::Result<T, ShardingError>;

/// Broad classification used by callers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input. Nothing was changed.
    Validation,
    /// The cluster is not in a state that allows the operation.
    Precondition,
    /// Lost a race with another operation. Retrying may succeed.
    Concurrency,
    /// Some steps completed before the failure. Details are in the message.
    PartialOperation,
    /// A collaborator could not be reached or misbehaved.
    Unavailable,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShardingError {
    #[error("sharding already enabled for database '{0}'")]
    AlreadyEnabled(String),

    #[error("can't shard {0} database")]
    ReservedDatabase(String),

    #[error("sharding not enabled for db '{0}'")]
    ShardingNotEnabled(String),

    #[error("already sharded: {0}")]
    AlreadySharded(String),

    #[error("invalid shard key: {0}")]
    InvalidShardKey(String),

    #[error("can't shard collection '{ns}' with unique index on {index} and proposed shard key {key}. Uniqueness can't be maintained unless shard key is a prefix")]
    IncompatibleUniqueIndex {
        ns: String,
        index: String,
        key: String,
    },

    #[error("can't shard collection {ns} with hashed shard key {key} because the hashed index uses a non-default seed of {seed}")]
    NonDefaultHashSeed { ns: String, key: String, seed: i32 },

    #[error("can't shard collection {ns}, index not unique")]
    UniqueConstraintUnsatisfiable { ns: String },

    #[error("please create an index that starts with the shard key before sharding {ns}")]
    NoSupportingIndex { ns: String },

    #[error("can't shard system namespaces: {0}")]
    ReservedNamespace(String),

    #[error("can't shard capped collection {0}")]
    CappedCollection(String),

    #[error("ns not sharded: {0}")]
    NamespaceNotSharded(String),

    #[error("no chunk found for {0}")]
    ChunkNotFound(String),

    #[error("cannot split on initial or final chunk boundary: {0}")]
    SplitPointOnBoundary(String),

    #[error("can't find a split point for chunk {0}")]
    NoSplitPoint(String),

    #[error("that chunk is already on shard {0}")]
    AlreadyOnShard(String),

    #[error("unknown shard: {0}")]
    UnknownShard(String),

    #[error("shard {0} is draining and can't receive data")]
    ShardDraining(String),

    #[error("shard already registered: {0}")]
    DuplicateShard(String),

    #[error("chunk too big to move: {bytes} bytes exceeds limit of {limit}")]
    ChunkTooLarge { bytes: u64, limit: u64 },

    #[error("moveChunk failed to clone data to {to}: {reason}")]
    MigrationCloneFailed { to: String, reason: String },

    #[error("moveChunk failed to commit, clone discarded: {reason}")]
    MigrationCommitFailed { reason: String },

    #[error("Can't remove last shard")]
    OnlyShard,

    #[error("Can't have more than one draining shard at a time (currently draining: {0})")]
    AnotherShardDraining(String),

    #[error("could not acquire lock '{resource}' ({why}), held by {holder}")]
    LockNotAcquired {
        resource: String,
        why: String,
        holder: String,
    },

    #[error("stale metadata: {0}")]
    StaleVersion(String),

    #[error("collection version for {ns} changed: expected {expected}, found {found}")]
    VersionMismatch {
        ns: String,
        expected: ChunkVersion,
        found: ChunkVersion,
    },

    #[error("inconsistent metadata: {0}")]
    InconsistentMetadata(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("database '{0}' not found")]
    UnknownDatabase(String),

    #[error("it is already the primary: {0}")]
    AlreadyPrimary(String),
}

impl ShardingError {
    pub fn kind(&self) -> ErrorKind {
        use ShardingError::*;
        match self {
            ReservedDatabase(_)
            | InvalidShardKey(_)
            | ReservedNamespace(_)
            | SplitPointOnBoundary(_)
            | BadRequest(_) => ErrorKind::Validation,
            AlreadyEnabled(_)
            | ShardingNotEnabled(_)
            | AlreadySharded(_)
            | IncompatibleUniqueIndex { .. }
            | NonDefaultHashSeed { .. }
            | UniqueConstraintUnsatisfiable { .. }
            | NoSupportingIndex { .. }
            | CappedCollection(_)
            | NamespaceNotSharded(_)
            | ChunkNotFound(_)
            | NoSplitPoint(_)
            | AlreadyOnShard(_)
            | UnknownShard(_)
            | ShardDraining(_)
            | DuplicateShard(_)
            | ChunkTooLarge { .. }
            | OnlyShard
            | AnotherShardDraining(_)
            | UnknownDatabase(_)
            | AlreadyPrimary(_) => ErrorKind::Precondition,
            LockNotAcquired { .. } | StaleVersion(_) | VersionMismatch { .. } => {
                ErrorKind::Concurrency
            }
            MigrationCloneFailed { .. } | MigrationCommitFailed { .. } => {
                ErrorKind::PartialOperation
            }
            InconsistentMetadata(_) | Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Stable name reported to admin clients alongside the message.
    pub fn code_name(&self) -> &'static str {
        use ShardingError::*;
        match self {
            AlreadyEnabled(_) => "AlreadyEnabled",
            ReservedDatabase(_) => "ReservedDatabase",
            ShardingNotEnabled(_) => "ShardingNotEnabled",
            AlreadySharded(_) => "AlreadySharded",
            InvalidShardKey(_) => "InvalidShardKey",
            IncompatibleUniqueIndex { .. } => "IncompatibleUniqueIndex",
            NonDefaultHashSeed { .. } => "NonDefaultHashSeed",
            UniqueConstraintUnsatisfiable { .. } => "UniqueConstraintUnsatisfiable",
            NoSupportingIndex { .. } => "NoSupportingIndex",
            ReservedNamespace(_) => "ReservedNamespace",
            CappedCollection(_) => "CappedCollection",
            NamespaceNotSharded(_) => "NamespaceNotSharded",
            ChunkNotFound(_) => "ChunkNotFound",
            SplitPointOnBoundary(_) => "SplitPointOnBoundary",
            NoSplitPoint(_) => "NoSplitPoint",
            AlreadyOnShard(_) => "AlreadyOnShard",
            UnknownShard(_) => "UnknownShard",
            ShardDraining(_) => "ShardDraining",
            DuplicateShard(_) => "DuplicateShard",
            ChunkTooLarge { .. } => "ChunkTooLarge",
            MigrationCloneFailed { .. } => "MigrationCloneFailed",
            MigrationCommitFailed { .. } => "MigrationCommitFailed",
            OnlyShard => "OnlyShard",
            AnotherShardDraining(_) => "AnotherShardDraining",
            LockNotAcquired { .. } => "LockNotAcquired",
            StaleVersion(_) => "StaleVersion",
            VersionMismatch { .. } => "VersionMismatch",
            InconsistentMetadata(_) => "InconsistentMetadata",
            Unavailable(_) => "Unavailable",
            BadRequest(_) => "BadRequest",
            UnknownDatabase(_) => "UnknownDatabase",
            AlreadyPrimary(_) => "AlreadyPrimary",
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }
}

impl<T> From<std::sync::PoisonError<T>> for ShardingError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ShardingError::Unavailable(format!("lock poisoned: {err}"))
    }
}

impl From<std::io::Error> for ShardingError {
    fn from(err: std::io::Error) -> Self {
        ShardingError::Unavailable(format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for ShardingError {
    fn from(err: serde_json::Error) -> Self {
        ShardingError::Unavailable(format!("metadata encoding error: {err}"))
    }
}
