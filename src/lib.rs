//! Novel Store is the local persistence layer of a novel-writing workspace.
//!
//! Chapters, scenes, characters, plot points, goals, research notes, timeline
//! events, settings and daily writing statistics live in named collections.
//! The store prefers an indexed SQLite database and transparently falls back to
//! a flat key-blob store when the database cannot be opened or a call to it fails.
//!
//! ## Core Components
//! - [`engine`]: The two backends (SQLite primary, key-blob fallback) and the collection schema.
//! - [`sdk`]: The [`sdk::Store`] facade, its configuration and the auto-backup task.
//! - [`records`]: Typed records, one per collection.
//! - [`snapshot`]: Export/import of the full workspace as one JSON document.
//! - [`query`]: Sorted views, writing statistics and full-text search.

pub mod engine;
pub mod query;
pub mod records;
pub mod sdk;
pub mod snapshot;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use engine::Collection;

/// Errors returned by the Novel Store.
#[derive(Error, Debug)]
pub enum Error {
    /// The collection name is not one of the nine known collections.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    /// The collection declares no index with this name.
    #[error("collection {collection} has no index named {index}")]
    UnknownIndex { collection: String, index: String },
    /// A record with the same key already exists.
    #[error("duplicate key {key} in {collection}")]
    DuplicateKey { collection: String, key: String },
    /// A record for an explicitly keyed collection lacks its key field.
    #[error("record for {collection} is missing its {field} key")]
    MissingKey { collection: String, field: String },
    /// The record is not a JSON object or carries an unusable key.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// The primary backend could not be opened.
    #[error("primary backend initialization failed: {0}")]
    Initialization(String),
    /// The primary backend failed and so did the fallback.
    #[error("both backends failed (primary: {primary}; fallback: {fallback})")]
    BothBackendsFailed { primary: String, fallback: String },
    /// The document offered for import is not a plausible snapshot.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
    /// An I/O error occurred while reading or writing blobs.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Error raised by the SQLite database.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether the error comes from the backend environment rather than from the
    /// caller's request. Only these errors are retried against the fallback.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Error::Initialization(_)
                | Error::Internal(_)
                | Error::Io(_)
                | Error::Serialization(_)
                | Error::Sqlite(_)
        )
    }
}

/// A specialized Result type for Novel Store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifier of a record within its collection.
///
/// Auto-keyed collections use integer ids assigned on insert; `settings` and
/// `stats` are keyed by strings (setting name and `YYYY-MM-DD` date).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Id(i64),
    Name(String),
}

impl Key {
    /// Reads a key from a JSON value, accepting integers and strings only.
    pub fn from_json(value: &serde_json::Value) -> Option<Key> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(Key::Id),
            serde_json::Value::String(s) => Some(Key::Name(s.clone())),
            _ => None,
        }
    }

    /// The key as it appears in a stored record.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Key::Id(id) => serde_json::Value::from(*id),
            Key::Name(name) => serde_json::Value::String(name.clone()),
        }
    }

    /// The integer id, if this is an auto-assigned key.
    pub fn as_id(&self) -> Option<i64> {
        match self {
            Key::Id(id) => Some(*id),
            Key::Name(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Id(id) => write!(f, "{}", id),
            Key::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for Key {
    fn from(id: i64) -> Self {
        Key::Id(id)
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_string())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

/// Read-only queries against a collection.
#[async_trait]
pub trait CollectionReader: Send + Sync {
    /// Retrieves one record by key, or `None` if absent.
    async fn get(&self, collection: Collection, key: &Key) -> Result<Option<serde_json::Value>>;
    /// Returns every record of the collection in store-native order.
    async fn get_all(&self, collection: Collection) -> Result<Vec<serde_json::Value>>;
    /// Returns every record whose indexed field equals `value`, in store-native order.
    async fn get_all_by_index(
        &self,
        collection: Collection,
        index: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<serde_json::Value>>;
}

/// Mutations against a collection. Each call is atomic for a single record.
#[async_trait]
pub trait CollectionWriter: Send + Sync {
    /// Inserts a new record, assigning an id for auto-keyed collections.
    /// Returns the stored record, id included.
    async fn add(&self, collection: Collection, record: serde_json::Value) -> Result<serde_json::Value>;
    /// Inserts or fully replaces the record with the same key.
    async fn update(&self, collection: Collection, record: serde_json::Value) -> Result<serde_json::Value>;
    /// Removes a record by key. Removing an absent key succeeds.
    async fn delete(&self, collection: Collection, key: &Key) -> Result<()>;
    /// Removes every record of the collection.
    async fn clear(&self, collection: Collection) -> Result<()>;
}

/// The capability both backend adapters implement.
pub trait Backend: CollectionReader + CollectionWriter {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;
}
