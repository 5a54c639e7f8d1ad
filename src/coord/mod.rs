//! Coordination store: leased keys, prefix watches and a blocking work queue.
//!
//! Executors prove liveness by holding a leased key, operations are pushed
//! to owners through short-lived broadcast keys, and alert ids travel through
//! named queue topics. Two backends share the [`Coordinator`] contract.

mod memory;
mod sqlite;

pub use memory::MemoryCoordinator;
pub use sqlite::SqliteCoordinator;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::db::DbError;

/// Keyspace of executor registrations.
pub const EXECUTOR_PREFIX: &str = "alert-executors/";
/// Keyspace of operation broadcasts.
pub const BROADCAST_PREFIX: &str = "al-broadcast/";

pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// A change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    /// Explicit delete or lease expiry.
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) => &kv.key,
            WatchEvent::Delete { key } => key,
        }
    }
}

/// Coordination store error types.
#[derive(Error, Debug)]
pub enum CoordError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Store error: {0}")]
    Store(#[from] DbError),
    #[error("lease {0} not found or expired")]
    LeaseNotFound(LeaseId),
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create a lease that expires after `ttl`.
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordError>;

    /// Store a value, optionally bound to a lease. Expiry of the lease
    /// deletes the key.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), CoordError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CoordError>;

    /// All live keys under `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, CoordError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CoordError>;

    /// Stream changes under `prefix` made after this call.
    ///
    /// The stream ends when the receiver is dropped, the backend shuts down,
    /// or events were lost; callers re-list after reopening.
    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, CoordError>;

    async fn enqueue(&self, topic: &str, value: &str) -> Result<(), CoordError>;

    /// Pop the oldest item of `topic`, waiting until one is available.
    async fn dequeue(&self, topic: &str) -> Result<String, CoordError>;
}

/// Capacity of a watch stream before the producer waits.
pub(crate) const WATCH_BUFFER: usize = 64;
