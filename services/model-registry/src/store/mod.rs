//! Generic persistent key-value store with secondary indexes and guarded,
//! atomic write batches. Conditional creation (`Guard::Absent`) and
//! conditional append (`Guard::Equals`) are both expressed as batch guards.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod sled_store;
pub use sled_store::SledStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("precondition failed on {0}")] PreconditionFailed(String),
    #[error("storage backend: {0}")] Backend(String),
    #[error("corrupt record {key}: {reason}")] Corrupt { key: String, reason: String },
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self { StoreError::Backend(e.to_string()) }
}

/// One secondary-index posting for a record, e.g. `("team", "fraud")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry { pub index: String, pub value: String }

impl IndexEntry {
    pub fn new(index: impl Into<String>, value: impl Into<String>) -> Self { Self { index: index.into(), value: value.into() } }
}

#[derive(Debug, Clone)]
pub enum Guard {
    Absent { table: String, key: String },
    Equals { table: String, key: String, value: Vec<u8> },
}

#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Replaces the record and its index postings.
    Put { table: String, key: String, value: Vec<u8>, indexes: Vec<IndexEntry> },
    Delete { table: String, key: String },
}

/// All guards are checked and all ops applied in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch { pub guards: Vec<Guard>, pub ops: Vec<WriteOp> }

impl WriteBatch {
    pub fn new() -> Self { Self::default() }
    pub fn require_absent(mut self, table: &str, key: &str) -> Self {
        self.guards.push(Guard::Absent { table: table.into(), key: key.into() }); self
    }
    pub fn require_equals(mut self, table: &str, key: &str, value: Vec<u8>) -> Self {
        self.guards.push(Guard::Equals { table: table.into(), key: key.into(), value }); self
    }
    pub fn put(mut self, table: &str, key: &str, value: Vec<u8>, indexes: Vec<IndexEntry>) -> Self {
        self.ops.push(WriteOp::Put { table: table.into(), key: key.into(), value, indexes }); self
    }
    pub fn delete(mut self, table: &str, key: &str) -> Self {
        self.ops.push(WriteOp::Delete { table: table.into(), key: key.into() }); self
    }
}

/// Prefix scan bounds. Results are in storage-key order.
#[derive(Debug, Clone, Default)]
pub struct Scan<'a> { pub prefix: &'a str, pub start_after: Option<&'a str>, pub limit: Option<usize> }

impl<'a> Scan<'a> {
    pub fn prefix(prefix: &'a str) -> Self { Self { prefix, ..Default::default() } }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn scan(&self, table: &str, scan: Scan<'_>) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
    /// Records whose posting for `index` equals `value`, in primary-key order.
    async fn query_index(&self, table: &str, index: &str, value: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}
