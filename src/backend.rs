//! Shared-store interface.
//!
//! The engine needs a narrow slice of a Redis-style store: conditional set
//! with TTL, hash read/write, set membership, millisecond expirations,
//! append and ranged reads on string blobs, cursor scanning, and an atomic
//! multi-operation batch. [`MemoryBackend`] keeps everything in process;
//! [`RedisBackend`] maps onto a real server.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CacheError;

pub mod memory;
pub mod redis;

pub use memory::MemoryBackend;
pub use redis::RedisBackend;

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    /// Key exists with no expiration set.
    Unbounded,
    /// Milliseconds until expiry.
    Remaining(u64),
}

/// One mutation inside an atomic [`Batch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    HashSet {
        key: String,
        fields: Vec<(String, Vec<u8>)>,
    },
    /// `ttl_ms` of zero deletes the key outright.
    ExpireMs {
        key: String,
        ttl_ms: u64,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    Delete {
        keys: Vec<String>,
    },
}

/// Multi-operation batch applied atomically (MULTI/EXEC in Redis terms).
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash_set(mut self, key: impl Into<String>, fields: Vec<(String, Vec<u8>)>) -> Self {
        self.ops.push(BatchOp::HashSet {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn expire_ms(mut self, key: impl Into<String>, ttl_ms: u64) -> Self {
        self.ops.push(BatchOp::ExpireMs {
            key: key.into(),
            ttl_ms,
        });
        self
    }

    pub fn set_add(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SetAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn set_remove(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SetRemove {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn delete(mut self, keys: Vec<String>) -> Self {
        if !keys.is_empty() {
            self.ops.push(BatchOp::Delete { keys });
        }
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Minimal shared-store surface the distributed cache runs on.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Implementation label, embedded in protocol headers on hits.
    fn kind(&self) -> &'static str;

    /// Set `key` to `value` with a TTL only if it does not exist.
    /// Returns whether the set happened.
    async fn set_if_absent_ms(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, CacheError>;

    async fn get_string(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// All fields of a hash; empty when the key is missing.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, CacheError>;

    /// Read one hash field without transferring the rest.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Set or refresh a TTL. Returns false when the key is missing.
    /// A TTL of zero deletes the key.
    async fn expire_ms(&self, key: &str, ttl_ms: u64) -> Result<bool, CacheError>;

    async fn ttl_ms(&self, key: &str) -> Result<KeyTtl, CacheError>;

    /// Append bytes to a string blob, creating it if missing.
    /// Returns the blob's new length.
    async fn append(&self, key: &str, chunk: &[u8]) -> Result<u64, CacheError>;

    /// Bytes in `start..=end` of a blob; empty when the range is past the
    /// end or the key is missing.
    async fn range(&self, key: &str, start: u64, end: u64) -> Result<Bytes, CacheError>;

    async fn strlen(&self, key: &str) -> Result<u64, CacheError>;

    /// Members of a set; empty when the key is missing. Order is not
    /// meaningful.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError>;

    async fn set_len(&self, key: &str) -> Result<u64, CacheError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// One page of a cursor scan. A returned cursor of zero ends the
    /// iteration; pages may repeat keys.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        page_size: u64,
    ) -> Result<(u64, Vec<String>), CacheError>;

    /// Apply a batch atomically: either every operation lands or none do.
    async fn apply(&self, batch: Batch) -> Result<(), CacheError>;

    /// Total keys in the store, cached or not.
    async fn key_count(&self) -> Result<u64, CacheError>;

    /// Drop every key in the store.
    async fn flush_all(&self) -> Result<(), CacheError>;
}
