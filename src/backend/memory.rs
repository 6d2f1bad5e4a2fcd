//! In-process backend.
//!
//! A single mutex-guarded map with lazy expiration; the one lock is what
//! makes `apply` atomic. Tests run against this, and single-node
//! deployments get the distributed semantics without a server. The
//! availability switch simulates an unreachable store for fail-open tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CacheError;
use crate::sync::mutex_lock;

use super::{Backend, Batch, BatchOp, KeyTtl};

const SOURCE: &str = "backend::memory";

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Blob(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    Set(HashSet<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "string",
            Self::Blob(_) => "string",
            Self::Hash(_) => "hash",
            Self::Set(_) => "set",
        }
    }
}

#[derive(Debug, Clone)]
struct Record {
    value: Value,
    expires_at: Option<Instant>,
}

impl Record {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

struct Inner {
    records: HashMap<String, Record>,
    available: bool,
}

impl Inner {
    /// Purge `key` if its TTL lapsed, then hand back whatever remains.
    fn live(&mut self, key: &str) -> Option<&mut Record> {
        if self.records.get(key).is_some_and(Record::expired) {
            self.records.remove(key);
        }
        self.records.get_mut(key)
    }

    fn live_keys_sorted(&mut self) -> Vec<String> {
        self.records.retain(|_, record| !record.expired());
        let mut keys: Vec<String> = self.records.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn check_op(&mut self, op: &BatchOp) -> Result<(), CacheError> {
        match op {
            BatchOp::HashSet { key, .. } => match self.live(key).map(|record| &record.value) {
                None | Some(Value::Hash(_)) => Ok(()),
                Some(found) => Err(wrong_type(key, "hash", found)),
            },
            BatchOp::SetAdd { key, .. } | BatchOp::SetRemove { key, .. } => {
                match self.live(key).map(|record| &record.value) {
                    None | Some(Value::Set(_)) => Ok(()),
                    Some(found) => Err(wrong_type(key, "set", found)),
                }
            }
            BatchOp::ExpireMs { .. } | BatchOp::Delete { .. } => Ok(()),
        }
    }

    fn apply_op(&mut self, op: &BatchOp) {
        match op {
            BatchOp::HashSet { key, fields } => match self.live(key) {
                Some(record) => {
                    if let Value::Hash(existing) = &mut record.value {
                        existing.extend(fields.iter().cloned());
                    }
                }
                None => {
                    self.records.insert(
                        key.clone(),
                        Record {
                            value: Value::Hash(fields.iter().cloned().collect()),
                            expires_at: None,
                        },
                    );
                }
            },
            BatchOp::ExpireMs { key, ttl_ms } => {
                if *ttl_ms == 0 {
                    self.records.remove(key);
                } else if let Some(record) = self.live(key) {
                    record.expires_at = Some(Instant::now() + Duration::from_millis(*ttl_ms));
                }
            }
            BatchOp::SetAdd { key, member } => match self.live(key) {
                Some(record) => {
                    if let Value::Set(members) = &mut record.value {
                        members.insert(member.clone());
                    }
                }
                None => {
                    self.records.insert(
                        key.clone(),
                        Record {
                            value: Value::Set(HashSet::from([member.clone()])),
                            expires_at: None,
                        },
                    );
                }
            },
            BatchOp::SetRemove { key, member } => {
                let emptied = match self.live(key) {
                    Some(record) => {
                        if let Value::Set(members) = &mut record.value {
                            members.remove(member);
                            members.is_empty()
                        } else {
                            false
                        }
                    }
                    None => false,
                };
                // An empty set vanishes, as it does in Redis.
                if emptied {
                    self.records.remove(key);
                }
            }
            BatchOp::Delete { keys } => {
                for key in keys {
                    self.records.remove(key);
                }
            }
        }
    }
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> CacheError {
    CacheError::unavailable(format!(
        "wrong type at {key}: expected {expected}, found {}",
        found.type_name()
    ))
}

fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

/// Shared-store semantics in process memory.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                available: true,
            }),
        }
    }

    /// Simulate an unreachable store: every operation fails until restored.
    pub fn set_available(&self, available: bool) {
        mutex_lock(&self.inner, SOURCE, "set_available").available = available;
    }

    fn guard(&self, op: &'static str) -> Result<MutexGuard<'_, Inner>, CacheError> {
        let guard = mutex_lock(&self.inner, SOURCE, op);
        if !guard.available {
            return Err(CacheError::unavailable("memory backend offline"));
        }
        Ok(guard)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn set_if_absent_ms(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, CacheError> {
        let mut inner = self.guard("set_if_absent_ms")?;
        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.records.insert(
            key.to_string(),
            Record {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
            },
        );
        Ok(true)
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut inner = self.guard("get_string")?;
        match inner.live(key).map(|record| &record.value) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(Value::Blob(bytes)) => Ok(Some(String::from_utf8_lossy(bytes).into_owned())),
            Some(found) => Err(wrong_type(key, "string", found)),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        let mut inner = self.guard("hash_get_all")?;
        match inner.live(key).map(|record| &record.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(found) => Err(wrong_type(key, "hash", found)),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut inner = self.guard("hash_get")?;
        match inner.live(key).map(|record| &record.value) {
            None => Ok(None),
            Some(Value::Hash(fields)) => Ok(fields.get(field).cloned()),
            Some(found) => Err(wrong_type(key, "hash", found)),
        }
    }

    async fn expire_ms(&self, key: &str, ttl_ms: u64) -> Result<bool, CacheError> {
        let mut inner = self.guard("expire_ms")?;
        if ttl_ms == 0 {
            return Ok(inner.live(key).is_some() && inner.records.remove(key).is_some());
        }
        match inner.live(key) {
            Some(record) => {
                record.expires_at = Some(Instant::now() + Duration::from_millis(ttl_ms));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl_ms(&self, key: &str) -> Result<KeyTtl, CacheError> {
        let mut inner = self.guard("ttl_ms")?;
        match inner.live(key) {
            None => Ok(KeyTtl::Missing),
            Some(record) => match record.expires_at {
                None => Ok(KeyTtl::Unbounded),
                Some(at) => Ok(KeyTtl::Remaining(
                    at.saturating_duration_since(Instant::now()).as_millis() as u64,
                )),
            },
        }
    }

    async fn append(&self, key: &str, chunk: &[u8]) -> Result<u64, CacheError> {
        let mut inner = self.guard("append")?;
        match inner.live(key) {
            None => {
                inner.records.insert(
                    key.to_string(),
                    Record {
                        value: Value::Blob(chunk.to_vec()),
                        expires_at: None,
                    },
                );
                Ok(chunk.len() as u64)
            }
            Some(record) => match &mut record.value {
                Value::Blob(buffer) => {
                    buffer.extend_from_slice(chunk);
                    Ok(buffer.len() as u64)
                }
                Value::Text(text) => {
                    let mut buffer = std::mem::take(text).into_bytes();
                    buffer.extend_from_slice(chunk);
                    let length = buffer.len() as u64;
                    record.value = Value::Blob(buffer);
                    Ok(length)
                }
                found => Err(wrong_type(key, "string", found)),
            },
        }
    }

    async fn range(&self, key: &str, start: u64, end: u64) -> Result<Bytes, CacheError> {
        let mut inner = self.guard("range")?;
        let bytes: &[u8] = match inner.live(key).map(|record| &record.value) {
            None => return Ok(Bytes::new()),
            Some(Value::Blob(buffer)) => buffer,
            Some(Value::Text(text)) => text.as_bytes(),
            Some(found) => return Err(wrong_type(key, "string", found)),
        };
        let start = start.min(bytes.len() as u64) as usize;
        let end = (end.saturating_add(1)).min(bytes.len() as u64) as usize;
        if start >= end {
            return Ok(Bytes::new());
        }
        Ok(Bytes::copy_from_slice(&bytes[start..end]))
    }

    async fn strlen(&self, key: &str) -> Result<u64, CacheError> {
        let mut inner = self.guard("strlen")?;
        match inner.live(key).map(|record| &record.value) {
            None => Ok(0),
            Some(Value::Blob(buffer)) => Ok(buffer.len() as u64),
            Some(Value::Text(text)) => Ok(text.len() as u64),
            Some(found) => Err(wrong_type(key, "string", found)),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut inner = self.guard("set_members")?;
        match inner.live(key).map(|record| &record.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(found) => Err(wrong_type(key, "set", found)),
        }
    }

    async fn set_len(&self, key: &str) -> Result<u64, CacheError> {
        let mut inner = self.guard("set_len")?;
        match inner.live(key).map(|record| &record.value) {
            None => Ok(0),
            Some(Value::Set(members)) => Ok(members.len() as u64),
            Some(found) => Err(wrong_type(key, "set", found)),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut inner = self.guard("delete")?;
        let mut removed = 0;
        for key in keys {
            if inner.live(key).is_some() && inner.records.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        page_size: u64,
    ) -> Result<(u64, Vec<String>), CacheError> {
        let mut inner = self.guard("scan")?;
        let matching: Vec<String> = inner
            .live_keys_sorted()
            .into_iter()
            .filter(|key| pattern_matches(pattern, key))
            .collect();
        let start = (cursor as usize).min(matching.len());
        let end = start.saturating_add(page_size.max(1) as usize).min(matching.len());
        let page = matching[start..end].to_vec();
        let next = if end >= matching.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn apply(&self, batch: Batch) -> Result<(), CacheError> {
        let mut inner = self.guard("apply")?;
        for op in batch.ops() {
            inner.check_op(op)?;
        }
        for op in batch.ops() {
            inner.apply_op(op);
        }
        Ok(())
    }

    async fn key_count(&self) -> Result<u64, CacheError> {
        let mut inner = self.guard("key_count")?;
        Ok(inner.live_keys_sorted().len() as u64)
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        let mut inner = self.guard("flush_all")?;
        inner.records.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conditional_set_claims_once() {
        let backend = MemoryBackend::new();
        assert!(
            backend
                .set_if_absent_ms("lock:/a", "token-1", 5_000)
                .await
                .expect("first claim")
        );
        assert!(
            !backend
                .set_if_absent_ms("lock:/a", "token-2", 5_000)
                .await
                .expect("second claim")
        );
        assert_eq!(
            backend.get_string("lock:/a").await.expect("read lock"),
            Some("token-1".to_string())
        );
    }

    #[tokio::test]
    async fn expired_keys_vanish() {
        let backend = MemoryBackend::new();
        backend.append("data:t:/a", b"payload").await.expect("append");
        assert!(backend.expire_ms("data:t:/a", 20).await.expect("arm ttl"));

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(backend.strlen("data:t:/a").await.expect("strlen"), 0);
        assert_eq!(backend.ttl_ms("data:t:/a").await.expect("ttl"), KeyTtl::Missing);
        assert_eq!(backend.key_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn append_and_ranged_reads() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.append("blob", b"hello ").await.expect("append"), 6);
        assert_eq!(backend.append("blob", b"world").await.expect("append"), 11);

        let chunk = backend.range("blob", 0, 4).await.expect("range");
        assert_eq!(&chunk[..], b"hello");
        let chunk = backend.range("blob", 6, 99).await.expect("range");
        assert_eq!(&chunk[..], b"world");
        let chunk = backend.range("blob", 11, 20).await.expect("range");
        assert!(chunk.is_empty());
        let chunk = backend.range("missing", 0, 10).await.expect("range");
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn batch_applies_hash_expiry_and_membership_together() {
        let backend = MemoryBackend::new();
        let batch = Batch::new()
            .hash_set("/a", vec![("status".to_string(), b"200".to_vec())])
            .expire_ms("/a", 5_000)
            .set_add("group:movies", "/a");
        backend.apply(batch).await.expect("apply batch");

        let fields = backend.hash_get_all("/a").await.expect("read hash");
        assert_eq!(fields.get("status").map(Vec::as_slice), Some(b"200".as_slice()));
        assert!(matches!(
            backend.ttl_ms("/a").await.expect("ttl"),
            KeyTtl::Remaining(_)
        ));
        assert_eq!(
            backend.set_members("group:movies").await.expect("members"),
            vec!["/a".to_string()]
        );
    }

    #[tokio::test]
    async fn removing_last_member_drops_the_set_key() {
        let backend = MemoryBackend::new();
        backend
            .apply(Batch::new().set_add("group:g", "/a").set_add("group:g", "/b"))
            .await
            .expect("seed set");
        backend
            .apply(
                Batch::new()
                    .set_remove("group:g", "/a")
                    .set_remove("group:g", "/b"),
            )
            .await
            .expect("empty the set");

        assert_eq!(backend.set_len("group:g").await.expect("len"), 0);
        assert_eq!(backend.key_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn batch_with_a_type_conflict_applies_nothing() {
        let backend = MemoryBackend::new();
        backend
            .set_if_absent_ms("plain", "text", 60_000)
            .await
            .expect("seed text key");

        let batch = Batch::new()
            .hash_set("/fresh", vec![("status".to_string(), b"200".to_vec())])
            .set_add("plain", "/member");
        backend.apply(batch).await.expect_err("type conflict");

        assert!(backend.hash_get_all("/fresh").await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn scan_pages_through_matching_keys() {
        let backend = MemoryBackend::new();
        for key in ["app:/a", "app:/b", "app:/c", "app:/d", "app:/e", "other:/x"] {
            backend.append(key, b"1").await.expect("seed");
        }

        let mut cursor = 0u64;
        let mut seen = Vec::new();
        loop {
            let (next, page) = backend.scan(cursor, "app:*", 2).await.expect("scan");
            assert!(page.len() <= 2);
            seen.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen, vec!["app:/a", "app:/b", "app:/c", "app:/d", "app:/e"]);
    }

    #[tokio::test]
    async fn delete_counts_only_existing_keys() {
        let backend = MemoryBackend::new();
        backend.append("/a", b"1").await.expect("seed");
        let removed = backend
            .delete(&["/a".to_string(), "/missing".to_string()])
            .await
            .expect("delete");
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn offline_backend_fails_every_operation() {
        let backend = MemoryBackend::new();
        backend.append("/a", b"1").await.expect("seed");

        backend.set_available(false);
        let err = backend.get_string("/a").await.expect_err("offline");
        assert!(matches!(err, CacheError::BackendUnavailable { .. }));

        backend.set_available(true);
        assert_eq!(backend.strlen("/a").await.expect("restored"), 1);
    }
}
