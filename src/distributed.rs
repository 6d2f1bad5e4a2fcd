//! Distributed store over a shared backend.
//!
//! Entry metadata lives in per-key hashes, group membership in sets,
//! and streamed bodies in token-addressed blobs. The backend's own TTL
//! is authoritative for entry expiry; local timers surface the lapse
//! and sweep the key out of its group set. Every multi-key mutation
//! goes through one atomic batch so a crash between commands cannot
//! strand half an entry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::backend::{Backend, Batch, KeyTtl};
use crate::config::CacheConfig;
use crate::entry::{
    CacheEntry, CacheHit, CachedBody, EntryBody, FIELD_GROUP, FIELD_TOKEN, ResponsePayload,
    ServePlan, filter_headers, from_fields, plan_serve, to_fields,
};
use crate::error::CacheError;
use crate::index::CacheIndex;
use crate::keys::{self, StoreKey};
use crate::transfer::{TransferReader, TransferWriter};

const SOURCE: &str = "distributed";
const METRIC_ENTRY_EXPIRED: &str = "risposta_entry_expired_total";
const METRIC_MALFORMED_ENTRY: &str = "risposta_malformed_entry_total";
const METRIC_CLEARED: &str = "risposta_cleared_total";

// ============================================================================
// Shared state
// ============================================================================

/// State shared between the store facade and in-flight transfers.
pub(crate) struct StoreShared {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) config: CacheConfig,
    timers: DashMap<String, ExpiryTimer>,
    timer_generations: AtomicU64,
}

struct ExpiryTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl StoreShared {
    /// Arm an expiry timer for a stored entry.
    ///
    /// The backend TTL does the actual eviction; the timer surfaces the
    /// lapse in logs and metrics, prunes the key from its group set,
    /// and is replaced wholesale when the key is written again.
    pub(crate) fn schedule_expiry(
        self: &Arc<Self>,
        key: &str,
        ttl_ms: u64,
        group: Option<String>,
    ) {
        let generation = self.timer_generations.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = self.timers.insert(
            key.to_string(),
            ExpiryTimer {
                generation,
                handle: None,
            },
        ) && let Some(handle) = previous.handle
        {
            handle.abort();
        }

        let shared = Arc::clone(self);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl_ms)).await;
            let removed = shared
                .timers
                .remove_if(&owned_key, |_, timer| timer.generation == generation);
            if removed.is_some() {
                counter!(METRIC_ENTRY_EXPIRED, "store" => "distributed").increment(1);
                debug!(source = SOURCE, key = %owned_key, "entry ttl lapsed");
                if let Some(group) = group {
                    let marker = keys::group_key(&shared.config.key_prefix, &group);
                    let prune = Batch::new().set_remove(marker, owned_key.clone());
                    if let Err(err) = shared.backend.apply(prune).await {
                        debug!(
                            source = SOURCE,
                            key = %owned_key,
                            group = %group,
                            error = %err,
                            "could not prune expired group membership"
                        );
                    }
                }
            }
        });
        match self.timers.get_mut(key) {
            Some(mut timer) if timer.generation == generation => timer.handle = Some(handle),
            _ => handle.abort(),
        }
    }

    pub(crate) fn cancel_expiry(&self, key: &str) {
        if let Some((_, timer)) = self.timers.remove(key)
            && let Some(handle) = timer.handle
        {
            handle.abort();
        }
    }

    pub(crate) fn cancel_all_timers(&self) {
        let keys: Vec<String> = self.timers.iter().map(|timer| timer.key().clone()).collect();
        for key in keys {
            self.cancel_expiry(&key);
        }
    }
}

// ============================================================================
// Store facade
// ============================================================================

/// Cache storage shared by multiple processes.
pub struct DistributedStore {
    shared: Arc<StoreShared>,
}

impl DistributedStore {
    pub fn new(backend: Arc<dyn Backend>, config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                backend,
                config,
                timers: DashMap::new(),
                timer_generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn backend_kind(&self) -> &'static str {
        self.shared.backend.kind()
    }

    /// Store a fully-buffered response.
    ///
    /// Returns the stored entry, or `None` when the status filter
    /// rejects the response.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn add(
        &self,
        key: &str,
        payload: ResponsePayload,
        ttl_ms: u64,
        group: Option<String>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        if !self.shared.config.status_codes.allows(payload.status) {
            debug!(source = SOURCE, key, status = payload.status, "status rejected by filter");
            return Ok(None);
        }
        let encoding = payload.body.encoding();
        let entry = CacheEntry {
            key: key.to_string(),
            status: payload.status,
            headers: filter_headers(payload.headers, &self.shared.config),
            body: EntryBody::Inline(payload.body.into_bytes()),
            encoding,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
            duration_ms: ttl_ms,
            group: group.clone(),
        };
        let fields = to_fields(&entry)?;

        let prefix = &self.shared.config.key_prefix;
        let entry_key = keys::entry_key(prefix, key);
        let previous_group = self.entry_group(&entry_key).await?;
        // Delete first: HSET merges fields, and a leftover body or
        // token field from the previous entry must not survive.
        let mut batch = Batch::new()
            .delete(vec![entry_key.clone()])
            .hash_set(entry_key.clone(), fields)
            .expire_ms(entry_key, ttl_ms);
        if let Some(previous) =
            previous_group.filter(|previous| group.as_deref() != Some(previous.as_str()))
        {
            // A replaced entry takes its old group membership with it.
            batch = batch.set_remove(keys::group_key(prefix, &previous), key);
        }
        if let Some(group) = &group {
            batch = batch.set_add(keys::group_key(prefix, group), key);
        }
        self.shared.backend.apply(batch).await?;
        self.shared.schedule_expiry(key, ttl_ms, group.clone());
        debug!(source = SOURCE, key, ttl_ms, group = group.as_deref(), "stored entry");
        Ok(Some(entry))
    }

    /// Look up a key, applying serve-time policy.
    ///
    /// A stored value that fails to decode is evicted and reported as
    /// a miss rather than an error.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get(
        &self,
        key: &str,
        if_none_match: Option<&str>,
    ) -> Result<Option<CacheHit>, CacheError> {
        let entry_key = keys::entry_key(&self.shared.config.key_prefix, key);
        let fields = self.shared.backend.hash_get_all(&entry_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        if matches!(self.shared.backend.ttl_ms(&entry_key).await?, KeyTtl::Missing) {
            return Ok(None);
        }

        let entry = match from_fields(key, &fields) {
            Ok(entry) => entry,
            Err(err) => {
                counter!(METRIC_MALFORMED_ENTRY).increment(1);
                warn!(source = SOURCE, key, error = %err, "evicting malformed entry");
                if let Err(err) = self.shared.backend.delete(&[entry_key]).await {
                    debug!(source = SOURCE, key, error = %err, "eviction failed");
                }
                return Ok(None);
            }
        };

        let plan = plan_serve(&entry, self.backend_kind(), if_none_match);
        Ok(Some(self.hit_from(entry, plan)))
    }

    fn hit_from(&self, entry: CacheEntry, plan: ServePlan) -> CacheHit {
        match plan {
            ServePlan::NotModified(headers) => CacheHit {
                status: 304,
                headers,
                encoding: entry.encoding,
                body: CachedBody::Empty,
            },
            ServePlan::Full(headers) => {
                let body = match entry.body {
                    EntryBody::Inline(bytes) => CachedBody::Inline(bytes),
                    EntryBody::Token(token) => CachedBody::Streamed(TransferReader::new(
                        self.shared.backend.clone(),
                        keys::data_key(&self.shared.config.key_prefix, &token, &entry.key),
                        self.shared.config.read_chunk_non_zero().get(),
                    )),
                };
                CacheHit {
                    status: entry.status,
                    headers,
                    encoding: entry.encoding,
                    body,
                }
            }
        }
    }

    /// Open a streaming writer for a key.
    pub async fn open_writer(
        &self,
        key: &str,
        group: Option<String>,
        ttl_ms: u64,
    ) -> TransferWriter {
        TransferWriter::open(Arc::clone(&self.shared), key, group, ttl_ms).await
    }

    /// Clear a group by name, or a single key when no group matches.
    ///
    /// Group names take precedence. The returned count is cleared
    /// entries, not touched keys.
    #[instrument(skip(self))]
    pub async fn clear(&self, target: &str) -> Result<u64, CacheError> {
        let members = self.group_members(target).await?;
        if !members.is_empty() {
            return self.clear_group(target, members).await;
        }
        self.clear_key(target).await
    }

    /// Sorted live members of a group marker; empty when the group is
    /// unknown. Members whose entry the backend has already evicted are
    /// dropped from the set on the way out.
    pub async fn group_members(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let prefix = &self.shared.config.key_prefix;
        let marker = keys::group_key(prefix, name);
        let mut live = Vec::new();
        let mut dead = Vec::new();
        for member in self.shared.backend.set_members(&marker).await? {
            let entry_key = keys::entry_key(prefix, &member);
            match self.shared.backend.ttl_ms(&entry_key).await? {
                KeyTtl::Missing => dead.push(member),
                KeyTtl::Unbounded | KeyTtl::Remaining(_) => live.push(member),
            }
        }
        if !dead.is_empty() {
            let mut prune = Batch::new();
            for member in dead {
                prune = prune.set_remove(marker.clone(), member);
            }
            if let Err(err) = self.shared.backend.apply(prune).await {
                debug!(source = SOURCE, group = name, error = %err, "could not prune dead members");
            }
        }
        live.sort();
        Ok(live)
    }

    async fn clear_group(&self, name: &str, members: Vec<String>) -> Result<u64, CacheError> {
        let prefix = &self.shared.config.key_prefix;
        let mut batch = Batch::new();
        let mut doomed = vec![keys::group_key(prefix, name)];
        for member in &members {
            let entry_key = keys::entry_key(prefix, member);
            if let Some(token) = self.entry_token(&entry_key).await? {
                batch = batch.expire_ms(keys::data_key(prefix, &token, member), 0);
            }
            doomed.push(entry_key);
            doomed.push(keys::lock_key(prefix, member));
        }
        batch = batch.delete(doomed);
        self.shared.backend.apply(batch).await?;

        for member in &members {
            self.shared.cancel_expiry(member);
        }
        let count = members.len() as u64;
        counter!(METRIC_CLEARED).increment(count);
        debug!(source = SOURCE, group = name, count, "cleared group");
        Ok(count)
    }

    async fn clear_key(&self, key: &str) -> Result<u64, CacheError> {
        let prefix = &self.shared.config.key_prefix;
        let entry_key = keys::entry_key(prefix, key);
        let fields = self.shared.backend.hash_get_all(&entry_key).await?;
        let existed = !fields.is_empty();

        let mut batch = Batch::new();
        if let Some(token) = fields
            .get(FIELD_TOKEN)
            .and_then(|raw| std::str::from_utf8(raw).ok())
        {
            batch = batch.expire_ms(keys::data_key(prefix, token, key), 0);
        }
        if let Some(group) = fields
            .get(FIELD_GROUP)
            .and_then(|raw| std::str::from_utf8(raw).ok())
        {
            batch = batch.set_remove(keys::group_key(prefix, group), key);
        }
        batch = batch.delete(vec![entry_key, keys::lock_key(prefix, key)]);
        self.shared.backend.apply(batch).await?;
        self.shared.cancel_expiry(key);

        if existed {
            counter!(METRIC_CLEARED).increment(1);
            debug!(source = SOURCE, key, "cleared entry");
        }
        Ok(u64::from(existed))
    }

    /// Clear every entry under this cache's prefix.
    ///
    /// With an exclusive store and no prefix this is a wholesale flush;
    /// otherwise keys are collected first and deleted afterwards, since
    /// deleting under a live cursor can skip keys.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<u64, CacheError> {
        let config = &self.shared.config;
        if config.assume_exclusive_store && config.key_prefix.is_empty() {
            let count = self.shared.backend.key_count().await?;
            self.shared.backend.flush_all().await?;
            self.shared.cancel_all_timers();
            counter!(METRIC_CLEARED).increment(count);
            debug!(source = SOURCE, count, "flushed exclusive store");
            return Ok(count);
        }

        let pattern = keys::scan_pattern(&config.key_prefix);
        let page_size = config.scan_page_non_zero().get();
        let mut cursor = 0;
        let mut all_keys = Vec::new();
        loop {
            let (next, page) = self
                .shared
                .backend
                .scan(cursor, &pattern, page_size)
                .await?;
            all_keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        all_keys.sort();
        all_keys.dedup();

        let cleared = all_keys
            .iter()
            .filter(|raw| matches!(keys::classify(&config.key_prefix, raw), StoreKey::Entry(_)))
            .count() as u64;
        for chunk in all_keys.chunks(page_size as usize) {
            self.shared.backend.delete(chunk).await?;
        }
        self.shared.cancel_all_timers();

        counter!(METRIC_CLEARED).increment(cleared);
        debug!(source = SOURCE, cleared, "cleared all entries");
        Ok(cleared)
    }

    /// Snapshot of stored keys and group membership, sorted for stable
    /// output. Lock and data keys never appear.
    pub async fn index(&self) -> Result<CacheIndex, CacheError> {
        let config = &self.shared.config;
        let pattern = keys::scan_pattern(&config.key_prefix);
        let page_size = config.scan_page_non_zero().get();
        let mut cursor = 0;
        let mut entries = Vec::new();
        let mut group_names = Vec::new();
        loop {
            let (next, page) = self
                .shared
                .backend
                .scan(cursor, &pattern, page_size)
                .await?;
            for raw in page {
                match keys::classify(&config.key_prefix, &raw) {
                    StoreKey::Entry(key) => entries.push(key),
                    StoreKey::Group(name) => group_names.push(name),
                    StoreKey::Auxiliary | StoreKey::Foreign => {}
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        entries.sort();
        entries.dedup();
        group_names.sort();
        group_names.dedup();

        let mut index = CacheIndex::new();
        index.all = entries;
        for name in group_names {
            let mut members = self.group_members(&name).await?;
            // A member must also appear in `all`; the scanned snapshot
            // is the view of record here.
            members.retain(|member| index.all.binary_search(member).is_ok());
            if !members.is_empty() {
                index.groups.insert(name, members);
            }
        }
        Ok(index)
    }

    async fn entry_token(&self, entry_key: &str) -> Result<Option<String>, CacheError> {
        let raw = self.shared.backend.hash_get(entry_key, FIELD_TOKEN).await?;
        Ok(raw.and_then(|bytes| String::from_utf8(bytes).ok()))
    }

    async fn entry_group(&self, entry_key: &str) -> Result<Option<String>, CacheError> {
        let raw = self.shared.backend.hash_get(entry_key, FIELD_GROUP).await?;
        Ok(raw.and_then(|bytes| String::from_utf8(bytes).ok()))
    }
}

impl Drop for DistributedStore {
    fn drop(&mut self) {
        // Timer tasks hold the shared state alive; without this a
        // dropped store leaks sleeping tasks until their ttl fires.
        self.shared.cancel_all_timers();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::backend::MemoryBackend;
    use crate::entry::BodyChunk;

    use super::*;

    fn store_with(config: CacheConfig) -> (DistributedStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = DistributedStore::new(backend.clone(), config);
        (store, backend)
    }

    fn sample_payload(body: &str) -> ResponsePayload {
        ResponsePayload {
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: BodyChunk::from(body),
        }
    }

    #[tokio::test]
    async fn add_then_get_serves_the_entry() {
        let (store, _) = store_with(CacheConfig::default());
        store
            .add("/a", sample_payload("hello"), 60_000, None)
            .await
            .expect("add")
            .expect("stored");

        let hit = store.get("/a", None).await.expect("get").expect("hit");
        assert_eq!(hit.status, 200);
        assert!(matches!(hit.body, CachedBody::Inline(ref bytes) if &bytes[..] == b"hello"));
        assert!(
            hit.headers
                .iter()
                .any(|(name, value)| name == "risposta-store" && value == "memory")
        );
    }

    #[tokio::test]
    async fn status_filter_rejects_at_add() {
        let config = CacheConfig {
            status_codes: crate::config::StatusCodeFilter {
                include: vec![200],
                exclude: Vec::new(),
            },
            ..Default::default()
        };
        let (store, backend) = store_with(config);
        let payload = ResponsePayload {
            status: 404,
            ..sample_payload("missing")
        };
        let stored = store.add("/a", payload, 60_000, None).await.expect("add");
        assert!(stored.is_none());
        assert_eq!(backend.key_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn backend_ttl_evicts_entries() {
        let (store, _) = store_with(CacheConfig::default());
        store
            .add("/a", sample_payload("short-lived"), 30, None)
            .await
            .expect("add");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get("/a", None).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn dropping_the_store_stops_expiry_timers() {
        let backend = Arc::new(MemoryBackend::new());
        let store = DistributedStore::new(backend.clone(), CacheConfig::default());
        store
            .add("/a", sample_payload("a"), 3_600_000, None)
            .await
            .expect("add");

        drop(store);
        // With the timer aborted, only this test's clone still
        // references the backend.
        for _ in 0..50 {
            if Arc::strong_count(&backend) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(&backend), 1);
    }

    #[tokio::test]
    async fn reput_replaces_stale_fields() {
        let (store, _) = store_with(CacheConfig::default());

        // First a streamed entry, then a buffered one under the same key.
        let mut writer = store.open_writer("/a", None, 60_000).await;
        writer.write("streamed body").await;
        writer
            .commit(200, vec![])
            .await
            .expect("commit")
            .expect("stored");

        store
            .add("/a", sample_payload("inline body"), 60_000, None)
            .await
            .expect("add");

        let hit = store.get("/a", None).await.expect("get").expect("hit");
        assert!(matches!(hit.body, CachedBody::Inline(ref bytes) if &bytes[..] == b"inline body"));
    }

    #[tokio::test]
    async fn reput_moves_group_membership() {
        let (store, _) = store_with(CacheConfig::default());
        store
            .add("/k", sample_payload("v1"), 60_000, Some("g1".to_string()))
            .await
            .expect("add");
        store
            .add("/k", sample_payload("v2"), 60_000, Some("g2".to_string()))
            .await
            .expect("re-add");

        assert!(store.group_members("g1").await.expect("members").is_empty());
        assert_eq!(
            store.group_members("g2").await.expect("members"),
            vec!["/k".to_string()]
        );
        // The abandoned group no longer reaches the live entry.
        assert_eq!(store.clear("g1").await.expect("clear"), 0);
        assert!(store.get("/k", None).await.expect("get").is_some());

        // Streamed commits drop prior membership the same way.
        let mut writer = store.open_writer("/k", Some("g3".to_string()), 60_000).await;
        writer.write("v3").await;
        writer.commit(200, vec![]).await.expect("commit").expect("stored");
        assert!(store.group_members("g2").await.expect("members").is_empty());
        assert_eq!(
            store.group_members("g3").await.expect("members"),
            vec!["/k".to_string()]
        );

        // Regrouping to no group at all clears the last membership.
        store
            .add("/k", sample_payload("v4"), 60_000, None)
            .await
            .expect("add");
        assert!(store.group_members("g3").await.expect("members").is_empty());
    }

    #[tokio::test]
    async fn etag_match_short_circuits() {
        let (store, _) = store_with(CacheConfig::default());
        let payload = ResponsePayload {
            status: 200,
            headers: vec![("etag".to_string(), "\"v1\"".to_string())],
            body: BodyChunk::from("body"),
        };
        store.add("/a", payload, 60_000, None).await.expect("add");

        let hit = store
            .get("/a", Some("\"v1\""))
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.status, 304);
        assert!(matches!(hit.body, CachedBody::Empty));

        let hit = store
            .get("/a", Some("\"v2\""))
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.status, 200);
    }

    #[tokio::test]
    async fn malformed_entry_is_evicted_and_missed() {
        let (store, backend) = store_with(CacheConfig::default());
        store
            .add("/a", sample_payload("ok"), 60_000, None)
            .await
            .expect("add");

        backend
            .apply(Batch::new().hash_set("/a", vec![("status".to_string(), b"banana".to_vec())]))
            .await
            .expect("corrupt the entry");

        assert!(store.get("/a", None).await.expect("get").is_none());
        assert!(
            backend
                .hash_get_all("/a")
                .await
                .expect("read back")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn streamed_round_trip() {
        let (store, _) = store_with(CacheConfig {
            read_chunk_bytes: 4,
            ..Default::default()
        });

        let mut writer = store.open_writer("/big", None, 60_000).await;
        assert!(!writer.is_discard());
        writer.write("abcdef").await;
        writer.write(Bytes::from_static(b"ghij")).await;
        writer.write("").await;
        let entry = writer
            .commit(200, vec![("content-type".to_string(), "text/plain".to_string())])
            .await
            .expect("commit")
            .expect("stored");
        assert!(matches!(entry.body, EntryBody::Token(_)));

        let hit = store.get("/big", None).await.expect("get").expect("hit");
        let CachedBody::Streamed(reader) = hit.body else {
            panic!("expected a streamed body");
        };
        let body = reader.read_to_end().await.expect("drain");
        assert_eq!(&body[..], b"abcdefghij");
    }

    #[tokio::test]
    async fn second_writer_discards_while_first_is_active() {
        let (store, _) = store_with(CacheConfig::default());

        let mut first = store.open_writer("/a", None, 60_000).await;
        let mut second = store.open_writer("/a", None, 60_000).await;
        assert!(!first.is_discard());
        assert!(second.is_discard());

        // The discard writer accepts calls and stores nothing.
        second.write("loser body").await;
        assert!(second.commit(200, vec![]).await.expect("commit").is_none());

        first.write("winner body").await;
        first.commit(200, vec![]).await.expect("commit").expect("stored");

        let hit = store.get("/a", None).await.expect("get").expect("hit");
        let CachedBody::Streamed(reader) = hit.body else {
            panic!("expected a streamed body");
        };
        assert_eq!(&reader.read_to_end().await.expect("drain")[..], b"winner body");
    }

    #[tokio::test]
    async fn writer_lock_frees_after_commit() {
        let (store, _) = store_with(CacheConfig::default());
        let mut writer = store.open_writer("/a", None, 60_000).await;
        writer.write("first").await;
        writer.commit(200, vec![]).await.expect("commit");

        let next = store.open_writer("/a", None, 60_000).await;
        assert!(!next.is_discard());
    }

    #[tokio::test]
    async fn aborted_transfer_leaves_nothing() {
        let (store, backend) = store_with(CacheConfig::default());
        let mut writer = store.open_writer("/a", None, 60_000).await;
        writer.write("partial").await;
        writer.abort().await;

        assert!(store.get("/a", None).await.expect("get").is_none());
        assert_eq!(backend.key_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn clear_prefers_group_over_key() {
        let (store, _) = store_with(CacheConfig::default());
        store
            .add("/m/1", sample_payload("one"), 60_000, Some("movies".to_string()))
            .await
            .expect("add");
        store
            .add("/m/2", sample_payload("two"), 60_000, Some("movies".to_string()))
            .await
            .expect("add");
        store
            .add("movies", sample_payload("entry named like the group"), 60_000, None)
            .await
            .expect("add");

        let cleared = store.clear("movies").await.expect("clear");
        assert_eq!(cleared, 2);
        assert!(store.get("/m/1", None).await.expect("get").is_none());
        assert!(store.get("/m/2", None).await.expect("get").is_none());
        // The identically-named entry was not the target.
        assert!(store.get("movies", None).await.expect("get").is_some());

        let cleared = store.clear("movies").await.expect("clear again");
        assert_eq!(cleared, 1);
        assert!(store.get("movies", None).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn clearing_a_key_prunes_its_group_membership() {
        let (store, backend) = store_with(CacheConfig::default());
        store
            .add("/m/1", sample_payload("one"), 60_000, Some("movies".to_string()))
            .await
            .expect("add");
        store
            .add("/m/2", sample_payload("two"), 60_000, Some("movies".to_string()))
            .await
            .expect("add");

        assert_eq!(store.clear("/m/1").await.expect("clear"), 1);
        assert_eq!(
            store.group_members("movies").await.expect("members"),
            vec!["/m/2".to_string()]
        );

        // Clearing the last member drops the marker entirely.
        assert_eq!(store.clear("/m/2").await.expect("clear"), 1);
        assert!(store.group_members("movies").await.expect("members").is_empty());
        assert_eq!(backend.key_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn dead_members_are_pruned_from_their_group() {
        let (store, backend) = store_with(CacheConfig::default());
        store
            .add("/m/1", sample_payload("one"), 60_000, Some("movies".to_string()))
            .await
            .expect("add");
        // A member whose entry the backend already evicted.
        backend
            .apply(Batch::new().set_add("group:movies", "/m/ghost"))
            .await
            .expect("seed dead member");

        assert_eq!(
            store.group_members("movies").await.expect("members"),
            vec!["/m/1".to_string()]
        );
        // The dead member is gone from the set itself, not just the view.
        assert_eq!(
            backend.set_members("group:movies").await.expect("raw members"),
            vec!["/m/1".to_string()]
        );

        let index = store.index().await.expect("index");
        assert_eq!(index.all, vec!["/m/1"]);
        assert_eq!(index.group("movies"), Some(&["/m/1".to_string()][..]));
    }

    #[tokio::test]
    async fn group_clear_removes_streamed_blobs() {
        let (store, backend) = store_with(CacheConfig::default());
        let mut writer = store
            .open_writer("/big", Some("movies".to_string()), 60_000)
            .await;
        writer.write("streamed").await;
        writer.commit(200, vec![]).await.expect("commit");

        assert_eq!(store.clear("movies").await.expect("clear"), 1);
        assert_eq!(backend.key_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn clear_of_unknown_target_clears_nothing() {
        let (store, _) = store_with(CacheConfig::default());
        assert_eq!(store.clear("/nope").await.expect("clear"), 0);
    }

    #[tokio::test]
    async fn clear_all_counts_only_entries() {
        let (store, backend) = store_with(CacheConfig {
            key_prefix: "app:".to_string(),
            scan_page_size: 2,
            ..Default::default()
        });
        store
            .add("/a", sample_payload("a"), 60_000, Some("g".to_string()))
            .await
            .expect("add");
        store
            .add("/b", sample_payload("b"), 60_000, None)
            .await
            .expect("add");
        store
            .add("/c", sample_payload("c"), 60_000, None)
            .await
            .expect("add");
        backend
            .append("other:/x", b"foreign data")
            .await
            .expect("seed foreign key");

        let cleared = store.clear_all().await.expect("clear all");
        assert_eq!(cleared, 3);
        assert!(store.get("/a", None).await.expect("get").is_none());
        assert_eq!(
            backend.strlen("other:/x").await.expect("foreign intact"),
            "foreign data".len() as u64
        );
    }

    #[tokio::test]
    async fn exclusive_store_clear_flushes() {
        let (store, backend) = store_with(CacheConfig {
            assume_exclusive_store: true,
            ..Default::default()
        });
        store
            .add("/a", sample_payload("a"), 60_000, None)
            .await
            .expect("add");

        let cleared = store.clear_all().await.expect("clear all");
        assert_eq!(cleared, 1);
        assert_eq!(backend.key_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn index_reports_entries_and_groups_sorted() {
        let (store, _) = store_with(CacheConfig {
            key_prefix: "app:".to_string(),
            scan_page_size: 2,
            ..Default::default()
        });
        store
            .add("/b", sample_payload("b"), 60_000, Some("movies".to_string()))
            .await
            .expect("add");
        store
            .add("/a", sample_payload("a"), 60_000, Some("movies".to_string()))
            .await
            .expect("add");

        let mut writer = store.open_writer("/big", None, 60_000).await;
        writer.write("blob").await;
        writer.commit(200, vec![]).await.expect("commit");

        let index = store.index().await.expect("index");
        assert_eq!(index.all, vec!["/a", "/b", "/big"]);
        assert_eq!(
            index.group("movies"),
            Some(&["/a".to_string(), "/b".to_string()][..])
        );
    }

    #[tokio::test]
    async fn unavailable_backend_surfaces_as_error() {
        let (store, backend) = store_with(CacheConfig::default());
        store
            .add("/a", sample_payload("a"), 60_000, None)
            .await
            .expect("add");

        backend.set_available(false);
        let err = store.get("/a", None).await.expect_err("offline");
        assert!(matches!(err, CacheError::BackendUnavailable { .. }));

        // A writer opened against a dead backend degrades to discard.
        let writer = store.open_writer("/b", None, 60_000).await;
        assert!(writer.is_discard());
    }
}
