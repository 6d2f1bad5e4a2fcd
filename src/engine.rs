//! Engine facade.
//!
//! One `CacheEngine` fronts either a process-local TTL store or a
//! distributed store on a shared backend, behind the same operations.
//! Request-path calls fail open: a broken backend turns lookups into
//! misses and stores into no-ops, with the fault logged and counted.
//! Operator calls (clears, index reads) fail loud instead.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use bytes::BytesMut;
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::CacheConfig;
use crate::distributed::DistributedStore;
use crate::duration::Ttl;
use crate::entry::{
    BodyChunk, CacheEntry, CacheHit, CachedBody, Encoding, EntryBody, ResponsePayload, ServePlan,
    filter_headers, plan_serve,
};
use crate::error::CacheError;
use crate::index::CacheIndex;
use crate::performance::{PerformanceReport, Tracker};
use crate::store::{ExpireHook, LocalStore};
use crate::sync::{mutex_lock, rw_read, rw_write};
use crate::transfer::TransferWriter;

const SOURCE: &str = "engine";
const METRIC_HIT: &str = "risposta_hit_total";
const METRIC_MISS: &str = "risposta_miss_total";
const METRIC_BACKEND_ERROR: &str = "risposta_backend_error_total";
const METRIC_CLEARED: &str = "risposta_cleared_total";
const METRIC_LOOKUP_MS: &str = "risposta_lookup_ms";

/// Store kind reported for the local mode in protocol headers.
const LOCAL_STORE_KIND: &str = "memory";

// ============================================================================
// Engine
// ============================================================================

enum Mode {
    Local(LocalMode),
    Distributed(DistributedStore),
}

#[derive(Clone)]
struct LocalMode {
    store: Arc<LocalStore>,
    index: Arc<RwLock<CacheIndex>>,
}

/// Response-cache engine.
pub struct CacheEngine {
    config: CacheConfig,
    mode: Mode,
    tracker: Arc<Tracker>,
}

impl CacheEngine {
    /// Engine backed by process memory.
    pub fn local(config: CacheConfig, registry: Option<&EngineRegistry>) -> Self {
        let tracker = Arc::new(Tracker::new(config.track_performance));
        if let Some(registry) = registry {
            registry.register(&config.name, Arc::clone(&tracker));
        }
        info!(source = SOURCE, name = %config.name, mode = "local", "cache engine ready");
        Self {
            mode: Mode::Local(LocalMode {
                store: Arc::new(LocalStore::new()),
                index: Arc::new(RwLock::new(CacheIndex::new())),
            }),
            config,
            tracker,
        }
    }

    /// Engine backed by a shared store.
    pub fn distributed(
        config: CacheConfig,
        backend: Arc<dyn Backend>,
        registry: Option<&EngineRegistry>,
    ) -> Self {
        let tracker = Arc::new(Tracker::new(config.track_performance));
        if let Some(registry) = registry {
            registry.register(&config.name, Arc::clone(&tracker));
        }
        info!(
            source = SOURCE,
            name = %config.name,
            mode = "distributed",
            backend = backend.kind(),
            "cache engine ready"
        );
        Self {
            mode: Mode::Distributed(DistributedStore::new(backend, config.clone())),
            config,
            tracker,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a key.
    pub async fn get(&self, key: &str) -> Option<CacheHit> {
        self.get_conditional(key, None).await
    }

    /// Look up a key, honoring a conditional `if-none-match` value.
    ///
    /// Never fails: backend faults are logged, counted, and reported as
    /// misses so the caller regenerates the response.
    pub async fn get_conditional(&self, key: &str, if_none_match: Option<&str>) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }
        let started_at = Instant::now();
        let (label, outcome) = match &self.mode {
            Mode::Local(local) => ("local", Ok(local.lookup(key, if_none_match))),
            Mode::Distributed(store) => ("distributed", store.get(key, if_none_match).await),
        };
        let hit = match outcome {
            Ok(hit) => hit,
            Err(err) => {
                counter!(METRIC_BACKEND_ERROR).increment(1);
                warn!(source = SOURCE, key, error = %err, "lookup failed, treating as miss");
                None
            }
        };
        histogram!(METRIC_LOOKUP_MS, "store" => label)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        match &hit {
            Some(_) => {
                counter!(METRIC_HIT, "store" => label).increment(1);
                self.tracker.hit(key);
                debug!(source = SOURCE, store = label, key, outcome = "hit", "cache lookup");
            }
            None => {
                counter!(METRIC_MISS, "store" => label).increment(1);
                self.tracker.miss(key);
                debug!(source = SOURCE, store = label, key, outcome = "miss", "cache lookup");
            }
        }
        hit
    }

    /// Store a fully-buffered response under `key`.
    ///
    /// `ttl` accepts raw milliseconds, the human grammar understood by
    /// [`crate::parse_duration`], or [`Ttl::Default`] for the configured
    /// default. Returns the stored entry, or `None` when disabled,
    /// filtered, or failed.
    pub async fn put(
        &self,
        key: &str,
        payload: ResponsePayload,
        ttl: Ttl,
        group: Option<String>,
    ) -> Option<CacheEntry> {
        if !self.config.enabled {
            return None;
        }
        let ttl_ms = self.config.resolve_ttl(&ttl);
        match &self.mode {
            Mode::Local(local) => local.store_payload(&self.config, key, payload, ttl_ms, group),
            Mode::Distributed(store) => match store.add(key, payload, ttl_ms, group).await {
                Ok(stored) => stored,
                Err(err) => {
                    counter!(METRIC_BACKEND_ERROR).increment(1);
                    warn!(source = SOURCE, key, error = %err, "store failed, response not cached");
                    None
                }
            },
        }
    }

    /// Open a streaming writer for `key`.
    ///
    /// Local mode buffers in memory and stores at commit; distributed
    /// mode streams chunks to the shared store under a population lock.
    pub async fn open_writer(&self, key: &str, ttl: Ttl, group: Option<String>) -> CacheWriter {
        if !self.config.enabled {
            return CacheWriter::Disabled;
        }
        let ttl_ms = self.config.resolve_ttl(&ttl);
        match &self.mode {
            Mode::Local(local) => CacheWriter::Local(LocalWriter {
                mode: local.clone(),
                config: self.config.clone(),
                key: key.to_string(),
                ttl_ms,
                group,
                buffer: BytesMut::new(),
                encoding: None,
            }),
            Mode::Distributed(store) => {
                CacheWriter::Distributed(store.open_writer(key, group, ttl_ms).await)
            }
        }
    }

    /// Clear a group by name, or a single key when no group matches.
    pub async fn delete(&self, target: &str) -> Result<u64, CacheError> {
        if !self.config.enabled {
            return Ok(0);
        }
        match &self.mode {
            Mode::Local(local) => Ok(local.clear_target(target)),
            Mode::Distributed(store) => store.clear(target).await,
        }
    }

    /// Clear everything this cache stored.
    pub async fn clear_all(&self) -> Result<u64, CacheError> {
        if !self.config.enabled {
            return Ok(0);
        }
        match &self.mode {
            Mode::Local(local) => {
                rw_write(&local.index, SOURCE, "clear_all").reset();
                let cleared = local.store.clear() as u64;
                counter!(METRIC_CLEARED).increment(cleared);
                debug!(source = SOURCE, cleared, "cleared all entries");
                Ok(cleared)
            }
            Mode::Distributed(store) => store.clear_all().await,
        }
    }

    /// Snapshot of cached keys and groups.
    pub async fn get_index(&self) -> Result<CacheIndex, CacheError> {
        if !self.config.enabled {
            return Ok(CacheIndex::new());
        }
        match &self.mode {
            Mode::Local(local) => Ok(rw_read(&local.index, SOURCE, "get_index").clone()),
            Mode::Distributed(store) => store.index().await,
        }
    }

    /// Members of one group; empty when unknown.
    pub async fn get_group(&self, name: &str) -> Result<Vec<String>, CacheError> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        match &self.mode {
            Mode::Local(local) => Ok(rw_read(&local.index, SOURCE, "get_group")
                .group(name)
                .map(<[String]>::to_vec)
                .unwrap_or_default()),
            Mode::Distributed(store) => store.group_members(name).await,
        }
    }

    /// Hit-rate statistics; empty unless performance tracking is on.
    pub fn get_performance(&self) -> Vec<PerformanceReport> {
        self.tracker.report().into_iter().collect()
    }
}

impl LocalMode {
    fn lookup(&self, key: &str, if_none_match: Option<&str>) -> Option<CacheHit> {
        let entry = self.store.get(key)?;
        let plan = plan_serve(&entry, LOCAL_STORE_KIND, if_none_match);
        Some(match plan {
            ServePlan::NotModified(headers) => CacheHit {
                status: 304,
                headers,
                encoding: entry.encoding,
                body: CachedBody::Empty,
            },
            ServePlan::Full(headers) => CacheHit {
                status: entry.status,
                headers,
                encoding: entry.encoding,
                body: match entry.body {
                    EntryBody::Inline(bytes) => CachedBody::Inline(bytes),
                    // Local entries are always stored inline.
                    EntryBody::Token(_) => CachedBody::Empty,
                },
            },
        })
    }

    fn store_payload(
        &self,
        config: &CacheConfig,
        key: &str,
        payload: ResponsePayload,
        ttl_ms: u64,
        group: Option<String>,
    ) -> Option<CacheEntry> {
        if !config.status_codes.allows(payload.status) {
            debug!(source = SOURCE, key, status = payload.status, "status rejected by filter");
            return None;
        }
        let encoding = payload.body.encoding();
        let entry = CacheEntry {
            key: key.to_string(),
            status: payload.status,
            headers: filter_headers(payload.headers, config),
            body: EntryBody::Inline(payload.body.into_bytes()),
            encoding,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
            duration_ms: ttl_ms,
            group,
        };
        Some(self.store_entry(entry, ttl_ms))
    }

    fn store_entry(&self, entry: CacheEntry, ttl_ms: u64) -> CacheEntry {
        rw_write(&self.index, SOURCE, "store_entry").insert(&entry.key, entry.group.as_deref());

        // Expiry prunes the index through the hook, keeping both views
        // in step without a sweeper.
        let index = Arc::clone(&self.index);
        let hook: ExpireHook = Box::new(move |expired: CacheEntry| {
            rw_write(&index, SOURCE, "expire_hook").remove_key(&expired.key);
        });
        self.store.add(entry, ttl_ms, Some(hook))
    }

    fn clear_target(&self, target: &str) -> u64 {
        let members = {
            let mut index = rw_write(&self.index, SOURCE, "clear_target");
            let members = index.remove_group(target);
            if !members.is_empty() {
                members
            } else if index.remove_key(target) {
                vec![target.to_string()]
            } else {
                Vec::new()
            }
        };
        let mut cleared = 0;
        for key in &members {
            if self.store.delete(key).is_some() {
                cleared += 1;
            }
        }
        counter!(METRIC_CLEARED).increment(cleared);
        debug!(source = SOURCE, target, cleared, "cleared target");
        cleared
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Streaming writer handed out by [`CacheEngine::open_writer`].
pub enum CacheWriter {
    Local(LocalWriter),
    Distributed(TransferWriter),
    /// The engine is disabled; accepts every call and stores nothing.
    Disabled,
}

/// Buffering writer for the local mode.
pub struct LocalWriter {
    mode: LocalMode,
    config: CacheConfig,
    key: String,
    ttl_ms: u64,
    group: Option<String>,
    buffer: BytesMut,
    encoding: Option<Encoding>,
}

impl CacheWriter {
    /// Append one body chunk; empty chunks are skipped.
    pub async fn write(&mut self, chunk: impl Into<BodyChunk>) {
        match self {
            Self::Local(writer) => writer.write(chunk.into()),
            Self::Distributed(writer) => writer.write(chunk).await,
            Self::Disabled => {}
        }
    }

    /// Seal the response into the cache.
    ///
    /// Returns the stored entry, or `None` when nothing was stored
    /// (disabled engine, discarded transfer, status filter, or fault).
    pub async fn commit(self, status: u16, headers: Vec<(String, String)>) -> Option<CacheEntry> {
        match self {
            Self::Local(writer) => writer.commit(status, headers),
            Self::Distributed(writer) => match writer.commit(status, headers).await {
                Ok(stored) => stored,
                Err(err) => {
                    counter!(METRIC_BACKEND_ERROR).increment(1);
                    warn!(source = SOURCE, error = %err, "commit failed, response not cached");
                    None
                }
            },
            Self::Disabled => None,
        }
    }

    /// Abandon the response without storing it.
    pub async fn abort(self) {
        if let Self::Distributed(writer) = self {
            writer.abort().await;
        }
    }

    /// True when chunks are actually being captured.
    pub fn is_recording(&self) -> bool {
        match self {
            Self::Local(_) => true,
            Self::Distributed(writer) => !writer.is_discard(),
            Self::Disabled => false,
        }
    }
}

impl LocalWriter {
    fn write(&mut self, chunk: BodyChunk) {
        if chunk.is_empty() {
            return;
        }
        if self.encoding.is_none() {
            self.encoding = Some(chunk.encoding());
        }
        self.buffer.extend_from_slice(chunk.as_bytes());
    }

    fn commit(self, status: u16, headers: Vec<(String, String)>) -> Option<CacheEntry> {
        if !self.config.status_codes.allows(status) {
            debug!(
                source = SOURCE,
                key = %self.key,
                status,
                "status rejected by filter"
            );
            return None;
        }
        let entry = CacheEntry {
            key: self.key.clone(),
            status,
            headers: filter_headers(headers, &self.config),
            body: EntryBody::Inline(self.buffer.freeze()),
            encoding: self.encoding.unwrap_or_default(),
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
            duration_ms: self.ttl_ms,
            group: self.group.clone(),
        };
        Some(self.mode.store_entry(entry, self.ttl_ms))
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Keeps track of named engines for cross-cache reporting.
pub struct EngineRegistry {
    engines: Mutex<Vec<(String, Arc<Tracker>)>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, name: &str, tracker: Arc<Tracker>) {
        let mut engines = mutex_lock(&self.engines, SOURCE, "register");
        if engines.iter().any(|(existing, _)| existing == name) {
            warn!(source = SOURCE, name, "duplicate cache name registered");
        }
        engines.push((name.to_string(), tracker));
    }

    /// Registered engine names, in registration order.
    pub fn names(&self) -> Vec<String> {
        mutex_lock(&self.engines, SOURCE, "names")
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// One report per engine with performance tracking enabled.
    pub fn performance(&self) -> Vec<PerformanceReport> {
        mutex_lock(&self.engines, SOURCE, "performance")
            .iter()
            .filter_map(|(_, tracker)| tracker.report())
            .collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.engines, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
