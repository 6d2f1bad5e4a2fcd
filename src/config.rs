//! Engine configuration.
//!
//! The embedding process deserializes [`CacheConfig`] from its own settings
//! file and hands it to `CacheEngine` at construction. Every engine instance
//! owns its config; nothing here is process-global.

use std::num::NonZeroU64;

use serde::Deserialize;

use crate::duration::Ttl;

// Default values for cache configuration
const DEFAULT_NAME: &str = "default";
const DEFAULT_DURATION_MS: u64 = 3_600_000;
const DEFAULT_LOCK_TTL_MS: u64 = 5_000;
const DEFAULT_READ_CHUNK_BYTES: u64 = 65_536;
const DEFAULT_RETENTION_PER_CHUNK_MS: u64 = 100;
const DEFAULT_RETENTION_BYTES_PER_SEC: u64 = 131_072;
const DEFAULT_TRANSFER_GUARD_MS: u64 = 900_000;
const DEFAULT_SCAN_PAGE_SIZE: u64 = 100;

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Logical cache name, used in logs and registry duplicate checks.
    pub name: String,
    /// Master switch; a disabled engine bypasses every operation.
    pub enabled: bool,
    /// TTL applied when a put does not carry its own duration.
    pub default_duration_ms: u64,
    /// Prefix prepended to every shared-store key.
    pub key_prefix: String,
    /// Header names dropped before a response is stored.
    pub header_denylist: Vec<String>,
    /// Status-code gate consulted before any commit.
    pub status_codes: StatusCodeFilter,
    /// Record hit/miss statistics.
    pub track_performance: bool,
    /// Initial population-lock TTL; renewal grants are multiples of this.
    pub lock_ttl_ms: u64,
    /// Ranged-read size for streamed bodies.
    pub read_chunk_bytes: u64,
    /// Blob retention model: latency allowance per written chunk.
    pub retention_per_chunk_ms: u64,
    /// Blob retention model: assumed slowest client download speed.
    pub retention_bytes_per_sec: u64,
    /// Provisional TTL armed on a body blob at first append, so an
    /// abandoned transfer cannot leak the blob.
    pub transfer_guard_ms: u64,
    /// Cursor page size for index enumeration and full clears.
    pub scan_page_size: u64,
    /// The shared store holds nothing but this cache's keys, allowing a
    /// wholesale flush instead of a scan on full clear. Only honored with
    /// an empty `key_prefix`.
    pub assume_exclusive_store: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            enabled: true,
            default_duration_ms: DEFAULT_DURATION_MS,
            key_prefix: String::new(),
            header_denylist: Vec::new(),
            status_codes: StatusCodeFilter::default(),
            track_performance: false,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            retention_per_chunk_ms: DEFAULT_RETENTION_PER_CHUNK_MS,
            retention_bytes_per_sec: DEFAULT_RETENTION_BYTES_PER_SEC,
            transfer_guard_ms: DEFAULT_TRANSFER_GUARD_MS,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            assume_exclusive_store: false,
        }
    }
}

impl CacheConfig {
    /// Resolve a TTL argument against the configured default.
    pub fn resolve_ttl(&self, ttl: &Ttl) -> u64 {
        ttl.resolve_ms(self.default_duration_ms)
    }

    /// Returns the lock TTL as NonZeroU64, clamping to 1 if zero.
    pub fn lock_ttl_non_zero(&self) -> NonZeroU64 {
        NonZeroU64::new(self.lock_ttl_ms).unwrap_or(NonZeroU64::MIN)
    }

    /// Returns the read chunk size as NonZeroU64, clamping to 1 if zero.
    pub fn read_chunk_non_zero(&self) -> NonZeroU64 {
        NonZeroU64::new(self.read_chunk_bytes).unwrap_or(NonZeroU64::MIN)
    }

    /// Returns the scan page size as NonZeroU64, clamping to 1 if zero.
    pub fn scan_page_non_zero(&self) -> NonZeroU64 {
        NonZeroU64::new(self.scan_page_size).unwrap_or(NonZeroU64::MIN)
    }

    pub(crate) fn denies_header(&self, name: &str) -> bool {
        self.header_denylist
            .iter()
            .any(|denied| denied.eq_ignore_ascii_case(name))
    }
}

/// Cacheability gate on response status codes.
///
/// `exclude` wins over `include`; an empty `include` admits every status
/// not excluded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatusCodeFilter {
    /// When non-empty, only these statuses are cacheable.
    pub include: Vec<u16>,
    /// Never cache these statuses.
    pub exclude: Vec<u16>,
}

impl StatusCodeFilter {
    pub fn allows(&self, status: u16) -> bool {
        if self.exclude.contains(&status) {
            return false;
        }
        if !self.include.is_empty() && !self.include.contains(&status) {
            return false;
        }
        true
    }
}
