//! Risposta Response Cache
//!
//! An embeddable HTTP response cache with two interchangeable stores
//! behind one engine surface:
//!
//! - **Local**: process-local entry map with per-entry expiration timers
//! - **Distributed**: entries in a shared Redis-style store, with
//!   cross-process invalidation, single-writer population locks, and
//!   chunked body streaming for large responses
//!
//! The host web layer decides what the cache key is, asks [`CacheEngine`]
//! for a hit, and on a miss populates the entry through a [`CacheWriter`]
//! (or the [`InterceptedResponse`] tee while the response streams to the
//! client). Groups collect related keys so one `delete("movies")` drops
//! every entry stored under that group.
//!
//! ## Configuration
//!
//! Engine behavior is controlled via [`CacheConfig`], which the host
//! deserializes from its own settings file:
//!
//! ```toml
//! [cache]
//! name = "pages"
//! default_duration_ms = 3600000
//! key_prefix = "app:"
//! track_performance = true
//! # ... see config.rs for all options
//! ```

mod backend;
mod config;
mod distributed;
mod duration;
mod engine;
mod entry;
mod error;
mod index;
mod intercept;
mod keys;
mod lock;
mod performance;
mod store;
mod sync;
pub mod telemetry;
mod transfer;

pub use backend::{Backend, Batch, BatchOp, KeyTtl, MemoryBackend, RedisBackend};
pub use config::{CacheConfig, StatusCodeFilter};
pub use distributed::DistributedStore;
pub use duration::{Ttl, parse_duration};
pub use engine::{CacheEngine, CacheWriter, EngineRegistry, LocalWriter};
pub use entry::{
    BodyChunk, CacheEntry, CacheHit, CachedBody, Encoding, EntryBody, ResponsePayload,
    STORE_HEADER, VERSION_HEADER,
};
pub use error::CacheError;
pub use index::CacheIndex;
pub use intercept::{InterceptedResponse, ResponseSink};
pub use lock::DistributedLock;
pub use performance::{PerformanceReport, PerformanceTracker};
pub use store::{ExpireHook, LocalStore};
pub use transfer::{TransferReader, TransferWriter};
