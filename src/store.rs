//! Local TTL store.
//!
//! Entries live in a concurrent map and each carries its own expiry
//! timer. A generation stamp ties every timer to the exact insertion
//! it guards, so replacing a key never lets the old timer evict the
//! new entry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::entry::CacheEntry;

const SOURCE: &str = "store";
const METRIC_ENTRY_EXPIRED: &str = "risposta_entry_expired_total";

/// Called when a timer evicts an entry, after it has left the map.
pub type ExpireHook = Box<dyn FnOnce(CacheEntry) + Send + 'static>;

struct StoredEntry {
    entry: CacheEntry,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct StoreInner {
    entries: DashMap<String, StoredEntry>,
    body_bytes: AtomicU64,
    generations: AtomicU64,
}

/// In-process entry storage with timer-driven eviction.
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                body_bytes: AtomicU64::new(0),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Store an entry and arm its expiry timer.
    ///
    /// The hook runs once if and only if this insertion expires; deleting
    /// or replacing the key first disarms it.
    pub fn add(&self, entry: CacheEntry, ttl_ms: u64, on_expire: Option<ExpireHook>) -> CacheEntry {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let key = entry.key.clone();
        let body_len = entry.body_len() as u64;

        let stored = StoredEntry {
            entry: entry.clone(),
            generation,
            timer: None,
        };
        if let Some(previous) = self.inner.entries.insert(key.clone(), stored) {
            retire(&self.inner, previous);
        }
        self.inner.body_bytes.fetch_add(body_len, Ordering::Relaxed);

        // The entry is visible before the timer exists; attaching the
        // handle afterwards only matters if the key survives that long.
        let timer = spawn_expiry(
            Arc::clone(&self.inner),
            key.clone(),
            generation,
            ttl_ms,
            on_expire,
        );
        match self.inner.entries.get_mut(&key) {
            Some(mut stored) if stored.generation == generation => stored.timer = Some(timer),
            _ => timer.abort(),
        }
        entry
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.inner.entries.get(key).map(|stored| stored.entry.clone())
    }

    /// Remove an entry, disarming its timer.
    pub fn delete(&self, key: &str) -> Option<CacheEntry> {
        let (_, stored) = self.inner.entries.remove(key)?;
        if let Some(timer) = stored.timer {
            timer.abort();
        }
        self.inner
            .body_bytes
            .fetch_sub(stored.entry.body_len() as u64, Ordering::Relaxed);
        Some(stored.entry)
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let keys: Vec<String> = self
            .inner
            .entries
            .iter()
            .map(|stored| stored.key().clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.delete(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Total inline body bytes currently held.
    pub fn body_bytes(&self) -> u64 {
        self.inner.body_bytes.load(Ordering::Relaxed)
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        for mut stored in self.inner.entries.iter_mut() {
            if let Some(timer) = stored.value_mut().timer.take() {
                timer.abort();
            }
        }
    }
}

fn retire(inner: &StoreInner, stored: StoredEntry) {
    if let Some(timer) = stored.timer {
        timer.abort();
    }
    inner
        .body_bytes
        .fetch_sub(stored.entry.body_len() as u64, Ordering::Relaxed);
}

fn spawn_expiry(
    inner: Arc<StoreInner>,
    key: String,
    generation: u64,
    ttl_ms: u64,
    on_expire: Option<ExpireHook>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(ttl_ms)).await;
        let removed = inner
            .entries
            .remove_if(&key, |_, stored| stored.generation == generation);
        if let Some((_, stored)) = removed {
            inner
                .body_bytes
                .fetch_sub(stored.entry.body_len() as u64, Ordering::Relaxed);
            counter!(METRIC_ENTRY_EXPIRED, "store" => "local").increment(1);
            debug!(source = SOURCE, key = %stored.entry.key, "entry expired");
            if let Some(hook) = on_expire {
                hook(stored.entry);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use bytes::Bytes;
    use time::OffsetDateTime;

    use crate::entry::{Encoding, EntryBody};

    use super::*;

    fn sample_entry(key: &str) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: EntryBody::Inline(Bytes::from_static(b"cached body")),
            encoding: Encoding::Utf8,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
            duration_ms: 30_000,
            group: None,
        }
    }

    #[tokio::test]
    async fn add_then_get_roundtrip() {
        let store = LocalStore::new();
        store.add(sample_entry("/a"), 60_000, None);

        let cached = store.get("/a").expect("cached entry");
        assert_eq!(cached.status, 200);
        assert_eq!(store.len(), 1);
        assert_eq!(store.body_bytes(), "cached body".len() as u64);
    }

    #[tokio::test]
    async fn expiry_removes_entry_and_fires_hook() {
        let store = LocalStore::new();
        let (tx, rx) = mpsc::channel();
        store.add(
            sample_entry("/a"),
            30,
            Some(Box::new(move |entry| {
                tx.send(entry.key).ok();
            })),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(store.get("/a").is_none());
        assert_eq!(store.body_bytes(), 0);
        assert_eq!(rx.try_recv().expect("hook fired"), "/a");
    }

    #[tokio::test]
    async fn replacing_an_entry_disarms_the_old_timer() {
        let store = LocalStore::new();
        let (tx, rx) = mpsc::channel();
        store.add(
            sample_entry("/a"),
            30,
            Some(Box::new(move |entry| {
                tx.send(entry.key).ok();
            })),
        );
        store.add(sample_entry("/a"), 60_000, None);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(store.get("/a").is_some());
        assert!(rx.try_recv().is_err());
        assert_eq!(store.body_bytes(), "cached body".len() as u64);
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let store = LocalStore::new();
        store.add(sample_entry("/a"), 0, None);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.get("/a").is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn delete_disarms_the_timer() {
        let store = LocalStore::new();
        let (tx, rx) = mpsc::channel();
        store.add(
            sample_entry("/a"),
            30,
            Some(Box::new(move |entry| {
                tx.send(entry.key).ok();
            })),
        );

        let removed = store.delete("/a").expect("removed entry");
        assert_eq!(removed.key, "/a");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(store.body_bytes(), 0);
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let store = LocalStore::new();
        store.add(sample_entry("/a"), 60_000, None);
        store.add(sample_entry("/b"), 60_000, None);

        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert_eq!(store.body_bytes(), 0);
    }
}
