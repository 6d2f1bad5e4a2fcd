//! Chunked body transfer.
//!
//! A writer appends response chunks to a token-addressed blob while the
//! population lock is held, then commits entry metadata atomically. Any
//! fault mid-stream turns the writer into a silent discard so the
//! response continues to flow to the client uncached. Readers page the
//! blob back with ranged reads and can resume from any offset.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{Backend, Batch};
use crate::distributed::StoreShared;
use crate::entry::{
    BodyChunk, CacheEntry, Encoding, EntryBody, FIELD_GROUP, filter_headers, to_fields,
};
use crate::error::CacheError;
use crate::keys;
use crate::lock::DistributedLock;

const SOURCE: &str = "transfer";
const METRIC_LOCK_CONTENTION: &str = "risposta_lock_contention_total";
const METRIC_TRANSFER_ABORT: &str = "risposta_transfer_abort_total";
const METRIC_BACKEND_ERROR: &str = "risposta_backend_error_total";
const METRIC_COMMIT_MS: &str = "risposta_commit_ms";

// ============================================================================
// Writer
// ============================================================================

enum WriterState {
    Active(Box<ActiveTransfer>),
    Discard,
}

/// Streaming writer for one cache key.
///
/// A discard writer accepts every call and stores nothing; callers do
/// not need to care which kind they hold.
pub struct TransferWriter {
    state: WriterState,
}

struct ActiveTransfer {
    shared: Arc<StoreShared>,
    lock: DistributedLock,
    key: String,
    entry_key: String,
    data_key: String,
    token: String,
    group: Option<String>,
    ttl_ms: u64,
    encoding: Encoding,
    chunks: u64,
    bytes: u64,
    guard_armed: bool,
}

impl TransferWriter {
    /// Claim the population lock and open a transfer, or hand back a
    /// discard writer when the key is already being populated or the
    /// store is unreachable.
    pub(crate) async fn open(
        shared: Arc<StoreShared>,
        key: &str,
        group: Option<String>,
        ttl_ms: u64,
    ) -> TransferWriter {
        let prefix = shared.config.key_prefix.clone();
        let lock = match DistributedLock::acquire(
            shared.backend.clone(),
            &prefix,
            key,
            shared.config.lock_ttl_non_zero().get(),
        )
        .await
        {
            Ok(lock) => lock,
            Err(CacheError::LockHeld { .. }) => {
                counter!(METRIC_LOCK_CONTENTION).increment(1);
                debug!(source = SOURCE, key, "population in progress elsewhere, discarding");
                return Self::discard();
            }
            Err(err) => {
                counter!(METRIC_BACKEND_ERROR).increment(1);
                warn!(source = SOURCE, key, error = %err, "could not open transfer, discarding");
                return Self::discard();
            }
        };

        let token = Uuid::new_v4().simple().to_string();
        let data_key = keys::data_key(&prefix, &token, key);
        let entry_key = keys::entry_key(&prefix, key);
        Self {
            state: WriterState::Active(Box::new(ActiveTransfer {
                shared,
                lock,
                key: key.to_string(),
                entry_key,
                data_key,
                token,
                group,
                ttl_ms,
                encoding: Encoding::default(),
                chunks: 0,
                bytes: 0,
                guard_armed: false,
            })),
        }
    }

    pub(crate) fn discard() -> Self {
        Self {
            state: WriterState::Discard,
        }
    }

    /// True when nothing will be stored.
    pub fn is_discard(&self) -> bool {
        matches!(self.state, WriterState::Discard)
    }

    /// Append one body chunk.
    ///
    /// Empty chunks are skipped. On any fault the blob is torn down and
    /// the writer degrades to a discard; the call itself never fails.
    pub async fn write(&mut self, chunk: impl Into<BodyChunk>) {
        let WriterState::Active(active) = &mut self.state else {
            return;
        };
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        if let Err(err) = active.append(chunk).await {
            let reason = abort_reason(&err);
            warn!(
                source = SOURCE,
                key = %active.key,
                error = %err,
                reason,
                "transfer failed mid-stream, discarding"
            );
            counter!(METRIC_TRANSFER_ABORT, "reason" => reason).increment(1);
            self.teardown().await;
        }
    }

    /// Seal the transfer into a stored entry.
    ///
    /// Returns `Ok(None)` for discard writers and for responses the
    /// status filter rejects.
    pub async fn commit(
        self,
        status: u16,
        headers: Vec<(String, String)>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        match self.state {
            WriterState::Discard => Ok(None),
            WriterState::Active(active) => active.commit(status, headers).await,
        }
    }

    /// Abandon the transfer, deleting anything already written.
    pub async fn abort(self) {
        if let WriterState::Active(active) = self.state {
            counter!(METRIC_TRANSFER_ABORT, "reason" => "aborted").increment(1);
            active.cleanup().await;
        }
    }

    async fn teardown(&mut self) {
        if let WriterState::Active(active) = std::mem::replace(&mut self.state, WriterState::Discard)
        {
            active.cleanup().await;
        }
    }
}

impl ActiveTransfer {
    async fn append(&mut self, chunk: BodyChunk) -> Result<(), CacheError> {
        if self.chunks == 0 {
            self.encoding = chunk.encoding();
        }
        self.lock.maintain().await?;
        self.bytes = self
            .shared
            .backend
            .append(&self.data_key, chunk.as_bytes())
            .await?;
        self.chunks += 1;
        if !self.guard_armed {
            // Provisional TTL so a crashed writer cannot leak the blob.
            let guard_ms = self
                .ttl_ms
                .saturating_add(self.shared.config.transfer_guard_ms);
            self.shared
                .backend
                .expire_ms(&self.data_key, guard_ms)
                .await?;
            self.guard_armed = true;
        }
        Ok(())
    }

    async fn commit(
        mut self: Box<Self>,
        status: u16,
        headers: Vec<(String, String)>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let started_at = Instant::now();
        // The claim must still be ours: a writer that stalled past its
        // grant would otherwise overwrite its successor's entry.
        if let Err(err) = self.lock.maintain().await {
            let reason = abort_reason(&err);
            warn!(
                source = SOURCE,
                key = %self.key,
                error = %err,
                reason,
                "lock lapsed before commit, discarding transfer"
            );
            counter!(METRIC_TRANSFER_ABORT, "reason" => reason).increment(1);
            self.cleanup().await;
            return Ok(None);
        }
        if !self.shared.config.status_codes.allows(status) {
            debug!(
                source = SOURCE,
                key = %self.key,
                status,
                "status rejected by filter, discarding transfer"
            );
            self.cleanup().await;
            return Ok(None);
        }

        let entry = CacheEntry {
            key: self.key.clone(),
            status,
            headers: filter_headers(headers, &self.shared.config),
            body: EntryBody::Token(self.token.clone()),
            encoding: self.encoding,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
            duration_ms: self.ttl_ms,
            group: self.group.clone(),
        };
        let fields = match to_fields(&entry) {
            Ok(fields) => fields,
            Err(err) => {
                self.cleanup().await;
                return Err(err);
            }
        };

        let previous_group = match self
            .shared
            .backend
            .hash_get(&self.entry_key, FIELD_GROUP)
            .await
        {
            Ok(raw) => raw.and_then(|bytes| String::from_utf8(bytes).ok()),
            Err(err) => {
                self.cleanup().await;
                return Err(err);
            }
        };

        // The blob outlives the entry long enough for readers that
        // started just before expiry to finish streaming.
        let retention = self.ttl_ms.saturating_add(retention_ms(
            self.chunks,
            self.bytes,
            self.shared.config.retention_per_chunk_ms,
            self.shared.config.retention_bytes_per_sec,
        ));
        // Delete first: HSET merges fields, and a leftover inline body
        // from a previous entry must not survive.
        let mut batch = Batch::new()
            .delete(vec![self.entry_key.clone()])
            .hash_set(self.entry_key.clone(), fields)
            .expire_ms(self.entry_key.clone(), self.ttl_ms)
            .expire_ms(self.data_key.clone(), retention);
        if let Some(previous) =
            previous_group.filter(|previous| self.group.as_deref() != Some(previous.as_str()))
        {
            // A replaced entry takes its old group membership with it.
            batch = batch.set_remove(
                keys::group_key(&self.shared.config.key_prefix, &previous),
                self.key.clone(),
            );
        }
        if let Some(group) = &self.group {
            batch = batch.set_add(
                keys::group_key(&self.shared.config.key_prefix, group),
                self.key.clone(),
            );
        }
        if let Err(err) = self.shared.backend.apply(batch).await {
            self.cleanup().await;
            return Err(err);
        }

        self.shared
            .schedule_expiry(&self.key, self.ttl_ms, self.group.clone());
        if let Err(err) = self.lock.release().await {
            debug!(source = SOURCE, key = %self.key, error = %err, "lock release failed");
        }

        histogram!(METRIC_COMMIT_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        debug!(
            source = SOURCE,
            key = %self.key,
            status,
            chunks = self.chunks,
            bytes = self.bytes,
            "committed streamed entry"
        );
        Ok(Some(entry))
    }

    async fn cleanup(self: Box<Self>) {
        if let Err(err) = self.shared.backend.delete(&[self.data_key.clone()]).await {
            debug!(
                source = SOURCE,
                key = %self.key,
                error = %err,
                "could not delete abandoned blob"
            );
        }
        if let Err(err) = self.lock.release().await {
            debug!(source = SOURCE, key = %self.key, error = %err, "lock release failed");
        }
    }
}

fn abort_reason(err: &CacheError) -> &'static str {
    match err {
        CacheError::LockLost { .. } | CacheError::LockHeld { .. } => "lock_lost",
        CacheError::StreamWrite { .. } => "write_failed",
        _ => "backend_error",
    }
}

/// Extra blob lifetime granted at commit, derived from how much was
/// written: per-chunk latency allowance plus worst-case download time.
fn retention_ms(
    chunks: u64,
    bytes: u64,
    retention_per_chunk_ms: u64,
    retention_bytes_per_sec: u64,
) -> u64 {
    let chunk_ms = chunks.saturating_mul(retention_per_chunk_ms);
    let drain_ms = bytes.saturating_mul(1_000) / retention_bytes_per_sec.max(1);
    chunk_ms.saturating_add(drain_ms)
}

// ============================================================================
// Reader
// ============================================================================

/// Ranged reader over a committed body blob.
///
/// Stateless on the wire: only the local offset advances, so a dropped
/// reader can be rebuilt at the same position with [`Self::with_offset`].
pub struct TransferReader {
    backend: Arc<dyn Backend>,
    data_key: String,
    offset: u64,
    chunk_bytes: u64,
}

impl TransferReader {
    pub(crate) fn new(backend: Arc<dyn Backend>, data_key: String, chunk_bytes: u64) -> Self {
        Self {
            backend,
            data_key,
            offset: 0,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    /// Resume reading at `offset` bytes into the body.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next page of the body, or `None` at the end.
    ///
    /// A blob deleted mid-read reports end-of-stream rather than an
    /// error; commit-time retention makes that window abnormal.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, CacheError> {
        let end = self.offset.saturating_add(self.chunk_bytes - 1);
        let chunk = self.backend.range(&self.data_key, self.offset, end).await?;
        if chunk.is_empty() {
            return Ok(None);
        }
        self.offset += chunk.len() as u64;
        Ok(Some(chunk))
    }

    /// Drain the remaining body into one buffer.
    pub async fn read_to_end(mut self) -> Result<Bytes, CacheError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    /// Adapt the reader into a chunk stream.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Bytes, CacheError>> + Send {
        async_stream::try_stream! {
            while let Some(chunk) = self.next_chunk().await? {
                yield chunk;
            }
        }
    }
}

impl std::fmt::Debug for TransferReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferReader")
            .field("data_key", &self.data_key)
            .field("offset", &self.offset)
            .field("chunk_bytes", &self.chunk_bytes)
            .finish()
    }
}
