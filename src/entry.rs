//! Cached-response data model and header policy.
//!
//! A [`CacheEntry`] is immutable once stored: re-population replaces it
//! wholesale. Headers keep their write-time order; the configured denylist
//! is applied before storage, and serve-time policy (protocol headers,
//! max-age decay, etag short-circuit) is applied on every read so the same
//! stored entry ages visibly.

use std::collections::HashMap;

use bytes::Bytes;
use time::OffsetDateTime;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::transfer::TransferReader;

/// Header naming the store that served a hit.
pub const STORE_HEADER: &str = "risposta-store";
/// Header naming the cache version that stored an entry.
pub const VERSION_HEADER: &str = "risposta-version";

const FIELD_STATUS: &str = "status";
const FIELD_HEADERS: &str = "headers";
const FIELD_ENCODING: &str = "encoding";
const FIELD_CREATED: &str = "created";
const FIELD_DURATION: &str = "duration";
pub(crate) const FIELD_GROUP: &str = "group";
const FIELD_BODY: &str = "body";
pub(crate) const FIELD_TOKEN: &str = "token";

// ============================================================================
// Body types
// ============================================================================

/// Body encoding, fixed by the first written chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Binary,
}

impl Encoding {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Binary => "binary",
        }
    }

    pub(crate) fn parse(text: &str) -> Option<Self> {
        match text {
            "utf-8" => Some(Self::Utf8),
            "binary" => Some(Self::Binary),
            _ => None,
        }
    }
}

/// One unit of response body, as handed over by the web layer.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyChunk {
    Text(String),
    Binary(Bytes),
}

impl BodyChunk {
    pub fn encoding(&self) -> Encoding {
        match self {
            Self::Text(_) => Encoding::Utf8,
            Self::Binary(_) => Encoding::Binary,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::from(text),
            Self::Binary(bytes) => bytes,
        }
    }
}

impl From<&str> for BodyChunk {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for BodyChunk {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for BodyChunk {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for BodyChunk {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

// ============================================================================
// Entries
// ============================================================================

/// Where an entry's body lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBody {
    /// Stored inline with the metadata.
    Inline(Bytes),
    /// Streamed separately under a data token.
    Token(String),
}

/// One cached response.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Request fingerprint this entry answers.
    pub key: String,
    pub status: u16,
    /// Write-time header order, denylist already applied.
    pub headers: Vec<(String, String)>,
    pub body: EntryBody,
    pub encoding: Encoding,
    /// Seconds since the epoch at write time.
    pub created_at: i64,
    /// Original TTL, kept for max-age recomputation on read.
    pub duration_ms: u64,
    /// Invalidation group fixed at write time.
    pub group: Option<String>,
}

impl CacheEntry {
    /// Inline body size; streamed bodies count as zero here.
    pub fn body_len(&self) -> usize {
        match &self.body {
            EntryBody::Inline(bytes) => bytes.len(),
            EntryBody::Token(_) => 0,
        }
    }
}

/// A fully-buffered response handed to `put`.
#[derive(Debug, Clone)]
pub struct ResponsePayload {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: BodyChunk,
}

/// A served cache hit.
#[derive(Debug)]
pub struct CacheHit {
    pub status: u16,
    /// Stored headers with serve-time policy applied.
    pub headers: Vec<(String, String)>,
    pub encoding: Encoding,
    pub body: CachedBody,
}

/// Body form of a hit.
#[derive(Debug)]
pub enum CachedBody {
    Inline(Bytes),
    Streamed(TransferReader),
    /// Not-modified short-circuit; nothing to send.
    Empty,
}

// ============================================================================
// Header policy
// ============================================================================

/// Drop denylisted headers before storage.
pub(crate) fn filter_headers(
    headers: Vec<(String, String)>,
    config: &CacheConfig,
) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| !config.denies_header(name))
        .collect()
}

/// Replace-or-append a header, case-insensitive on the name.
pub(crate) fn merge_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value));
}

pub(crate) fn etag_of(headers: &[(String, String)]) -> Option<&str> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("etag"))
        .map(|(_, value)| value.as_str())
}

/// Rewrite the `max-age` directive so the advertised freshness window
/// shrinks with the entry's age: `max(0, min(stored, ttl - elapsed))`.
/// Other cache-control directives are preserved; an entry stored without
/// one gains a plain `max-age`.
pub(crate) fn decay_max_age(
    headers: &mut Vec<(String, String)>,
    duration_ms: u64,
    elapsed_secs: i64,
) {
    let remaining = ((duration_ms / 1_000) as i64 - elapsed_secs).max(0) as u64;
    let position = headers
        .iter()
        .position(|(name, _)| name.eq_ignore_ascii_case("cache-control"));
    match position {
        Some(index) => {
            let mut rewrote = false;
            let mut directives: Vec<String> = headers[index]
                .1
                .split(',')
                .map(|directive| {
                    let directive = directive.trim();
                    if let Some(stored) = directive.strip_prefix("max-age=") {
                        rewrote = true;
                        let capped = stored
                            .parse::<u64>()
                            .map_or(remaining, |stored| stored.min(remaining));
                        format!("max-age={capped}")
                    } else {
                        directive.to_string()
                    }
                })
                .collect();
            if !rewrote {
                directives.push(format!("max-age={remaining}"));
            }
            headers[index].1 = directives.join(", ");
        }
        None => headers.push(("cache-control".to_string(), format!("max-age={remaining}"))),
    }
}

/// Serve-time plan for one stored entry.
pub(crate) enum ServePlan {
    Full(Vec<(String, String)>),
    NotModified(Vec<(String, String)>),
}

/// Apply serve-time header policy and the conditional-request check.
pub(crate) fn plan_serve(
    entry: &CacheEntry,
    store_kind: &str,
    if_none_match: Option<&str>,
) -> ServePlan {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let elapsed = (now - entry.created_at).max(0);

    let mut headers = entry.headers.clone();
    decay_max_age(&mut headers, entry.duration_ms, elapsed);
    merge_header(&mut headers, STORE_HEADER, store_kind.to_string());
    merge_header(
        &mut headers,
        VERSION_HEADER,
        env!("CARGO_PKG_VERSION").to_string(),
    );

    if let (Some(requested), Some(stored)) = (if_none_match, etag_of(&entry.headers))
        && requested == stored
    {
        return ServePlan::NotModified(headers);
    }
    ServePlan::Full(headers)
}

// ============================================================================
// Stored-field codec
// ============================================================================

/// Encode an entry as hash fields for the shared store.
pub(crate) fn to_fields(entry: &CacheEntry) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
    let headers = serde_json::to_vec(&entry.headers)
        .map_err(|err| CacheError::malformed(&entry.key, format!("header encoding: {err}")))?;
    let mut fields = vec![
        (FIELD_STATUS.to_string(), entry.status.to_string().into_bytes()),
        (FIELD_HEADERS.to_string(), headers),
        (
            FIELD_ENCODING.to_string(),
            entry.encoding.as_str().as_bytes().to_vec(),
        ),
        (
            FIELD_CREATED.to_string(),
            entry.created_at.to_string().into_bytes(),
        ),
        (
            FIELD_DURATION.to_string(),
            entry.duration_ms.to_string().into_bytes(),
        ),
    ];
    if let Some(group) = &entry.group {
        fields.push((FIELD_GROUP.to_string(), group.as_bytes().to_vec()));
    }
    match &entry.body {
        EntryBody::Inline(bytes) => fields.push((FIELD_BODY.to_string(), bytes.to_vec())),
        EntryBody::Token(token) => {
            fields.push((FIELD_TOKEN.to_string(), token.as_bytes().to_vec()));
        }
    }
    Ok(fields)
}

/// Decode an entry from stored hash fields.
pub(crate) fn from_fields(
    key: &str,
    fields: &HashMap<String, Vec<u8>>,
) -> Result<CacheEntry, CacheError> {
    let text = |name: &str| -> Result<Option<&str>, CacheError> {
        fields
            .get(name)
            .map(|raw| {
                std::str::from_utf8(raw)
                    .map_err(|_| CacheError::malformed(key, format!("{name} is not utf-8")))
            })
            .transpose()
    };
    let required = |name: &str| -> Result<&str, CacheError> {
        text(name)?.ok_or_else(|| CacheError::malformed(key, format!("missing {name}")))
    };

    let status = required(FIELD_STATUS)?
        .parse::<u16>()
        .map_err(|_| CacheError::malformed(key, "unreadable status"))?;
    let headers_raw = fields
        .get(FIELD_HEADERS)
        .ok_or_else(|| CacheError::malformed(key, "missing headers"))?;
    let headers: Vec<(String, String)> = serde_json::from_slice(headers_raw)
        .map_err(|err| CacheError::malformed(key, format!("header decoding: {err}")))?;
    let encoding = Encoding::parse(required(FIELD_ENCODING)?)
        .ok_or_else(|| CacheError::malformed(key, "unknown encoding"))?;
    let created_at = required(FIELD_CREATED)?
        .parse::<i64>()
        .map_err(|_| CacheError::malformed(key, "unreadable creation time"))?;
    let duration_ms = required(FIELD_DURATION)?
        .parse::<u64>()
        .map_err(|_| CacheError::malformed(key, "unreadable duration"))?;
    let group = text(FIELD_GROUP)?.map(str::to_string);

    let body = if let Some(token) = text(FIELD_TOKEN)? {
        EntryBody::Token(token.to_string())
    } else if let Some(raw) = fields.get(FIELD_BODY) {
        EntryBody::Inline(Bytes::copy_from_slice(raw))
    } else {
        return Err(CacheError::malformed(key, "missing body"));
    };

    Ok(CacheEntry {
        key: key.to_string(),
        status,
        headers,
        body,
        encoding,
        created_at,
        duration_ms,
        group,
    })
}
