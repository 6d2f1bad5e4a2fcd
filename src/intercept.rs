//! Response interception.
//!
//! The web layer constructs an [`InterceptedResponse`] around its real
//! client-facing sink and a [`CacheWriter`]; every chunk is forwarded to
//! both, and `end` seals the cache entry as the client response completes.
//! An explicit tee owned by the caller, never a patched response object.

use async_trait::async_trait;

use crate::engine::CacheWriter;
use crate::entry::{BodyChunk, CacheEntry};

/// The real client-facing response sink, owned by the web layer.
#[async_trait]
pub trait ResponseSink: Send {
    /// Forward one body chunk to the client.
    async fn write(&mut self, chunk: BodyChunk);

    /// Complete the client response, with an optional final chunk.
    async fn end(&mut self, chunk: Option<BodyChunk>);
}

/// Tee forwarding a response to the client and the cache at once.
pub struct InterceptedResponse<S: ResponseSink> {
    sink: S,
    writer: CacheWriter,
}

impl<S: ResponseSink> InterceptedResponse<S> {
    pub fn new(sink: S, writer: CacheWriter) -> Self {
        Self { sink, writer }
    }

    /// True when chunks are reaching the cache as well as the client.
    pub fn is_recording(&self) -> bool {
        self.writer.is_recording()
    }

    /// Forward one chunk to the cache and the client.
    pub async fn write(&mut self, chunk: impl Into<BodyChunk>) {
        let chunk = chunk.into();
        self.writer.write(chunk.clone()).await;
        self.sink.write(chunk).await;
    }

    /// Complete the response.
    ///
    /// The final chunk (if any) reaches both sides, the client response is
    /// ended, and the cache entry is committed under the response's status
    /// and headers. Returns the committed entry, or `None` when nothing
    /// was cached.
    pub async fn end(
        mut self,
        status: u16,
        headers: Vec<(String, String)>,
        chunk: Option<BodyChunk>,
    ) -> Option<CacheEntry> {
        if let Some(chunk) = &chunk {
            self.writer.write(chunk.clone()).await;
        }
        self.sink.end(chunk).await;
        self.writer.commit(status, headers).await
    }

    /// Complete the client response without caching anything.
    pub async fn discard(mut self, chunk: Option<BodyChunk>) {
        self.sink.end(chunk).await;
        self.writer.abort().await;
    }
}
