//! Entropy Source Adapter.
//!
//! Wraps registered sources behind one call, `fetch_bytes(n, kind)`, adding
//! chunking and capped linear backoff. There is no fallback: if the requested
//! kind is missing or keeps failing, the caller gets a typed error.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{EngineConfig, RetryPolicy};
use crate::error::EntropyError;
use crate::source::{EntropySource, RawByteBatch, SourceKind};

/// Registry of entropy sources with retry and chunking.
#[derive(Clone)]
pub struct EntropyAdapter {
    sources: HashMap<SourceKind, Arc<dyn EntropySource>>,
    retry: RetryPolicy,
    chunk_size: usize,
}

impl EntropyAdapter {
    pub fn new(retry: RetryPolicy, chunk_size: usize) -> Self {
        Self {
            sources: HashMap::new(),
            retry,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.retry, config.fetch_chunk_size)
    }

    /// Register a source, replacing any previous source of the same kind.
    pub fn register(&mut self, source: Arc<dyn EntropySource>) {
        self.sources.insert(source.kind(), source);
    }

    pub fn with_source(mut self, source: Arc<dyn EntropySource>) -> Self {
        self.register(source);
        self
    }

    pub fn has(&self, kind: SourceKind) -> bool {
        self.sources.contains_key(&kind)
    }

    /// Fetch exactly `n` bytes from the source of `kind`.
    ///
    /// Requests above the chunk size are split into several calls; each chunk
    /// is retried independently. The returned batch has a fresh batch id.
    pub async fn fetch_bytes(&self, n: usize, kind: SourceKind) -> Result<RawByteBatch, EntropyError> {
        if n == 0 {
            return Err(EntropyError::InvalidRequest("zero bytes requested".into()));
        }
        let source = self
            .sources
            .get(&kind)
            .ok_or(EntropyError::Unavailable(kind))?;

        let mut bytes = Vec::with_capacity(n);
        let mut label = None;
        let mut server_time = None;
        while bytes.len() < n {
            let want = (n - bytes.len()).min(self.chunk_size);
            let chunk = self.fetch_chunk(source.as_ref(), want).await?;
            if label.is_none() {
                label = Some(chunk.source.clone());
            }
            server_time = chunk.server_time.or(server_time);
            bytes.extend_from_slice(&chunk.bytes);
        }

        let mut batch = RawByteBatch::new(kind, label.unwrap_or_else(|| kind.label().to_string()), bytes);
        batch.server_time = server_time;
        log::debug!("fetched {} bytes from {} (batch {})", n, batch.source, batch.batch_id);
        Ok(batch)
    }

    async fn fetch_chunk(&self, source: &dyn EntropySource, want: usize) -> Result<RawByteBatch, EntropyError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match source.fetch(want).await {
                Ok(batch) if batch.len() == want => return Ok(batch),
                Ok(batch) => {
                    let err = EntropyError::ShortBatch {
                        source_label: source.label().to_string(),
                        expected: want,
                        got: batch.len(),
                    };
                    self.backoff_or_fail(source, attempt, err).await?;
                }
                Err(err) => self.backoff_or_fail(source, attempt, err).await?,
            }
        }
    }

    /// Sleep before the next attempt, or return the terminal error.
    async fn backoff_or_fail(
        &self,
        source: &dyn EntropySource,
        attempt: u32,
        err: EntropyError,
    ) -> Result<(), EntropyError> {
        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= self.retry.max_attempts {
            log::warn!(
                "entropy source {} failed {} times, giving up: {}",
                source.label(),
                attempt,
                err
            );
            return Err(EntropyError::Exhausted {
                kind: source.kind(),
                attempts: attempt,
                last: Box::new(err),
            });
        }
        let delay = self.retry.delay_after(attempt);
        log::warn!(
            "entropy source {} attempt {} failed ({}); retrying in {:?}",
            source.label(),
            attempt,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
