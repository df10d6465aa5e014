// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Retrieval: stream a stored version back out, chunk by chunk.
//!
//! The record is resolved from the [`MetadataCatalog`] up front, then a lazy
//! stream reads one chunk from the [`ChunkStore`] each time the consumer
//! polls. Nothing is prefetched, so a slow consumer holds at most one chunk
//! in memory and dropping the stream stops further reads.

use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::try_stream;
use bytes::Bytes;
use tokio_stream::Stream;
use tracing::{debug, error};

use crate::error::{StoreError, Result};
use crate::storage::blocking;
use crate::storage::catalog::{MetadataCatalog, VersionRecord, VersionSummary};
use crate::storage::chunk_store::{ChunkId, ChunkStore};

/// Single-use stream of object bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// A resolved version and the stream producing its bytes.
pub struct Download {
    pub summary: VersionSummary,
    /// Bytes the stream will yield (the range length for partial reads).
    pub content_length: u64,
    pub stream: ByteStream,
}

impl Download {
    pub fn version(&self) -> u64 {
        self.summary.version
    }

    pub fn length(&self) -> u64 {
        self.summary.length
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("summary", &self.summary)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Stateless read path; cheap to clone and share.
#[derive(Clone)]
pub struct RetrievalPipeline {
    chunks: Arc<ChunkStore>,
    catalog: Arc<MetadataCatalog>,
}

impl RetrievalPipeline {
    pub fn new(chunks: Arc<ChunkStore>, catalog: Arc<MetadataCatalog>) -> Self {
        Self { chunks, catalog }
    }

    /// Stream `name`, either a specific version or the latest one.
    pub async fn retrieve(&self, name: &str, version: Option<u64>) -> Result<Download> {
        let record = self.resolve(name, version)?;
        self.preflight(&record).await?;

        let summary = record.summary();
        let content_length = record.length;
        debug!(name, version = record.version, bytes = content_length, "Retrieval started");
        let stream = chunk_stream(self.chunks.clone(), record, 0..content_length);
        Ok(Download { summary, content_length, stream: Box::pin(stream) })
    }

    /// Stream the half-open byte `range` of a version. Only the chunks
    /// overlapping the range are read.
    pub async fn retrieve_range(
        &self,
        name: &str,
        version: Option<u64>,
        range: Range<u64>,
    ) -> Result<Download> {
        let record = self.resolve(name, version)?;
        if range.start > range.end || range.end > record.length {
            return Err(StoreError::InvalidRange {
                start: range.start,
                end: range.end,
                length: record.length,
            });
        }
        self.preflight(&record).await?;

        let summary = record.summary();
        let content_length = range.end - range.start;
        let stream = chunk_stream(self.chunks.clone(), record, range);
        Ok(Download { summary, content_length, stream: Box::pin(stream) })
    }

    fn resolve(&self, name: &str, version: Option<u64>) -> Result<VersionRecord> {
        match version {
            Some(v) => self.catalog.get(name, v),
            None => self.catalog.get_latest(name),
        }
    }

    /// Reject records whose chunk list cannot reproduce `length`, before
    /// the caller starts sending a body.
    async fn preflight(&self, record: &VersionRecord) -> Result<()> {
        if record.chunk_size == 0 && record.length > 0 {
            return Err(corrupted(record, "chunk size is zero".to_string()));
        }
        let expected = record.expected_chunk_count();
        if record.chunk_ids.len() != expected {
            return Err(corrupted(
                record,
                format!("{} chunks listed, {expected} expected", record.chunk_ids.len()),
            ));
        }

        let store = self.chunks.clone();
        let ids = record.chunk_ids.clone();
        let missing = blocking("chunk lookup", move || {
            Ok(ids.into_iter().find(|id| !store.contains(*id)))
        })
        .await?;
        if let Some(id) = missing {
            return Err(corrupted(record, format!("chunk {id} is missing")));
        }
        Ok(())
    }
}

fn chunk_stream(
    store: Arc<ChunkStore>,
    record: VersionRecord,
    range: Range<u64>,
) -> impl Stream<Item = Result<Bytes>> + Send {
    try_stream! {
        let chunk_size = record.chunk_size as u64;
        let mut emitted: u64 = 0;
        let wanted = range.end - range.start;

        if wanted > 0 {
            let first = (range.start / chunk_size) as usize;
            let last = ((range.end - 1) / chunk_size) as usize;

            for idx in first..=last {
                let id = record.chunk_ids[idx];
                let data = read_chunk(&store, &record, id).await?;

                let expected = record.expected_chunk_len(idx);
                if data.len() as u64 != expected {
                    Err::<(), _>(corrupted(
                        &record,
                        format!("chunk {id} holds {} bytes, expected {expected}", data.len()),
                    ))?;
                }

                let chunk_start = idx as u64 * chunk_size;
                let from = range.start.saturating_sub(chunk_start) as usize;
                let to = (range.end - chunk_start).min(expected) as usize;
                let piece = data.slice(from..to);
                emitted += piece.len() as u64;
                yield piece;
            }
        }

        if emitted != wanted {
            Err::<(), _>(corrupted(&record, format!("yielded {emitted} bytes, expected {wanted}")))?;
        }
        debug!(name = %record.name, version = record.version, bytes = emitted, "Retrieval complete");
    }
}

/// Fetch one chunk, translating chunk-level absence into corruption of the
/// version that references it.
async fn read_chunk(store: &Arc<ChunkStore>, record: &VersionRecord, id: ChunkId) -> Result<Bytes> {
    let store = store.clone();
    match blocking("chunk read", move || store.get(id)).await {
        Ok(data) => Ok(data),
        Err(StoreError::ChunkNotFound(_)) => Err(corrupted(record, format!("chunk {id} is missing"))),
        Err(StoreError::CorruptChunk { reason, .. }) => {
            Err(corrupted(record, format!("chunk {id}: {reason}")))
        }
        Err(e) => Err(e),
    }
}

fn corrupted(record: &VersionRecord, reason: String) -> StoreError {
    error!(name = %record.name, version = record.version, reason = %reason, "Corrupted version");
    StoreError::CorruptedVersion {
        name: record.name.clone(),
        version: record.version,
        reason,
    }
}
