// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Ingest pipeline.
//!
//! Each call to [`IngestPipeline::ingest`]:
//!  1. Reserves the next version number for the name.
//!  2. Reads the source in windows of exactly `chunk_size` bytes (the last
//!     one may be shorter) and writes each window to the chunk store, with
//!     at most `max_in_flight` writes outstanding.
//!  3. Commits one version record once every chunk is durable.
//!
//! Nothing is committed on failure or cancellation. Chunks already written
//! for the attempt stay on disk unreferenced.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StoreError, Result};
use crate::storage::blocking;
use crate::storage::catalog::{validate_name, MetadataCatalog, VersionRecord};
use crate::storage::chunk_store::{ChunkId, ChunkStore};

type PendingWrite = JoinHandle<Result<ChunkId>>;

/// Turns inbound byte streams into committed versions.
#[derive(Clone)]
pub struct IngestPipeline {
    chunks: Arc<ChunkStore>,
    catalog: Arc<MetadataCatalog>,
    chunk_size: usize,
    max_in_flight: usize,
    max_object_size: Option<u64>,
}

/// State of one attempt: ids of completed chunk writes, bytes read.
#[derive(Default)]
struct Progress {
    chunk_ids: Vec<ChunkId>,
    length: u64,
}

impl IngestPipeline {
    pub fn new(
        chunks: Arc<ChunkStore>,
        catalog: Arc<MetadataCatalog>,
        chunk_size: usize,
        max_in_flight: usize,
    ) -> Self {
        Self {
            chunks,
            catalog,
            chunk_size: chunk_size.max(1),
            max_in_flight: max_in_flight.max(1),
            max_object_size: None,
        }
    }

    /// Abort ingests whose source grows past `limit` bytes.
    pub fn with_max_object_size(mut self, limit: Option<u64>) -> Self {
        self.max_object_size = limit;
        self
    }

    /// Consume `source` and commit it as the next version of `name`.
    ///
    /// Every failure after the name check is reported as
    /// [`StoreError::IngestFailed`] wrapping the cause.
    pub async fn ingest<R>(&self, name: &str, mut source: R) -> Result<VersionRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        validate_name(name)?;

        let catalog = self.catalog.clone();
        let owned = name.to_string();
        let version = blocking("version reservation", move || catalog.next_version(&owned))
            .await
            .map_err(|e| ingest_failed(name, None, e))?;
        debug!(name, version, "Version reserved");

        let mut progress = Progress::default();
        let mut pending: VecDeque<PendingWrite> = VecDeque::with_capacity(self.max_in_flight);

        if let Err(e) = self.write_chunks(&mut source, &mut pending, &mut progress).await {
            let orphaned = progress.chunk_ids.len() + pending.len();
            warn!(name, version, orphaned, error = %e, "Ingest aborted, chunks left unreferenced");
            return Err(ingest_failed(name, Some(version), e));
        }

        let catalog = self.catalog.clone();
        let owned = name.to_string();
        let chunk_count = progress.chunk_ids.len();
        let Progress { chunk_ids, length } = progress;
        let chunk_size = self.chunk_size as u32;
        let record = blocking("catalog commit", move || {
            catalog.commit(&owned, version, chunk_ids, length, chunk_size)
        })
        .await
        .map_err(|e| {
            warn!(name, version, orphaned = chunk_count, error = %e, "Commit failed");
            ingest_failed(name, Some(version), e)
        })?;

        info!(name, version, bytes = record.length, chunks = chunk_count, "Version committed");
        Ok(record)
    }

    /// Read windows until the source is exhausted, keeping at most
    /// `max_in_flight` chunk writes outstanding.
    async fn write_chunks<R>(
        &self,
        source: &mut R,
        pending: &mut VecDeque<PendingWrite>,
        progress: &mut Progress,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            let mut window = vec![0u8; self.chunk_size];
            let filled = fill_window(source, &mut window)
                .await
                .map_err(StoreError::SourceRead)?;
            if filled == 0 {
                break;
            }
            window.truncate(filled);

            progress.length += filled as u64;
            if let Some(limit) = self.max_object_size {
                if progress.length > limit {
                    return Err(StoreError::ObjectTooLarge { limit });
                }
            }

            if pending.len() >= self.max_in_flight {
                if let Some(oldest) = pending.pop_front() {
                    self.finish_write(oldest, progress).await?;
                }
            }

            let store = self.chunks.clone();
            pending.push_back(tokio::task::spawn_blocking(move || store.put(&window)));

            // A short window means the source hit EOF.
            if filled < self.chunk_size {
                break;
            }
        }

        while let Some(write) = pending.pop_front() {
            self.finish_write(write, progress).await?;
        }
        Ok(())
    }

    async fn finish_write(&self, write: PendingWrite, progress: &mut Progress) -> Result<()> {
        let id = write
            .await
            .map_err(|e| StoreError::Storage(format!("chunk write task failed: {e}")))??;
        progress.chunk_ids.push(id);
        Ok(())
    }
}

/// Fill `buf` from `source`, coalescing short reads. Returns the number of
/// bytes read; less than `buf.len()` only at end of stream.
async fn fill_window<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn ingest_failed(name: &str, version: Option<u64>, source: StoreError) -> StoreError {
    StoreError::IngestFailed {
        name: name.to_string(),
        version,
        source: Box::new(source),
    }
}
