// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Versioned store: owns the chunk store and catalog and exposes the
//! ingest / retrieve / list operations consumed by the request layer.
//!
//! Construct one per process with [`VersionedStore::open`] and share it
//! behind an `Arc`; every operation takes `&self`.

use std::ops::Range;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{StoreError, Result};
use crate::ingest::IngestPipeline;
use crate::retrieval::{Download, RetrievalPipeline};
use crate::storage::blocking;
use crate::storage::catalog::{MetadataCatalog, VersionRecord, VersionSummary};
use crate::storage::chunk_store::ChunkStore;

/// Top-level engine.
pub struct VersionedStore {
    config: Config,
    chunks: Arc<ChunkStore>,
    catalog: Arc<MetadataCatalog>,
    ingest: IngestPipeline,
    retrieval: RetrievalPipeline,
}

impl VersionedStore {
    /// Open the store described by a validated [`Config`], creating the
    /// directory layout on first use.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let base = &config.storage.base_path;
        std::fs::create_dir_all(base)
            .map_err(|e| StoreError::Storage(format!("Cannot create base_path: {e}")))?;

        let catalog = Arc::new(MetadataCatalog::open(base, config.storage.sync_writes)?);
        let chunks = Arc::new(ChunkStore::open(
            base,
            config.storage.chunk_size_bytes,
            config.storage.sync_writes,
        )?);
        // Ids of committed chunks stay retired even if their files are lost.
        if let Some(id) = catalog.highest_chunk_id() {
            chunks.advance_past(id);
        }

        let ingest = IngestPipeline::new(
            chunks.clone(),
            catalog.clone(),
            config.storage.chunk_size_bytes,
            config.storage.ingest_in_flight,
        )
        .with_max_object_size(config.upload.max_object_size());
        let retrieval = RetrievalPipeline::new(chunks.clone(), catalog.clone());

        info!(
            base_path = ?base,
            chunk_size = config.storage.chunk_size_bytes,
            in_flight = config.storage.ingest_in_flight,
            versions = catalog.len(),
            "Versioned store opened"
        );

        Ok(VersionedStore { config, chunks, catalog, ingest, retrieval })
    }

    /// Pre-check an upload before its body is streamed in: content type
    /// against the allow-list and the declared size against the limit.
    pub fn admit(&self, content_type: &str, declared_len: Option<u64>) -> Result<()> {
        let upload = &self.config.upload;
        if !upload.accepts_content_type(content_type) {
            return Err(StoreError::Rejected(format!(
                "content type '{content_type}' is not accepted"
            )));
        }
        if let (Some(len), Some(limit)) = (declared_len, upload.max_object_size()) {
            if len > limit {
                return Err(StoreError::Rejected(format!(
                    "{len} bytes exceeds the {limit} byte limit"
                )));
            }
        }
        Ok(())
    }

    /// Store `source` as the next version of `name`.
    pub async fn ingest<R>(&self, name: &str, source: R) -> Result<VersionRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.ingest.ingest(name, source).await
    }

    pub async fn retrieve(&self, name: &str, version: u64) -> Result<Download> {
        self.retrieval.retrieve(name, Some(version)).await
    }

    pub async fn retrieve_latest(&self, name: &str) -> Result<Download> {
        self.retrieval.retrieve(name, None).await
    }

    /// Stream part of a version (`None` = latest).
    pub async fn retrieve_range(
        &self,
        name: &str,
        version: Option<u64>,
        range: Range<u64>,
    ) -> Result<Download> {
        self.retrieval.retrieve_range(name, version, range).await
    }

    /// Every committed version, in commit order.
    pub fn list(&self) -> Vec<VersionSummary> {
        self.catalog.list_all()
    }

    /// Committed versions of one name, ascending.
    pub fn versions(&self, name: &str) -> Vec<VersionSummary> {
        self.catalog.versions(name)
    }

    /// Remove a whole version: the record first, then its chunks.
    /// Chunks that fail to delete are left behind as orphans.
    pub async fn delete_version(&self, name: &str, version: u64) -> Result<VersionRecord> {
        let catalog = self.catalog.clone();
        let owned = name.to_string();
        let record = blocking("catalog remove", move || catalog.remove(&owned, version)).await?;

        let chunks = self.chunks.clone();
        let ids = record.chunk_ids.clone();
        let failed = blocking("chunk delete", move || {
            Ok(ids.into_iter().filter(|id| chunks.delete(*id).is_err()).count())
        })
        .await?;
        if failed > 0 {
            warn!(name, version, orphaned = failed, "Some chunks of a deleted version were not removed");
        }

        info!(name, version, chunks = record.chunk_ids.len(), "Version deleted");
        Ok(record)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.chunks
    }

    pub fn catalog(&self) -> &Arc<MetadataCatalog> {
        &self.catalog
    }

    /// Flush the catalog and release the store. In-flight operations
    /// holding their own handles finish normally.
    pub fn shutdown(self) {
        info!("Versioned store shutting down…");
        match self.catalog.sync() {
            Ok(()) => info!(versions = self.catalog.len(), "Catalog flushed"),
            Err(e) => warn!(error = %e, "Catalog flush failed"),
        }
    }
}
