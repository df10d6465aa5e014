use thiserror::Error;

use crate::storage::chunk_store::ChunkId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying durable storage failed (message carries context).
    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("'{name}' {} not found", describe_version(.version))]
    NotFound { name: String, version: Option<u64> },

    #[error("Chunk {0} not found")]
    ChunkNotFound(ChunkId),

    #[error("Chunk {id} is corrupt: {reason}")]
    CorruptChunk { id: ChunkId, reason: String },

    #[error("Version {version} of '{name}' is already committed")]
    Conflict { name: String, version: u64 },

    /// A commit whose chunk list does not match its length.
    #[error("Invalid version record: {0}")]
    InvalidRecord(String),

    #[error("Version {version} of '{name}' is corrupted: {reason}")]
    CorruptedVersion { name: String, version: u64, reason: String },

    #[error("Ingest of '{name}' ({}) failed: {source}", describe_version(.version))]
    IngestFailed {
        name: String,
        version: Option<u64>,
        #[source]
        source: Box<StoreError>,
    },

    /// The inbound byte stream failed or was aborted mid-read.
    #[error("Source stream error: {0}")]
    SourceRead(#[source] std::io::Error),

    #[error("Object exceeds the {limit} byte limit")]
    ObjectTooLarge { limit: u64 },

    #[error("Chunk of {len} bytes exceeds the {limit} byte chunk size")]
    ChunkTooLarge { len: usize, limit: usize },

    #[error("Invalid object name: {0}")]
    InvalidName(String),

    #[error("Invalid range {start}..{end} for object of {length} bytes")]
    InvalidRange { start: u64, end: u64, length: u64 },

    #[error("Upload rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    /// True when a version record (not a chunk) could not be resolved.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// True for integrity violations of committed data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::CorruptedVersion { .. } | StoreError::CorruptChunk { .. }
        )
    }
}

fn describe_version(version: &Option<u64>) -> String {
    match version {
        Some(v) => format!("version {v}"),
        None => "latest version".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
