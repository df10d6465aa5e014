use serde::Deserialize;
use std::path::PathBuf;
use crate::error::{StoreError, Result};

/// Largest chunk size a deployment may configure.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;
/// Upper bound on pipelined chunk writes per ingest.
pub const MAX_INGEST_IN_FLIGHT: usize = 16;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Upload admission policy (optional).
    #[serde(default)]
    pub upload: UploadConfig,
}

/// Storage parameters for the chunk store and metadata catalog.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Base directory holding `chunks/` and `catalog.log`.
    pub base_path: PathBuf,
    /// Maximum size of a single chunk. Every chunk except the last one of
    /// an object is exactly this size.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
    /// Number of chunk writes one ingest may have in flight.
    #[serde(default = "default_ingest_in_flight")]
    pub ingest_in_flight: usize,
    /// fsync every chunk and catalog entry before acknowledging it.
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

/// Limits the caller checks before handing a stream to the engine.
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Maximum accepted object size in megabytes (0 = unlimited).
    #[serde(default = "default_max_object_size_mb")]
    pub max_object_size_mb: u64,
    /// Accepted MIME types. Empty accepts anything.
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_object_size_mb: default_max_object_size_mb(),
            allowed_content_types: default_allowed_content_types(),
        }
    }
}

impl UploadConfig {
    /// Size limit in bytes, `None` when unlimited.
    pub fn max_object_size(&self) -> Option<u64> {
        match self.max_object_size_mb {
            0 => None,
            mb => Some(mb.saturating_mul(1024 * 1024)),
        }
    }

    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        if self.allowed_content_types.is_empty() {
            return true;
        }
        // Ignore parameters such as "; charset=...".
        let essence = content_type.split(';').next().unwrap_or("").trim();
        self.allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(essence))
    }
}

fn default_chunk_size() -> usize { 512 * 1024 }
fn default_ingest_in_flight() -> usize { 2 }
fn default_sync_writes() -> bool { true }
fn default_max_object_size_mb() -> u64 { 5 }
fn default_allowed_content_types() -> Vec<String> { vec!["application/pdf".to_string()] }

impl Config {
    /// Default configuration rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Config {
            storage: StorageConfig {
                base_path: base_path.into(),
                chunk_size_bytes: default_chunk_size(),
                ingest_in_flight: default_ingest_in_flight(),
                sync_writes: default_sync_writes(),
            },
            upload: UploadConfig::default(),
        }
    }

    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("Cannot read config file: {e}")))?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| StoreError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.base_path.as_os_str().is_empty() {
            return Err(StoreError::Config("base_path must not be empty".into()));
        }
        if self.storage.chunk_size_bytes == 0 {
            return Err(StoreError::Config("chunk_size_bytes must be > 0".into()));
        }
        if self.storage.chunk_size_bytes > MAX_CHUNK_SIZE {
            return Err(StoreError::Config(format!(
                "chunk_size_bytes must be <= {MAX_CHUNK_SIZE}"
            )));
        }
        if self.storage.ingest_in_flight == 0 || self.storage.ingest_in_flight > MAX_INGEST_IN_FLIGHT {
            return Err(StoreError::Config(format!(
                "ingest_in_flight must be between 1 and {MAX_INGEST_IN_FLIGHT}"
            )));
        }
        if self.upload.max_object_size_mb.checked_mul(1024 * 1024).is_none() {
            return Err(StoreError::Config(format!(
                "max_object_size_mb must be <= {}",
                u64::MAX / (1024 * 1024)
            )));
        }
        Ok(())
    }
}
