// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod retrieval;
pub mod storage;

pub use config::Config;
pub use engine::VersionedStore;
pub use error::{Result, StoreError};
pub use retrieval::{ByteStream, Download};
pub use storage::catalog::{VersionRecord, VersionSummary};
pub use storage::chunk_store::ChunkId;
