// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage subsystem — chunk store + metadata catalog.

pub mod catalog;
pub mod chunk_store;

use crate::error::{StoreError, Result};

/// Run a blocking storage call on tokio's blocking pool so file I/O never
/// stalls the async workers.
pub(crate) async fn blocking<T, F>(what: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Storage(format!("{what} task failed: {e}")))?
}
