//! Batch operation coordinator — chunked atomic multi-entity transactions.
//!
//! DESIGN
//! ======
//! A naive per-entity loop over K entities costs K round trips and K remote
//! re-renders; batching collapses each chunk to one transaction and one
//! observable snapshot transition. Batches larger than the store's maximum
//! are split into chunks executed sequentially, and a failure names the
//! failed chunk so the caller retries only that chunk (earlier chunks are
//! already committed).

#[cfg(test)]
#[path = "batch_test.rs"]
mod batch_test;

use tracing::debug;

use crate::error::ErrorCode;
use crate::store::{BatchOp, EntityStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch chunk {chunk} of {total} failed: {source}")]
    ChunkFailed {
        /// Zero-based index of the failed chunk. Chunks before it committed;
        /// chunks after it were not attempted.
        chunk: usize,
        total: usize,
        #[source]
        source: StoreError,
    },
}

impl ErrorCode for BatchError {
    fn error_code(&self) -> &'static str {
        "E_BATCH_CHUNK"
    }

    fn retryable(&self) -> bool {
        match self {
            Self::ChunkFailed { source, .. } => source.retryable(),
        }
    }
}

/// Run `ops` against the store in atomic chunks of at most `max_chunk`.
///
/// # Errors
///
/// `ChunkFailed` naming the first chunk that failed.
///
/// # Panics
///
/// Panics if `max_chunk` is zero.
pub async fn run_batch(store: &EntityStore, ops: &[BatchOp], max_chunk: usize) -> Result<(), BatchError> {
    assert!(max_chunk > 0, "max_chunk must be positive");
    if ops.is_empty() {
        return Ok(());
    }
    let total = ops.len().div_ceil(max_chunk);
    if total > 1 {
        debug!(ops = ops.len(), chunks = total, "batch exceeds max chunk size; splitting");
    }
    for (chunk, group) in ops.chunks(max_chunk).enumerate() {
        store
            .apply_batch(group)
            .await
            .map_err(|source| BatchError::ChunkFailed { chunk, total, source })?;
    }
    Ok(())
}

/// The range of `ops` indices covered by a chunk, for retrying a failed chunk.
#[must_use]
pub fn chunk_range(chunk: usize, max_chunk: usize, ops_len: usize) -> std::ops::Range<usize> {
    let start = chunk * max_chunk;
    start..ops_len.min(start + max_chunk)
}
