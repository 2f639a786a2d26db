//! Chunked transmission to a writable endpoint.
//!
//! The printer never reports buffer drain, so every write except the last is
//! followed by a fixed inter-chunk delay, whatever the write mode. A platform
//! "ready to send" signal would be a better pacing source where one exists.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::{WritableEndpoint, WriteMode};
use crate::{PrinterError, Result};

/// Default chunk size in bytes (fits a 185-byte ATT MTU).
pub const DEFAULT_CHUNK_SIZE: usize = 180;

/// Default delay between chunks, for either write mode.
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(10);

/// Chunking and pacing options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitOptions {
    /// Maximum bytes per write.
    pub chunk_size: usize,
    /// Delay after each unacknowledged write except the last.
    pub chunk_delay: Duration,
    /// Delay after each acknowledged write except the last.
    pub acknowledged_chunk_delay: Duration,
}

impl Default for TransmitOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: DEFAULT_CHUNK_DELAY,
            acknowledged_chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }
}

impl TransmitOptions {
    fn delay_for(&self, mode: WriteMode) -> Duration {
        match mode {
            WriteMode::WithoutResponse => self.chunk_delay,
            WriteMode::WithResponse => self.acknowledged_chunk_delay,
        }
    }
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: usize,
    pub chunks: usize,
    pub elapsed: Duration,
}

/// Number of writes needed for `len` bytes.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

/// Write `data` to `endpoint` in order, in chunks of at most `chunk_size`.
///
/// Returns [`PrinterError::TransferAborted`] as soon as `cancel` fires; no
/// further chunks are written and nothing is resumed.
pub async fn transmit(
    endpoint: &dyn WritableEndpoint,
    data: &[u8],
    options: &TransmitOptions,
    cancel: &CancellationToken,
) -> Result<TransferReport> {
    let chunk_size = options.chunk_size.max(1);
    let mode = endpoint.write_mode();
    let delay = options.delay_for(mode);
    let total = chunk_count(data.len(), chunk_size);
    let started = Instant::now();

    tracing::debug!(
        chunk_count = total,
        chunk_size,
        total_bytes = data.len(),
        ?mode,
        "Writing data in chunks"
    );

    for (i, chunk) in data.chunks(chunk_size).enumerate() {
        if cancel.is_cancelled() {
            return Err(aborted(i, total));
        }

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(aborted(i, total)),
            result = endpoint.write_chunk(chunk) => result,
        };
        if let Err(err) = written {
            if cancel.is_cancelled() {
                return Err(aborted(i, total));
            }
            return Err(PrinterError::Write(format!("chunk {}/{}: {}", i + 1, total, err)));
        }

        if i + 1 < total && !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(aborted(i + 1, total)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    Ok(TransferReport {
        bytes: data.len(),
        chunks: total,
        elapsed: started.elapsed(),
    })
}

fn aborted(sent_chunks: usize, total: usize) -> PrinterError {
    tracing::warn!(sent_chunks, total, "Transfer aborted");
    PrinterError::TransferAborted
}
