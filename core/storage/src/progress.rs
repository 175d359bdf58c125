//! Progress reporting and cooperative cancellation for long operations.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use phantomvault_common::{Error, Result};

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Short name of the running step (`copy`, `encrypt`, ...).
    pub stage: &'static str,
    /// Item that was just processed.
    pub current: PathBuf,
    /// Bytes processed so far in this step.
    pub bytes_processed: u64,
    /// Total bytes the step will process.
    pub total_bytes: u64,
}

/// Callback invoked from the worker thread. Must return quickly.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Shared flag checked between file-level steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Progress callback plus cancellation token handed down to storage calls.
#[derive(Clone, Default)]
pub struct Progress {
    callback: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl Progress {
    /// No callback, fresh token.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Attach a callback.
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Use an existing cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The token this context observes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Emit a progress event if a callback is attached.
    pub fn report(&self, stage: &'static str, current: &Path, bytes_processed: u64, total_bytes: u64) {
        if let Some(callback) = &self.callback {
            callback(&ProgressEvent {
                stage,
                current: current.to_path_buf(),
                bytes_processed,
                total_bytes,
            });
        }
    }

    /// Fail with `Error::Cancelled` if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("callback", &self.callback.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// What an operation touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationReport {
    /// Files written, in processing order.
    pub processed_paths: Vec<PathBuf>,
    /// Payload bytes processed.
    pub bytes_processed: u64,
}

impl OperationReport {
    /// Record one processed file.
    pub fn record(&mut self, path: impl Into<PathBuf>, bytes: u64) {
        self.processed_paths.push(path.into());
        self.bytes_processed += bytes;
    }

    /// Append another report.
    pub fn absorb(&mut self, other: OperationReport) {
        self.processed_paths.extend(other.processed_paths);
        self.bytes_processed += other.bytes_processed;
    }
}
