//! Download progress counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A point-in-time snapshot of a scheduler run's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DownloadStats {
    pub cached_or_streamed_bytes: u64,
    pub cached_or_streamed_blocks: u64,
    pub downloaded_bytes: u64,
    pub downloaded_blocks: u64,
    pub download_retries: u64,
    pub download_errors: u64,
    pub iterations: u64,
}

/// Outcome of a `CachingDownloader`/`StreamingDownloader` run.
#[derive(Debug, Clone, Copy)]
pub struct DownloadStatus {
    pub stats: DownloadStats,
    pub resumable: bool,
    pub complete: bool,
    pub duration: Duration,
}

/// Atomic counters updated concurrently by scheduler workers, snapshotted
/// into a [`DownloadStats`] for progress reporting.
#[derive(Default)]
pub struct DownloadStatsInner {
    cached_or_streamed_bytes: AtomicU64,
    cached_or_streamed_blocks: AtomicU64,
    downloaded_bytes: AtomicU64,
    downloaded_blocks: AtomicU64,
    download_retries: AtomicU64,
    download_errors: AtomicU64,
    iterations: AtomicU64,
}

impl DownloadStatsInner {
    pub fn add_cached(&self, bytes: u64, blocks: u64) {
        self.cached_or_streamed_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.cached_or_streamed_blocks.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.downloaded_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.download_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.download_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_iterations(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DownloadStats {
        DownloadStats {
            cached_or_streamed_bytes: self.cached_or_streamed_bytes.load(Ordering::Relaxed),
            cached_or_streamed_blocks: self.cached_or_streamed_blocks.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            downloaded_blocks: self.downloaded_blocks.load(Ordering::Relaxed),
            download_retries: self.download_retries.load(Ordering::Relaxed),
            download_errors: self.download_errors.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
        }
    }
}
