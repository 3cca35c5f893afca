//! Drives the scheduler against a [`LocalCache`], making a remote object's
//! bytes resumable on local disk.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::buffer_pool::BufferPool;
use crate::byte_range::ByteRange;
use crate::cache::LocalCache;
use crate::error::{Component, Error};
use crate::remote::RemoteObject;
use crate::scheduler::{
    DownloadStats, DownloadStatsInner, DownloadStatus, OutstandingRanges, Response,
    ResponseHandler, RetryErrorHandler, Scheduler, SchedulerOptions,
};

use tokio_util::sync::CancellationToken;

/// Fetches whatever a [`LocalCache`] is missing from a [`RemoteObject`],
/// stopping once the cache is complete, cancelled, or a fetch fails in a
/// way that can't be retried away.
pub struct CachingDownloader {
    remote: Arc<dyn RemoteObject>,
    cache: Arc<LocalCache>,
    options: SchedulerOptions,
}

impl std::fmt::Debug for CachingDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingDownloader").finish_non_exhaustive()
    }
}

impl CachingDownloader {
    /// Builds a downloader, checking that the cache and the remote object
    /// agree on size and block size.
    pub fn new(
        remote: Arc<dyn RemoteObject>,
        cache: Arc<LocalCache>,
        options: SchedulerOptions,
    ) -> Result<Self, Error> {
        let (remote_size, remote_block_size) = remote.content_length_and_block_size();
        if remote_size != cache.content_size() || remote_block_size != cache.block_size() {
            return Err(Error::internal(
                Component::Cache,
                anyhow::anyhow!(
                    "cache ({} bytes / {} block size) disagrees with remote ({} bytes / {} block size)",
                    cache.content_size(),
                    cache.block_size(),
                    remote_size,
                    remote_block_size,
                ),
            ));
        }
        Ok(CachingDownloader {
            remote,
            cache,
            options,
        })
    }

    /// Runs until the cache is complete, the context is cancelled, or a
    /// non-retryable error occurs.
    pub async fn run(&self, cancel: CancellationToken) -> Result<DownloadStatus, Error> {
        let started = Instant::now();
        let stats = Arc::new(DownloadStatsInner::default());

        let (cached_bytes, cached_blocks) = self.cache.cached_bytes_and_blocks().await;
        stats.add_cached(cached_bytes, cached_blocks);

        let scheduler = Scheduler::new(self.remote.clone(), self.options.clone());
        let pool = Arc::new(BufferPool::new(self.cache.block_size()));
        let handler: Arc<dyn ResponseHandler> = Arc::new(CachingResponseHandler {
            cache: self.cache.clone(),
            pool: pool.clone(),
            stats: stats.clone(),
        });
        let retry_handler: Arc<dyn RetryErrorHandler> = Arc::new(PropagatingRetryHandler);

        let mut last_err = None;
        let mut ran_iteration = false;
        loop {
            if self.cache.complete().await {
                if !ran_iteration {
                    stats.inc_iterations();
                }
                break;
            }
            if cancel.is_cancelled() {
                last_err = Some(Error::Cancelled);
                break;
            }

            let source: Arc<dyn OutstandingRanges> = Arc::new(CachingSource {
                cache: self.cache.clone(),
                cursor: AtomicUsize::new(0),
            });

            ran_iteration = true;
            match scheduler
                .run_iteration(
                    source,
                    handler.clone(),
                    retry_handler.clone(),
                    pool.clone(),
                    stats.clone(),
                    cancel.clone(),
                )
                .await
            {
                Ok(()) => continue,
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }

        let complete = self.cache.complete().await;
        let final_stats = stats.snapshot();
        if let Some(tx) = &self.options.progress {
            let _ = tokio::time::timeout(self.options.progress_send_timeout, tx.send(final_stats)).await;
        }

        if complete {
            return Ok(DownloadStatus {
                stats: final_stats,
                resumable: true,
                complete: true,
                duration: started.elapsed(),
            });
        }

        match last_err {
            Some(e) => {
                let resumable = e.is_resumable_failure();
                if resumable {
                    Ok(DownloadStatus {
                        stats: final_stats,
                        resumable: true,
                        complete: false,
                        duration: started.elapsed(),
                    })
                } else {
                    Err(e)
                }
            }
            None => Ok(DownloadStatus {
                stats: final_stats,
                resumable: true,
                complete: false,
                duration: started.elapsed(),
            }),
        }
    }
}

struct CachingSource {
    cache: Arc<LocalCache>,
    cursor: AtomicUsize,
}

#[async_trait]
impl OutstandingRanges for CachingSource {
    async fn next(&self) -> Option<ByteRange> {
        let start = self.cursor.load(Ordering::Relaxed);
        let (resume, range) = self.cache.next_outstanding(start).await?;
        self.cursor.store(resume, Ordering::Relaxed);
        Some(range)
    }
}

struct CachingResponseHandler {
    cache: Arc<LocalCache>,
    pool: Arc<BufferPool>,
    stats: Arc<DownloadStatsInner>,
}

#[async_trait]
impl ResponseHandler for CachingResponseHandler {
    async fn handle(&self, response: Response) -> Result<(), Error> {
        self.cache.write_at(response.range.from, &response.data).await?;
        self.stats.add_cached(response.range.len(), 1);
        self.pool.release(response.data);
        Ok(())
    }
}

struct PropagatingRetryHandler;

#[async_trait]
impl RetryErrorHandler for PropagatingRetryHandler {
    async fn on_exhausted(&self, _range: ByteRange, err: Error) -> Result<(), Error> {
        Err(err)
    }
}
