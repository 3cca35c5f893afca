//! The generator/worker-pool core shared by `CachingDownloader` and
//! `StreamingDownloader`.
//!
//! Translates this crate's `std::thread` + `std::sync::mpsc` concurrent
//! downloader (one generator thread feeding a bounded queue, N worker
//! threads draining it) into `tokio::task::spawn` over a `flume` bounded
//! channel, since async suspension points — rate-limiter waits, retry
//! backoff, cancellation — replace the blocking curl calls the original
//! workers made.

pub mod backoff;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer_pool::BufferPool;
use crate::byte_range::ByteRange;
use crate::error::{Component, Error};
use crate::remote::{RemoteObject, Reader};

pub use backoff::BackoffPolicy;
pub use stats::{DownloadStats, DownloadStatus};
pub(crate) use stats::DownloadStatsInner;

/// Throttles worker fetches. The default does nothing.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), Error>;
}

pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn wait(&self, _cancel: &CancellationToken) -> Result<(), Error> {
        Ok(())
    }
}

/// Supplies the generator task with the next range to fetch, or `None`
/// once nothing is currently outstanding.
#[async_trait]
pub trait OutstandingRanges: Send + Sync {
    async fn next(&self) -> Option<ByteRange>;
}

/// A successfully fetched range.
pub struct Response {
    pub range: ByteRange,
    pub data: BytesMut,
}

/// Consumes a completed fetch. Caching writes it to disk; streaming feeds
/// it to the reorder buffer.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(&self, response: Response) -> Result<(), Error>;
}

/// Decides what happens to a range whose retry budget is exhausted.
/// `CachingDownloader` always propagates; `StreamingDownloader` in
/// wait-for-completion mode instead records the range for re-issue.
#[async_trait]
pub trait RetryErrorHandler: Send + Sync {
    async fn on_exhausted(&self, range: ByteRange, err: Error) -> Result<(), Error>;
}

/// Tunables for a [`Scheduler`] run. Every field has a default, the same
/// shape as this crate's other `*Policy`/`*Config` structs.
#[derive(Clone)]
pub struct SchedulerOptions {
    /// `None` resolves to the host's available parallelism.
    pub concurrency: Option<usize>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub backoff: BackoffPolicy,
    pub progress: Option<mpsc::Sender<DownloadStats>>,
    /// Bound on how long the final progress snapshot may block on a full
    /// channel before the run gives up on delivering it.
    pub progress_send_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            concurrency: None,
            rate_limiter: Arc::new(NoopRateLimiter),
            backoff: BackoffPolicy::default(),
            progress: None,
            progress_send_timeout: Duration::from_secs(5),
        }
    }
}

impl SchedulerOptions {
    pub fn resolved_concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}

/// Drives one generator task and a pool of worker tasks over a remote
/// object until a source of outstanding ranges runs dry.
pub struct Scheduler {
    remote: Arc<dyn RemoteObject>,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(remote: Arc<dyn RemoteObject>, options: SchedulerOptions) -> Self {
        Scheduler { remote, options }
    }

    /// Runs a single pass: drains `source` until it reports no more
    /// outstanding ranges (or the run is cancelled / hits a fatal error).
    pub async fn run_iteration(
        &self,
        source: Arc<dyn OutstandingRanges>,
        handler: Arc<dyn ResponseHandler>,
        retry_handler: Arc<dyn RetryErrorHandler>,
        pool: Arc<BufferPool>,
        stats: Arc<DownloadStatsInner>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        stats.inc_iterations();
        let concurrency = self.options.resolved_concurrency();
        let (tx, rx) = flume::bounded::<ByteRange>(concurrency);

        let generator = tokio::spawn(generator_loop(source, tx, cancel.clone()));

        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let ctx = WorkerContext {
                remote: self.remote.clone(),
                rx: rx.clone(),
                handler: handler.clone(),
                retry_handler: retry_handler.clone(),
                pool: pool.clone(),
                stats: stats.clone(),
                rate_limiter: self.options.rate_limiter.clone(),
                backoff: self.options.backoff,
                cancel: cancel.clone(),
                progress: self.options.progress.clone(),
            };
            workers.push(tokio::spawn(worker_loop(ctx)));
        }
        drop(rx);

        generator
            .await
            .map_err(|e| Error::internal(Component::Download, e))?;

        let mut first_err: Option<Error> = None;
        for w in workers {
            let outcome = w.await.map_err(|e| Error::internal(Component::Download, e))?;
            if let Err(e) = outcome {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn generator_loop(
    source: Arc<dyn OutstandingRanges>,
    tx: flume::Sender<ByteRange>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            n = source.next() => n,
        };
        let range = match next {
            Some(r) => r,
            None => return,
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => return,
            r = tx.send_async(range) => r,
        };
        if sent.is_err() {
            return;
        }
    }
}

struct WorkerContext {
    remote: Arc<dyn RemoteObject>,
    rx: flume::Receiver<ByteRange>,
    handler: Arc<dyn ResponseHandler>,
    retry_handler: Arc<dyn RetryErrorHandler>,
    pool: Arc<BufferPool>,
    stats: Arc<DownloadStatsInner>,
    rate_limiter: Arc<dyn RateLimiter>,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
    progress: Option<mpsc::Sender<DownloadStats>>,
}

enum FetchOutcome {
    Data(BytesMut),
    Exhausted(Error),
    Fatal(Error),
    Cancelled,
}

async fn worker_loop(ctx: WorkerContext) -> Result<(), Error> {
    while let Ok(range) = ctx.rx.recv_async().await {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Err(e) = ctx.rate_limiter.wait(&ctx.cancel).await {
            ctx.cancel.cancel();
            return Err(e);
        }

        match fetch_with_retry(&ctx, range).await {
            FetchOutcome::Data(buf) => {
                ctx.stats.add_downloaded(buf.len() as u64);
                if let Err(e) = ctx.handler.handle(Response { range, data: buf }).await {
                    ctx.cancel.cancel();
                    return Err(e);
                }
                report_progress(&ctx);
            }
            FetchOutcome::Exhausted(err) => {
                if let Err(e) = ctx.retry_handler.on_exhausted(range, err).await {
                    ctx.cancel.cancel();
                    return Err(e);
                }
            }
            FetchOutcome::Fatal(err) => {
                ctx.cancel.cancel();
                return Err(err);
            }
            FetchOutcome::Cancelled => return Err(Error::Cancelled),
        }
    }
    Ok(())
}

async fn fetch_with_retry(ctx: &WorkerContext, range: ByteRange) -> FetchOutcome {
    let mut attempt = 1u32;
    loop {
        if ctx.cancel.is_cancelled() {
            return FetchOutcome::Cancelled;
        }
        match ctx.remote.get_range(&ctx.cancel, range).await {
            Ok(reader) => {
                return match read_full(reader, range.len() as usize, &ctx.pool).await {
                    Ok(buf) => FetchOutcome::Data(buf),
                    Err(e) => FetchOutcome::Fatal(e),
                };
            }
            Err((err, token)) => {
                ctx.stats.inc_errors();
                if !token.is_retryable() {
                    return FetchOutcome::Exhausted(err);
                }
                let delay = token.backoff_duration().or_else(|| ctx.backoff.next_delay(attempt));
                let delay = match delay {
                    Some(d) => d,
                    None => return FetchOutcome::Exhausted(err),
                };
                ctx.stats.inc_retries();
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return FetchOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

async fn read_full(mut reader: Reader, len: usize, pool: &BufferPool) -> Result<BytesMut, Error> {
    let mut buf = pool.acquire(len);
    buf.resize(len, 0);
    let mut filled = 0usize;
    while filled < len {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| Error::internal(Component::Download, e))?;
        if n == 0 {
            return Err(Error::internal(
                Component::Download,
                anyhow::anyhow!("short read: {filled} of {len} bytes"),
            ));
        }
        filled += n;
    }
    Ok(buf)
}

fn report_progress(ctx: &WorkerContext) {
    if let Some(tx) = &ctx.progress {
        let _ = tx.try_send(ctx.stats.snapshot());
    }
}
