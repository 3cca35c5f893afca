//! Fetches a remote object as a single ordered byte stream, without ever
//! touching disk.

mod reorder;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::block_map::{BlockMap, TrackedBlockMap};
use crate::buffer_pool::BufferPool;
use crate::byte_range::ByteRange;
use crate::error::{Component, Error};
use crate::remote::{DigestAlgorithm, DigestHasher, RemoteObject};
use crate::scheduler::{
    DownloadStats, DownloadStatsInner, DownloadStatus, OutstandingRanges, Response,
    ResponseHandler, RetryErrorHandler, Scheduler, SchedulerOptions,
};

use reorder::ReorderBuffer;

/// Outcome of a [`StreamingDownloader`] run: the shared status plus the
/// reorder buffer's out-of-order counters.
#[derive(Debug, Clone, Copy)]
pub struct StreamingStatus {
    pub status: DownloadStatus,
    pub out_of_order: u64,
    pub max_out_of_order: u64,
}

/// Options specific to streaming, layered on top of the shared scheduler
/// tunables.
#[derive(Clone, Default)]
pub struct StreamingOptions {
    pub scheduler: SchedulerOptions,
    /// Keep retrying failed ranges (other than the one covering offset 0)
    /// indefinitely instead of failing the whole stream on the first
    /// unrecoverable range.
    pub wait_for_completion: bool,
    /// Verify the stream against the remote object's published digest, or
    /// this algorithm if the remote doesn't publish one.
    pub verify_digest: Option<DigestAlgorithm>,
}

/// Fetches a remote object and presents it to a single consumer as an
/// ordered `AsyncRead`, reassembling out-of-order range responses as they
/// arrive.
pub struct StreamingDownloader {
    remote: Arc<dyn RemoteObject>,
    options: StreamingOptions,
}

impl StreamingDownloader {
    pub fn new(remote: Arc<dyn RemoteObject>, options: StreamingOptions) -> Self {
        StreamingDownloader { remote, options }
    }

    /// Starts the background fetch and returns a reader the caller can
    /// consume at its own pace, plus a handle that resolves once the
    /// fetch finishes (successfully or not).
    pub fn start(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> (StreamReader, tokio::task::JoinHandle<Result<StreamingStatus, Error>>) {
        let (content_size, block_size) = self.remote.content_length_and_block_size();
        let (pipe_write, pipe_read) = tokio::io::duplex(block_size.min(1 << 20).max(1) as usize * 4);

        let terminal_error = Arc::new(StdMutex::new(None));
        let reader = StreamReader {
            inner: pipe_read,
            terminal_error: terminal_error.clone(),
            reported: false,
        };

        let handle = tokio::spawn(async move {
            let result = self.run(pipe_write, content_size, block_size, cancel).await;
            if let Err(e) = &result {
                *terminal_error.lock().unwrap() = Some(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
            }
            result
        });

        (reader, handle)
    }

    async fn run(
        &self,
        pipe_write: tokio::io::DuplexStream,
        content_size: u64,
        block_size: u64,
        cancel: CancellationToken,
    ) -> Result<StreamingStatus, Error> {
        let started = Instant::now();
        let stats = Arc::new(DownloadStatsInner::default());

        let algorithm = self.options.verify_digest.or_else(|| self.remote.digest().map(|d| d.algorithm));
        let expected_digest = self.remote.digest();
        let hasher = algorithm.map(DigestHasher::new);

        let tracked = Arc::new(
            TrackedBlockMap::new(content_size, block_size).map_err(|e| Error::internal(Component::Streaming, e))?,
        );
        let issued = StdMutex::new(
            BlockMap::new(content_size, block_size).map_err(|e| Error::internal(Component::Streaming, e))?,
        );

        let state = Arc::new(StreamingState {
            issued,
            issued_cursor: AtomicUsize::new(0),
            retry_queue: Mutex::new(VecDeque::new()),
            retry_notify: Notify::new(),
            tracked: tracked.clone(),
            wait_for_completion: self.options.wait_for_completion,
        });

        let reorder = Arc::new(Mutex::new(ReorderBuffer::new(pipe_write, hasher)));

        let scheduler = Scheduler::new(self.remote.clone(), self.options.scheduler.clone());
        let pool = Arc::new(BufferPool::new(block_size));
        let handler: Arc<dyn ResponseHandler> = Arc::new(StreamingResponseHandler {
            reorder: reorder.clone(),
            tracked: tracked.clone(),
            stats: stats.clone(),
        });
        let retry_handler: Arc<dyn RetryErrorHandler> = Arc::new(StreamingRetryHandler {
            state: state.clone(),
        });

        let mut run_result = scheduler
            .run_iteration(state.clone(), handler, retry_handler, pool, stats.clone(), cancel.clone())
            .await;
        if run_result.is_ok() && cancel.is_cancelled() {
            run_result = Err(Error::Cancelled);
        }

        let mut guard = reorder.lock().await;
        let _ = guard.shutdown().await;
        let final_digest = guard.finalize_digest();
        let out_of_order = guard.out_of_order;
        let max_out_of_order = guard.max_heap_size;
        drop(guard);

        if let (Some(expected), Some(actual)) = (&expected_digest, &final_digest) {
            if expected.bytes != actual.bytes {
                return Err(Error::internal(
                    Component::Streaming,
                    anyhow::anyhow!("digest mismatch: expected {}, got {}", expected.hex(), actual.hex()),
                ));
            }
        }

        run_result?;

        let final_stats = stats.snapshot();
        Ok(StreamingStatus {
            status: DownloadStatus {
                stats: final_stats,
                resumable: false,
                complete: true,
                duration: started.elapsed(),
            },
            out_of_order,
            max_out_of_order,
        })
    }
}

struct StreamingState {
    issued: StdMutex<BlockMap>,
    issued_cursor: AtomicUsize,
    retry_queue: Mutex<VecDeque<ByteRange>>,
    retry_notify: Notify,
    tracked: Arc<TrackedBlockMap>,
    wait_for_completion: bool,
}

impl StreamingState {
    fn next_issuable(&self) -> Option<ByteRange> {
        let mut issued = self.issued.lock().unwrap();
        let start = self.issued_cursor.load(Ordering::Relaxed);
        let (resume, range) = issued.next_clear(start)?;
        issued.set(range.from);
        self.issued_cursor.store(resume, Ordering::Relaxed);
        Some(range)
    }
}

#[async_trait]
impl OutstandingRanges for StreamingState {
    async fn next(&self) -> Option<ByteRange> {
        loop {
            {
                let mut retry_queue = self.retry_queue.lock().await;
                if let Some(range) = retry_queue.pop_front() {
                    return Some(range);
                }
            }
            if let Some(range) = self.next_issuable() {
                return Some(range);
            }
            if !self.wait_for_completion || self.tracked.all_set().await {
                return None;
            }
            let notified = self.retry_notify.notified();
            let last_head = self.tracked.current_head();
            tokio::select! {
                _ = notified => {}
                _ = self.tracked.wait_for_advance_past(last_head) => {}
            }
        }
    }
}

struct StreamingResponseHandler {
    reorder: Arc<Mutex<ReorderBuffer<tokio::io::DuplexStream>>>,
    tracked: Arc<TrackedBlockMap>,
    stats: Arc<DownloadStatsInner>,
}

#[async_trait]
impl ResponseHandler for StreamingResponseHandler {
    async fn handle(&self, response: Response) -> Result<(), Error> {
        let mut guard = self.reorder.lock().await;
        guard.accept(response.range, response.data).await?;
        drop(guard);
        self.stats.add_cached(response.range.len(), 1);
        self.tracked.set(response.range.from).await;
        Ok(())
    }
}

struct StreamingRetryHandler {
    state: Arc<StreamingState>,
}

#[async_trait]
impl RetryErrorHandler for StreamingRetryHandler {
    async fn on_exhausted(&self, range: ByteRange, err: Error) -> Result<(), Error> {
        if range.from == 0 {
            return Err(Error::internal(
                Component::Streaming,
                anyhow::anyhow!("range covering offset 0 failed permanently: {err}"),
            ));
        }
        if self.state.wait_for_completion {
            self.state.retry_queue.lock().await.push_back(range);
            self.state.retry_notify.notify_waiters();
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// The consumer-facing half of a streaming download. Implements
/// `AsyncRead`; once the underlying pipe reaches EOF, surfaces the fetch's
/// terminal error (if any) instead of a clean end-of-stream.
pub struct StreamReader {
    inner: tokio::io::DuplexStream,
    terminal_error: Arc<StdMutex<Option<std::io::Error>>>,
    reported: bool,
}

impl AsyncRead for StreamReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() == before && !this.reported {
                    if let Some(err) = this.terminal_error.lock().unwrap().take() {
                        this.reported = true;
                        return Poll::Ready(Err(err));
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRemote;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn streams_bytes_in_order() {
        let remote = Arc::new(FakeRemote::new(1000, 64));
        let downloader = Arc::new(StreamingDownloader::new(remote, StreamingOptions::default()));
        let (mut reader, handle) = downloader.start(CancellationToken::new());

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        let status = handle.await.unwrap().unwrap();

        assert!(status.status.complete);
        assert_eq!(out.len(), 1000);
        let expected: Vec<u8> = (0u64..1000).map(|i| (i % 251) as u8).collect();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn cancelling_before_start_fails_the_run() {
        let remote = Arc::new(FakeRemote::new(1 << 20, 64));
        let downloader = Arc::new(StreamingDownloader::new(remote, StreamingOptions::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (mut reader, handle) = downloader.start(cancel);

        let mut out = Vec::new();
        let _ = reader.read_to_end(&mut out).await;
        let status = handle.await.unwrap();
        assert!(status.is_err());
    }
}
