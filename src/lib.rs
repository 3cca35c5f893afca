//! A concurrent, resumable, rate-limited engine for fetching a remote
//! object's bytes by HTTP range request.
//!
//! Two entry points cover the two ways callers consume a remote object:
//!
//! - [`CachingDownloader`] fills a [`LocalCache`] backed by a data file and
//!   a JSON index, resumable across restarts.
//! - [`StreamingDownloader`] reassembles range responses in order and
//!   exposes them to a single consumer as an [`tokio::io::AsyncRead`],
//!   without touching disk.
//!
//! Both sit on top of the same [`Scheduler`]: a generator task produces
//! outstanding [`ByteRange`]s, a pool of worker tasks fetches them from a
//! [`RemoteObject`] with retry and backoff, and a [`ResponseHandler`]
//! decides what happens to each completed fetch.

mod block_map;
mod buffer_pool;
mod byte_range;
mod cache;
mod caching_downloader;
mod error;
mod remote;
mod scheduler;
mod space_reserver;
mod streaming;

#[cfg(test)]
mod test_support;

pub use block_map::{BlockMap, BlockMapError, TrackedBlockMap};
pub use buffer_pool::BufferPool;
pub use byte_range::ByteRange;
pub use cache::{LocalCache, TailCursor};
pub use caching_downloader::CachingDownloader;
pub use error::{Component, Error};
pub use remote::{Digest, DigestAlgorithm, DigestHasher, Reader, RemoteObject, RetryToken};
pub use scheduler::{
    BackoffPolicy, DownloadStats, DownloadStatus, NoopRateLimiter, OutstandingRanges,
    RateLimiter, Response, ResponseHandler, RetryErrorHandler, Scheduler, SchedulerOptions,
};
pub use streaming::{StreamReader, StreamingDownloader, StreamingOptions, StreamingStatus};
