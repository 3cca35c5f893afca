//! End-to-end tests driving the engine's two public entry points against
//! an in-process fake remote object.

mod common;

use std::sync::Arc;

use largefile::{
    BackoffPolicy, CachingDownloader, DigestAlgorithm, Error, LocalCache, SchedulerOptions,
    StreamingDownloader, StreamingOptions,
};
use tempfile::tempdir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use common::fake_remote::FakeRemote;

fn body_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn fast_options() -> SchedulerOptions {
    SchedulerOptions {
        concurrency: Some(4),
        backoff: BackoffPolicy {
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
            ..BackoffPolicy::default()
        },
        ..SchedulerOptions::default()
    }
}

#[tokio::test]
async fn caching_download_block_aligned_content() {
    let body = body_of(4096);
    let remote = Arc::new(FakeRemote::new(body.clone(), 512));
    let dir = tempdir().unwrap();
    let cache = Arc::new(
        LocalCache::create_files(&dir.path().join("d"), &dir.path().join("i"), 4096, 512, 4, None)
            .await
            .unwrap(),
    );

    let downloader = CachingDownloader::new(remote, cache.clone(), fast_options()).unwrap();
    let status = downloader.run(CancellationToken::new()).await.unwrap();

    assert!(status.complete);
    let mut buf = vec![0u8; body.len()];
    cache.read_at(0, &mut buf).await.unwrap();
    assert_eq!(buf, body);
}

#[tokio::test]
async fn caching_download_last_block_is_short() {
    let body = body_of(4096 + 37);
    let remote = Arc::new(FakeRemote::new(body.clone(), 512));
    let dir = tempdir().unwrap();
    let cache = Arc::new(
        LocalCache::create_files(
            &dir.path().join("d"),
            &dir.path().join("i"),
            body.len() as u64,
            512,
            4,
            None,
        )
        .await
        .unwrap(),
    );

    let downloader = CachingDownloader::new(remote, cache.clone(), fast_options()).unwrap();
    let status = downloader.run(CancellationToken::new()).await.unwrap();

    assert!(status.complete);
    let mut buf = vec![0u8; body.len()];
    cache.read_at(0, &mut buf).await.unwrap();
    assert_eq!(buf, body);
}

#[tokio::test]
async fn caching_download_recovers_from_transient_failure() {
    let body = body_of(2048);
    let remote = Arc::new(FakeRemote::new(body.clone(), 256).fail_transiently(512, 2));
    let dir = tempdir().unwrap();
    let cache = Arc::new(
        LocalCache::create_files(&dir.path().join("d"), &dir.path().join("i"), 2048, 256, 2, None)
            .await
            .unwrap(),
    );

    let downloader = CachingDownloader::new(remote, cache.clone(), fast_options()).unwrap();
    let status = downloader.run(CancellationToken::new()).await.unwrap();

    assert!(status.complete);
    assert!(status.stats.download_retries >= 2);
    let mut buf = vec![0u8; body.len()];
    cache.read_at(0, &mut buf).await.unwrap();
    assert_eq!(buf, body);
}

#[tokio::test]
async fn caching_download_fails_on_permanent_error() {
    let body = body_of(1024);
    let remote = Arc::new(FakeRemote::new(body, 256).fail_permanently(512));
    let dir = tempdir().unwrap();
    let cache = Arc::new(
        LocalCache::create_files(&dir.path().join("d"), &dir.path().join("i"), 1024, 256, 2, None)
            .await
            .unwrap(),
    );

    let downloader = CachingDownloader::new(remote, cache.clone(), fast_options()).unwrap();
    let err = downloader.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Internal { .. }));
    assert!(!cache.complete().await);
}

#[tokio::test]
async fn caching_download_resumes_across_cache_reopen() {
    let body = body_of(2048);
    let dir = tempdir().unwrap();
    let data_path = dir.path().join("d");
    let index_path = dir.path().join("i");

    {
        let cache = LocalCache::create_files(&data_path, &index_path, 2048, 256, 1, None)
            .await
            .unwrap();
        // Simulate a partial download, as if a previous process crashed
        // partway through.
        cache.write_at(0, &body[0..256]).await.unwrap();
        cache.write_at(256, &body[256..512]).await.unwrap();
    }

    let cache = Arc::new(LocalCache::open(&data_path, &index_path).await.unwrap());
    assert!(!cache.complete().await);

    let remote = Arc::new(FakeRemote::new(body.clone(), 256));
    let downloader = CachingDownloader::new(remote, cache.clone(), fast_options()).unwrap();
    let status = downloader.run(CancellationToken::new()).await.unwrap();

    assert!(status.complete);
    let mut buf = vec![0u8; body.len()];
    cache.read_at(0, &mut buf).await.unwrap();
    assert_eq!(buf, body);
}

#[tokio::test]
async fn caching_download_reports_cancelled_as_resumable() {
    let body = body_of(4096);
    let remote = Arc::new(FakeRemote::new(body, 256));
    let dir = tempdir().unwrap();
    let cache = Arc::new(
        LocalCache::create_files(&dir.path().join("d"), &dir.path().join("i"), 4096, 256, 2, None)
            .await
            .unwrap(),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();

    let downloader = CachingDownloader::new(remote, cache.clone(), fast_options()).unwrap();
    let status = downloader.run(cancel).await.unwrap();

    assert!(!status.complete);
    assert!(status.resumable);
    assert!(!cache.complete().await);
}

#[tokio::test]
async fn streaming_download_reassembles_in_order() {
    let body = body_of(64 * 1024);
    let remote = Arc::new(FakeRemote::new(body.clone(), 256));
    let downloader = Arc::new(StreamingDownloader::new(
        remote,
        StreamingOptions {
            scheduler: fast_options(),
            ..StreamingOptions::default()
        },
    ));

    let (mut reader, handle) = downloader.start(CancellationToken::new());
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    let status = handle.await.unwrap().unwrap();

    assert!(status.status.complete);
    assert_eq!(out, body);
}

#[tokio::test]
async fn streaming_download_verifies_digest() {
    let body = body_of(8192);
    let remote = Arc::new(FakeRemote::new(body.clone(), 512).with_digest(DigestAlgorithm::Sha256));
    let downloader = Arc::new(StreamingDownloader::new(
        remote,
        StreamingOptions {
            scheduler: fast_options(),
            verify_digest: Some(DigestAlgorithm::Sha256),
            ..StreamingOptions::default()
        },
    ));

    let (mut reader, handle) = downloader.start(CancellationToken::new());
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    let status = handle.await.unwrap().unwrap();

    assert!(status.status.complete);
    assert_eq!(out, body);
}

#[tokio::test]
async fn streaming_download_counts_out_of_order_arrivals() {
    // Offsets 4, 8, 12 arrive before the delayed offset-0 range; each of
    // the three lands in the reorder heap before offset 0 unblocks the
    // drain.
    let body = body_of(16);
    let remote = Arc::new(FakeRemote::new(body.clone(), 4).delay(0, std::time::Duration::from_millis(50)));
    let mut scheduler = fast_options();
    scheduler.concurrency = Some(4);
    let downloader = Arc::new(StreamingDownloader::new(
        remote,
        StreamingOptions {
            scheduler,
            ..StreamingOptions::default()
        },
    ));

    let (mut reader, handle) = downloader.start(CancellationToken::new());
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    let status = handle.await.unwrap().unwrap();

    assert!(status.status.complete);
    assert_eq!(out, body);
    assert_eq!(status.out_of_order, 3);
}

#[tokio::test]
async fn streaming_download_fails_when_offset_zero_is_unrecoverable() {
    let body = body_of(4096);
    let remote = Arc::new(FakeRemote::new(body, 512).fail_permanently(0));
    let downloader = Arc::new(StreamingDownloader::new(
        remote,
        StreamingOptions {
            scheduler: fast_options(),
            ..StreamingOptions::default()
        },
    ));

    let (mut reader, handle) = downloader.start(CancellationToken::new());
    let mut out = Vec::new();
    let _ = reader.read_to_end(&mut out).await;
    let status = handle.await.unwrap();

    assert!(status.is_err());
}

#[tokio::test]
async fn streaming_download_with_wait_for_completion_requeues_exhausted_blocks() {
    let body = body_of(4096);
    // Enough transient failures on a non-zero block to exhaust the retry
    // budget (2 attempts) more than once; with wait_for_completion the
    // stream re-issues the range instead of failing outright.
    let remote = Arc::new(FakeRemote::new(body.clone(), 512).fail_transiently(1536, 4));
    let mut scheduler = fast_options();
    scheduler.backoff.max_attempts = 2;
    let downloader = Arc::new(StreamingDownloader::new(
        remote,
        StreamingOptions {
            scheduler,
            wait_for_completion: true,
            ..StreamingOptions::default()
        },
    ));

    let (mut reader, handle) = downloader.start(CancellationToken::new());
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    let status = handle.await.unwrap().unwrap();

    assert!(status.status.complete);
    assert_eq!(out, body);
}
