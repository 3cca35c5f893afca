//! An in-process [`RemoteObject`] serving a fixed body, with scriptable
//! failures. Stands in for a concrete transport (HTTP, a cloud-storage
//! API) the way `range_server` stands in for a live download source in
//! the engine this crate's testing style is modelled on, adapted to an
//! in-process fake since no concrete transport is in scope here.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

use largefile::{
    ByteRange, Component, Digest, DigestAlgorithm, DigestHasher, Error, Reader, RemoteObject,
    RetryToken,
};

struct MemReader(Cursor<Vec<u8>>);

impl AsyncRead for MemReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let n = std::io::Read::read(&mut self.0, buf.initialize_unfilled())?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

struct FakeToken {
    retryable: bool,
}

impl RetryToken for FakeToken {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn backoff_duration(&self) -> Option<Duration> {
        None
    }
}

/// A deterministic in-memory remote object. Ranges can be scripted to fail
/// a fixed number of times before succeeding, or to fail forever.
pub struct FakeRemote {
    body: Vec<u8>,
    block_size: u64,
    digest: Option<Digest>,
    transient_failures: Mutex<HashMap<u64, u32>>,
    permanent_failures: Mutex<HashSet<u64>>,
    delays: Mutex<HashMap<u64, Duration>>,
}

impl FakeRemote {
    pub fn new(body: Vec<u8>, block_size: u64) -> Self {
        FakeRemote {
            body,
            block_size,
            digest: None,
            transient_failures: Mutex::new(HashMap::new()),
            permanent_failures: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches a digest computed over the whole body, as a remote source
    /// that publishes a checksum alongside its content would.
    pub fn with_digest(mut self, algorithm: DigestAlgorithm) -> Self {
        let mut hasher = DigestHasher::new(algorithm);
        hasher.update(&self.body);
        self.digest = Some(hasher.finalize());
        self
    }

    /// The block starting at `offset` fails `count` times with a retryable
    /// error before succeeding.
    pub fn fail_transiently(self, offset: u64, count: u32) -> Self {
        self.transient_failures.lock().unwrap().insert(offset, count);
        self
    }

    /// The block starting at `offset` always fails with a non-retryable
    /// error.
    pub fn fail_permanently(self, offset: u64) -> Self {
        self.permanent_failures.lock().unwrap().insert(offset);
        self
    }

    /// The block starting at `offset` sleeps for `duration` before
    /// returning, letting tests force a deterministic arrival order.
    pub fn delay(self, offset: u64, duration: Duration) -> Self {
        self.delays.lock().unwrap().insert(offset, duration);
        self
    }
}

#[async_trait]
impl RemoteObject for FakeRemote {
    fn name(&self) -> &str {
        "fake"
    }

    fn content_length_and_block_size(&self) -> (u64, u64) {
        (self.body.len() as u64, self.block_size)
    }

    fn digest(&self) -> Option<Digest> {
        self.digest.clone()
    }

    async fn get_range(
        &self,
        _cancel: &CancellationToken,
        range: ByteRange,
    ) -> Result<Reader, (Error, Box<dyn RetryToken>)> {
        if self.permanent_failures.lock().unwrap().contains(&range.from) {
            return Err((
                Error::internal(Component::Download, anyhow::anyhow!("scripted permanent failure for {range}")),
                Box::new(FakeToken { retryable: false }),
            ));
        }
        {
            let mut remaining = self.transient_failures.lock().unwrap();
            if let Some(n) = remaining.get_mut(&range.from) {
                if *n > 0 {
                    *n -= 1;
                    return Err((
                        Error::internal(Component::Download, anyhow::anyhow!("scripted transient failure for {range}")),
                        Box::new(FakeToken { retryable: true }),
                    ));
                }
            }
        }
        let delay = self.delays.lock().unwrap().get(&range.from).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let slice = self.body[range.from as usize..=range.to as usize].to_vec();
        Ok(Box::new(MemReader(Cursor::new(slice))))
    }
}
