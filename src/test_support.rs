//! A minimal in-process [`RemoteObject`] for unit tests elsewhere in this
//! crate. Integration tests under `tests/` use a richer fake of their own
//! built purely against the public API.
#![cfg(test)]

use async_trait::async_trait;
use std::io::Cursor;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::byte_range::ByteRange;
use crate::error::Error;
use crate::remote::{Digest, Reader, RemoteObject, RetryToken};

/// Adapts an in-memory `Cursor` (always ready, never blocks) to `AsyncRead`.
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

/// Serves deterministic bytes (`offset as u8` repeating) for any range
/// within `[0, content_size)`.
pub struct FakeRemote {
    content_size: u64,
    block_size: u64,
}

impl FakeRemote {
    pub fn new(content_size: u64, block_size: u64) -> Self {
        FakeRemote {
            content_size,
            block_size,
        }
    }

    fn bytes_for(&self, range: ByteRange) -> Vec<u8> {
        (range.from..=range.to).map(|i| (i % 251) as u8).collect()
    }
}

#[async_trait]
impl RemoteObject for FakeRemote {
    fn name(&self) -> &str {
        "fake"
    }

    fn content_length_and_block_size(&self) -> (u64, u64) {
        (self.content_size, self.block_size)
    }

    fn digest(&self) -> Option<Digest> {
        None
    }

    async fn get_range(
        &self,
        _cancel: &CancellationToken,
        range: ByteRange,
    ) -> Result<Reader, (Error, Box<dyn RetryToken>)> {
        let data = self.bytes_for(range);
        Ok(Box::new(MemReader(Cursor::new(data))))
    }
}
