//! Reassembles out-of-order fetch responses into an in-order byte stream.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::byte_range::ByteRange;
use crate::error::{Component, Error};
use crate::remote::DigestHasher;

struct HeapEntry {
    range: ByteRange,
    data: BytesMut,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.range.from == other.range.from
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.range.from.cmp(&other.range.from)
    }
}

/// Buffers responses that arrive ahead of the contiguous tail and flushes
/// them to `writer` in order as gaps close. Held behind a single async
/// mutex in [`super::StreamingResponseHandler`] so the heap, the tracked
/// tail and the pipe write all advance as one atomic step — the pipe's
/// backpressure is what makes a slow consumer throttle the whole fetch.
pub struct ReorderBuffer<W> {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    tracking: Option<ByteRange>,
    writer: W,
    digest: Option<DigestHasher>,
    pub out_of_order: u64,
    pub max_heap_size: u64,
}

impl<W: AsyncWrite + Unpin> ReorderBuffer<W> {
    pub fn new(writer: W, digest: Option<DigestHasher>) -> Self {
        ReorderBuffer {
            heap: BinaryHeap::new(),
            tracking: None,
            writer,
            digest,
            out_of_order: 0,
            max_heap_size: 0,
        }
    }

    pub fn tracking(&self) -> Option<ByteRange> {
        self.tracking
    }

    fn next_expected(&self) -> u64 {
        self.tracking.map(|t| t.to + 1).unwrap_or(0)
    }

    /// Accepts a response, writing it (and any now-contiguous buffered
    /// responses) to the pipe, or buffering it if it arrived early.
    pub async fn accept(&mut self, range: ByteRange, data: BytesMut) -> Result<(), Error> {
        if range.from == self.next_expected() {
            self.write_and_advance(range, data).await?;
            loop {
                let top_from = self.heap.peek().map(|Reverse(e)| e.range.from);
                if top_from != Some(self.next_expected()) {
                    break;
                }
                let Reverse(entry) = self.heap.pop().expect("peeked entry must be present");
                self.write_and_advance(entry.range, entry.data).await?;
            }
        } else {
            self.heap.push(Reverse(HeapEntry { range, data }));
            self.out_of_order += 1;
            self.max_heap_size = self.max_heap_size.max(self.heap.len() as u64);
        }
        Ok(())
    }

    async fn write_and_advance(&mut self, range: ByteRange, data: BytesMut) -> Result<(), Error> {
        self.writer
            .write_all(&data)
            .await
            .map_err(|e| Error::internal(Component::Streaming, e))?;
        if let Some(hasher) = &mut self.digest {
            hasher.update(&data);
        }
        self.tracking = Some(range);
        Ok(())
    }

    /// Takes and finalises the digest hasher, if one was configured.
    pub fn finalize_digest(&mut self) -> Option<crate::remote::Digest> {
        self.digest.take().map(|h| h.finalize())
    }

    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| Error::internal(Component::Streaming, e))
    }
}
