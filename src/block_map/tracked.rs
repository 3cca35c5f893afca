//! An async-friendly `BlockMap` that also tracks its contiguous head and
//! lets waiters park on advances without missing a wakeup.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::{Notify, RwLock};

use crate::byte_range::ByteRange;

use super::{BlockMap, BlockMapError};

/// Wraps a [`BlockMap`] behind an async `RwLock`, plus a `Notify` that fires
/// whenever the contiguous run of set blocks starting at block 0 grows.
///
/// `tokio::sync::Notify`'s "register before checking" pattern is the
/// idiomatic standalone replacement for a one-shot channel swapped under a
/// write lock: a caller builds the `Notified` future first, re-checks the
/// head under a read lock, and only awaits the future if the head hasn't
/// already moved — so a notification fired between the check and the
/// `.await` is never missed.
pub struct TrackedBlockMap {
    inner: RwLock<BlockMap>,
    head: AtomicI64,
    notify: Notify,
    content_size: u64,
    block_size: u64,
}

impl TrackedBlockMap {
    pub fn new(content_size: u64, block_size: u64) -> Result<Self, BlockMapError> {
        Ok(Self::from_block_map(BlockMap::new(content_size, block_size)?))
    }

    pub fn from_block_map(map: BlockMap) -> Self {
        let content_size = map.content_size();
        let block_size = map.block_size();
        let head = match map.contiguous_head() {
            Some(h) => h as i64,
            None => -1,
        };
        TrackedBlockMap {
            inner: RwLock::new(map),
            head: AtomicI64::new(head),
            notify: Notify::new(),
            content_size,
            block_size,
        }
    }

    pub fn content_size(&self) -> u64 {
        self.content_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Index of the last block in the leading contiguous run, if any.
    pub fn current_head(&self) -> Option<usize> {
        let h = self.head.load(Ordering::Acquire);
        if h < 0 {
            None
        } else {
            Some(h as usize)
        }
    }

    /// Marks the block containing `offset` set, advancing and notifying the
    /// contiguous head if this closes a gap at the front.
    pub async fn set(&self, offset: u64) {
        let mut advanced = false;
        {
            let mut guard = self.inner.write().await;
            guard.set(offset);
            let mut head = self.head.load(Ordering::Acquire);
            let mut next = (head + 1) as usize;
            while next < guard.num_blocks() && guard.is_set_index(next) {
                head = next as i64;
                next += 1;
                advanced = true;
            }
            self.head.store(head, Ordering::Release);
        }
        if advanced {
            self.notify.notify_waiters();
        }
    }

    pub async fn is_set(&self, offset: u64) -> bool {
        self.inner.read().await.is_set(offset)
    }

    pub async fn is_clear(&self, offset: u64) -> bool {
        self.inner.read().await.is_clear(offset)
    }

    pub async fn next_clear(&self, start: usize) -> Option<(usize, ByteRange)> {
        self.inner.read().await.next_clear(start)
    }

    pub async fn next_set(&self, start: usize) -> Option<(usize, ByteRange)> {
        self.inner.read().await.next_set(start)
    }

    pub async fn all_set(&self) -> bool {
        self.inner.read().await.all_set()
    }

    pub async fn set_bytes_and_blocks(&self) -> (u64, u64) {
        self.inner.read().await.set_bytes_and_blocks()
    }

    pub async fn snapshot_json(&self) -> String {
        self.inner.read().await.to_json()
    }

    /// Current contiguous tail, and whether any bytes are present at all.
    /// Open question resolution: when no blocks are set, the returned range
    /// is a meaningless placeholder and callers must not read it unless
    /// `present` is `true`.
    pub fn tail(&self) -> (ByteRange, bool) {
        match self.current_head() {
            None => (ByteRange { from: 0, to: 0 }, false),
            Some(head) => {
                let end = (((head as u64) + 1) * self.block_size).min(self.content_size) - 1;
                (ByteRange { from: 0, to: end }, true)
            }
        }
    }

    /// Waits until the contiguous head advances past `last_seen`
    /// (`None` meaning "nothing observed yet"), returning the new head.
    pub async fn wait_for_advance_past(&self, last_seen: Option<usize>) -> usize {
        let last_seen = last_seen.map(|v| v as i64).unwrap_or(-1);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let current = self.head.load(Ordering::Acquire);
            if current > last_seen {
                return current as usize;
            }
            notified.await;
        }
    }
}
