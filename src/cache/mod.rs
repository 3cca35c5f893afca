//! On-disk, resumable cache for a downloaded object: a preallocated data
//! file plus a JSON index recording which blocks are filled.

mod platform_io;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::block_map::{BlockMap, TrackedBlockMap};
use crate::byte_range::ByteRange;
use crate::error::{Component, Error};
use crate::space_reserver;

/// A cache backed by a data file and a sibling index file.
///
/// Writers are serialised by `lock` (held exclusively across the data
/// write, the index rewrite and both fsyncs, so a crash can never observe
/// an index that claims a block is filled before its bytes are durable);
/// readers take the lock in shared mode and run concurrently with each
/// other.
pub struct LocalCache {
    data_file: Arc<File>,
    index_path: PathBuf,
    tracked: Arc<TrackedBlockMap>,
    lock: RwLock<()>,
}

impl LocalCache {
    /// Creates the data and index files for a fresh download: preallocates
    /// `content_size` bytes of backing storage and writes an all-clear
    /// index.
    pub async fn create_files(
        data_path: &Path,
        index_path: &Path,
        content_size: u64,
        block_size: u64,
        concurrency: usize,
        progress: Option<mpsc::Sender<u64>>,
    ) -> Result<Self, Error> {
        space_reserver::reserve(data_path, content_size, concurrency, progress).await?;

        let tracked = Arc::new(
            TrackedBlockMap::new(content_size, block_size)
                .map_err(|e| Error::internal(Component::Cache, e))?,
        );

        let data_path = data_path.to_path_buf();
        let data_file = tokio::task::spawn_blocking(move || {
            File::options().read(true).write(true).open(&data_path)
        })
        .await
        .map_err(|e| Error::internal(Component::Cache, e))?
        .map_err(|e| Error::internal(Component::Cache, e))?;

        let cache = LocalCache {
            data_file: Arc::new(data_file),
            index_path: index_path.to_path_buf(),
            tracked,
            lock: RwLock::new(()),
        };
        cache.persist_index().await?;
        Ok(cache)
    }

    /// Opens an existing cache for resume, reading the index back off disk.
    pub async fn open(data_path: &Path, index_path: &Path) -> Result<Self, Error> {
        let index_path_owned = index_path.to_path_buf();
        let json = tokio::task::spawn_blocking(move || std::fs::read_to_string(&index_path_owned))
            .await
            .map_err(|e| Error::internal(Component::Cache, e))?
            .map_err(|e| Error::internal(Component::Cache, e))?;

        let map = BlockMap::from_json(&json).map_err(|e| Error::internal(Component::Cache, e))?;
        let tracked = Arc::new(TrackedBlockMap::from_block_map(map));

        let data_path = data_path.to_path_buf();
        let data_file = tokio::task::spawn_blocking(move || {
            File::options().read(true).write(true).open(&data_path)
        })
        .await
        .map_err(|e| Error::internal(Component::Cache, e))?
        .map_err(|e| Error::internal(Component::Cache, e))?;

        Ok(LocalCache {
            data_file: Arc::new(data_file),
            index_path: index_path.to_path_buf(),
            tracked,
            lock: RwLock::new(()),
        })
    }

    pub fn content_size(&self) -> u64 {
        self.tracked.content_size()
    }

    pub fn block_size(&self) -> u64 {
        self.tracked.block_size()
    }

    pub fn tracked(&self) -> Arc<TrackedBlockMap> {
        self.tracked.clone()
    }

    fn block_index_and_range(&self, offset: u64) -> Result<(usize, ByteRange), Error> {
        if offset % self.block_size() != 0 || offset >= self.content_size() {
            return Err(Error::InvalidOffset {
                offset,
                reason: "offset is not a block boundary within the object",
            });
        }
        let index = (offset / self.block_size()) as usize;
        // Recomputed independently of the bitmap so validation works even
        // before any block has been observed.
        let from = offset;
        let to = ((index as u64 + 1) * self.block_size()).min(self.content_size()) - 1;
        Ok((index, ByteRange { from, to }))
    }

    /// Writes one block's worth of bytes at `offset`, then durably records
    /// it in the index. `data.len()` must match the block's exact size
    /// (the last block may be shorter than `block_size`).
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let (_, range) = self.block_index_and_range(offset)?;
        if data.len() as u64 != range.len() {
            return Err(Error::InvalidBlockSize {
                expected: range.len(),
                actual: data.len() as u64,
            });
        }

        let _guard = self.lock.write().await;

        let file = self.data_file.clone();
        let buf = data.to_vec();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            platform_io::write_at(&file, range.from, &buf)?;
            file.sync_data()
        })
        .await
        .map_err(|e| Error::internal(Component::Cache, e))?
        .map_err(|e| Error::internal(Component::Cache, e))?;

        self.tracked.set(range.from).await;
        self.persist_index().await?;
        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `offset`. Every block the range
    /// touches must already be cached.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&e| e <= self.content_size())
            .ok_or(Error::InvalidOffset {
                offset,
                reason: "range extends past the end of the object",
            })?;
        if buf.is_empty() {
            return Ok(());
        }

        let mut cursor = (offset / self.block_size()) as usize;
        loop {
            if !self.tracked.is_set(cursor as u64 * self.block_size()).await {
                return Err(Error::UncachedRange {
                    from: offset,
                    to: end - 1,
                });
            }
            let block_end = ((cursor as u64 + 1) * self.block_size()).min(self.content_size());
            if block_end >= end {
                break;
            }
            cursor += 1;
        }

        let _guard = self.lock.read().await;
        let file = self.data_file.clone();
        let mut owned = vec![0u8; buf.len()];
        owned = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            platform_io::read_at(&file, offset, &mut owned)?;
            Ok(owned)
        })
        .await
        .map_err(|e| Error::internal(Component::Cache, e))?
        .map_err(|e| Error::internal(Component::Cache, e))?;

        buf.copy_from_slice(&owned);
        Ok(())
    }

    pub async fn next_outstanding(&self, start: usize) -> Option<(usize, ByteRange)> {
        self.tracked.next_clear(start).await
    }

    pub async fn next_cached(&self, start: usize) -> Option<(usize, ByteRange)> {
        self.tracked.next_set(start).await
    }

    pub async fn complete(&self) -> bool {
        self.tracked.all_set().await
    }

    pub async fn cached_bytes_and_blocks(&self) -> (u64, u64) {
        self.tracked.set_bytes_and_blocks().await
    }

    pub fn tail_cursor(&self) -> TailCursor {
        TailCursor {
            tracked: self.tracked.clone(),
            last: self.tracked.current_head(),
        }
    }

    async fn persist_index(&self) -> Result<(), Error> {
        let json = self.tracked.snapshot_json().await;
        let index_path = self.index_path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let tmp_path = index_path.with_extension("tmp");
            {
                let mut tmp = File::create(&tmp_path)?;
                use std::io::Write;
                tmp.write_all(json.as_bytes())?;
                tmp.sync_all()?;
            }
            std::fs::rename(&tmp_path, &index_path)
        })
        .await
        .map_err(|e| Error::internal(Component::Cache, e))?
        .map_err(|e| Error::internal(Component::Cache, e))
    }

    /// Flushes and closes both files.
    pub async fn close(&self) -> Result<(), Error> {
        let file = self.data_file.clone();
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(|e| Error::internal(Component::Cache, e))?
            .map_err(|e| Error::internal(Component::Cache, e))
    }
}

/// A per-caller cursor over a cache's contiguous tail, returned by
/// [`LocalCache::tail_cursor`]. Each cursor tracks its own last-observed
/// head independently of any other caller's.
pub struct TailCursor {
    tracked: Arc<TrackedBlockMap>,
    last: Option<usize>,
}

impl TailCursor {
    /// Blocks until the tail advances past the last value returned to this
    /// cursor, or the context is cancelled.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<ByteRange, Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            head = self.tracked.wait_for_advance_past(self.last) => {
                self.last = Some(head);
                Ok(self.tracked.tail().0)
            }
        }
    }
}
