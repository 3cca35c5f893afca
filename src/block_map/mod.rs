//! Block-level completion bitmap and its JSON wire format.

mod json;
mod tracked;

pub use tracked::TrackedBlockMap;

use crate::byte_range::ByteRange;

/// Errors specific to constructing or parsing a [`BlockMap`].
#[derive(Debug, thiserror::Error)]
pub enum BlockMapError {
    #[error("block size must be positive")]
    NonPositiveBlockSize,
    #[error("bitmap bytes are empty but blocks are expected")]
    EmptyRanges,
    #[error("invalid block map json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("content_size must be a decimal string, not a bare json number")]
    ContentSizeNotString,
}

/// A flat, bit-packed record of which fixed-size blocks of an object have
/// been filled. Bit `i` (LSB of byte `i / 8`) corresponds to block `i`;
/// the last block may be shorter than `block_size` when `content_size`
/// isn't a multiple of it.
///
/// Generalises the segment completion bitmap this crate's download engine
/// is modelled on, from a count-only bitmap to one that additionally
/// carries `content_size`/`block_size` so it round-trips through JSON on
/// its own.
#[derive(Debug, Clone)]
pub struct BlockMap {
    content_size: u64,
    block_size: u64,
    bits: Vec<u8>,
}

impl BlockMap {
    /// A fresh map with every block clear.
    pub fn new(content_size: u64, block_size: u64) -> Result<Self, BlockMapError> {
        if block_size == 0 {
            return Err(BlockMapError::NonPositiveBlockSize);
        }
        let num_blocks = Self::num_blocks_for(content_size, block_size);
        let bits = vec![0u8; (num_blocks + 7) / 8];
        Ok(BlockMap {
            content_size,
            block_size,
            bits,
        })
    }

    fn num_blocks_for(content_size: u64, block_size: u64) -> usize {
        if content_size == 0 {
            0
        } else {
            ((content_size + block_size - 1) / block_size) as usize
        }
    }

    pub fn content_size(&self) -> u64 {
        self.content_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        Self::num_blocks_for(self.content_size, self.block_size)
    }

    /// Byte range covered by block `index`, or `None` if out of range.
    pub fn block_range(&self, index: usize) -> Option<ByteRange> {
        if index >= self.num_blocks() {
            return None;
        }
        let from = index as u64 * self.block_size;
        let to = ((index as u64 + 1) * self.block_size).min(self.content_size) - 1;
        ByteRange::new(from, to).ok()
    }

    /// Index of the block containing `offset`, or `None` if out of range.
    pub fn block_index_for_offset(&self, offset: u64) -> Option<usize> {
        if offset >= self.content_size {
            return None;
        }
        Some((offset / self.block_size) as usize)
    }

    pub fn set_index(&mut self, index: usize) {
        if index >= self.num_blocks() {
            return;
        }
        let byte = index / 8;
        let bit = index % 8;
        self.bits[byte] |= 1 << bit;
    }

    pub fn clear_index(&mut self, index: usize) {
        if index >= self.num_blocks() {
            return;
        }
        let byte = index / 8;
        let bit = index % 8;
        self.bits[byte] &= !(1 << bit);
    }

    pub fn is_set_index(&self, index: usize) -> bool {
        if index >= self.num_blocks() {
            return false;
        }
        let byte = index / 8;
        let bit = index % 8;
        (self.bits[byte] & (1 << bit)) != 0
    }

    /// Marks the block containing `offset` as set.
    pub fn set(&mut self, offset: u64) {
        if let Some(idx) = self.block_index_for_offset(offset) {
            self.set_index(idx);
        }
    }

    pub fn is_set(&self, offset: u64) -> bool {
        self.block_index_for_offset(offset)
            .map(|idx| self.is_set_index(idx))
            .unwrap_or(false)
    }

    pub fn is_clear(&self, offset: u64) -> bool {
        !self.is_set(offset)
    }

    /// First clear block at or after `start`, and the resume index to pass
    /// on the next call. `None` once every block from `start` onward is set.
    pub fn next_clear(&self, start: usize) -> Option<(usize, ByteRange)> {
        let total = self.num_blocks();
        let mut i = start;
        while i < total {
            if !self.is_set_index(i) {
                let range = self.block_range(i)?;
                return Some((i + 1, range));
            }
            i += 1;
        }
        None
    }

    /// First set block at or after `start`, and the resume index to pass on
    /// the next call. `None` once every block from `start` onward is clear.
    pub fn next_set(&self, start: usize) -> Option<(usize, ByteRange)> {
        let total = self.num_blocks();
        let mut i = start;
        while i < total {
            if self.is_set_index(i) {
                let range = self.block_range(i)?;
                return Some((i + 1, range));
            }
            i += 1;
        }
        None
    }

    /// True if every block in `[0, num_blocks())` is set.
    pub fn all_set(&self) -> bool {
        self.next_clear(0).is_none()
    }

    /// Total bytes and blocks currently marked set.
    pub fn set_bytes_and_blocks(&self) -> (u64, u64) {
        let mut bytes = 0u64;
        let mut blocks = 0u64;
        for i in 0..self.num_blocks() {
            if self.is_set_index(i) {
                if let Some(r) = self.block_range(i) {
                    bytes += r.len();
                    blocks += 1;
                }
            }
        }
        (bytes, blocks)
    }

    /// Length of the contiguous run of set blocks starting at block 0, or
    /// `None` if block 0 itself isn't set.
    pub fn contiguous_head(&self) -> Option<usize> {
        if self.num_blocks() == 0 || !self.is_set_index(0) {
            return None;
        }
        let mut head = 0usize;
        while head + 1 < self.num_blocks() && self.is_set_index(head + 1) {
            head += 1;
        }
        Some(head)
    }

    pub fn to_json(&self) -> String {
        json::to_json(self)
    }

    pub fn from_json(s: &str) -> Result<Self, BlockMapError> {
        json::from_json(s)
    }
}
