//! A free list of transfer buffers, reused across fetches to avoid
//! re-allocating a block-sized buffer on every range request.

use std::sync::Mutex;

use bytes::BytesMut;

const MAX_POOLED: usize = 64;

pub struct BufferPool {
    block_size: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(block_size: u64) -> Self {
        BufferPool {
            block_size: block_size as usize,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Takes a buffer sized to hold at least `len` bytes, reusing a pooled
    /// one when available.
    pub fn acquire(&self, len: usize) -> BytesMut {
        let mut free = self.free.lock().unwrap();
        match free.pop() {
            Some(mut buf) if buf.capacity() >= len => {
                buf.clear();
                buf
            }
            _ => BytesMut::with_capacity(len.max(self.block_size)),
        }
    }

    /// Returns a buffer to the pool for reuse.
    pub fn release(&self, buf: BytesMut) {
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }
}
