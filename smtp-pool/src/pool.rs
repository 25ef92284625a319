use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Default chunk size handed out by [`Pool::checkout`].
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// A free-list of reusable chunks, sized at least `chunk_size`. Checked-out
/// chunks are not returned to the pool automatically (no custom allocator
/// hooks are plugged into `bytes`'s refcounting); callers that want reuse
/// call [`Pool::recycle`] once they are done with a chunk, mirroring the
/// explicit give-back in NwSMTP's `buffers.h` free list.
pub struct Pool {
    chunk_size: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl Pool {
    pub fn new(chunk_size: usize) -> Arc<Pool> {
        Arc::new(Pool {
            chunk_size,
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns a zeroed buffer of at least `len` bytes, reused from the free
    /// list when possible.
    pub fn checkout(&self, len: usize) -> BytesMut {
        let cap = std::cmp::max(len, self.chunk_size);
        let mut chunk = self
            .free
            .lock()
            .expect("pool mutex poisoned")
            .pop()
            .filter(|c| c.capacity() >= len)
            .unwrap_or_else(|| BytesMut::with_capacity(cap));
        chunk.clear();
        chunk.resize(len, 0);
        chunk
    }

    /// Gives a no-longer-referenced chunk back to the free list.
    pub fn recycle(&self, mut chunk: BytesMut) {
        chunk.clear();
        self.free.lock().expect("pool mutex poisoned").push(chunk);
    }
}

impl Default for Pool {
    fn default() -> Self {
        Pool {
            chunk_size: DEFAULT_CHUNK_SIZE,
            free: Mutex::new(Vec::new()),
        }
    }
}
