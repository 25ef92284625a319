use std::{cmp, collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};

use crate::pool::Pool;

/// A growable, chunked input buffer: [`prepare`](Streambuf::prepare) exposes
/// spare capacity to read into, [`commit`](Streambuf::commit) publishes
/// however much of it was actually filled as an immutable, shareable
/// [`Bytes`] view, and [`consume`](Streambuf::consume) drops bytes already
/// handled off the front. Committed chunks are never copied again: readers
/// downstream (the EOM parser, the header parser, the DKIM verifier) all
/// borrow from the same underlying allocation. Grounded on NwSMTP's
/// `buffers.h`/`buffer_iterator.h` chunked-buffer design.
pub struct Streambuf {
    pool: Arc<Pool>,
    committed: VecDeque<Bytes>,
    /// Total length of `committed`, kept so callers can query the buffer's
    /// size without re-summing the deque.
    committed_len: usize,
    tail: BytesMut,
    filled: usize,
}

impl Streambuf {
    pub fn new(pool: Arc<Pool>) -> Streambuf {
        Streambuf {
            pool,
            committed: VecDeque::new(),
            committed_len: 0,
            tail: BytesMut::new(),
            filled: 0,
        }
    }

    /// Returns at least `n` bytes of spare capacity to read/write into.
    /// Must be followed by a call to [`commit`](Streambuf::commit) with how
    /// much of it actually holds valid data before the next `prepare` call.
    pub fn prepare(&mut self, n: usize) -> &mut [u8] {
        if self.tail.len() - self.filled < n {
            self.tail = self.pool.checkout(n);
            self.filled = 0;
        }
        &mut self.tail[self.filled..self.filled + n]
    }

    /// Publishes the first `k` bytes of the space handed out by the last
    /// `prepare` call. `k` may be less than what was prepared ("split, not
    /// copy"): the rest of the tail chunk remains available for the next
    /// `prepare`.
    pub fn commit(&mut self, k: usize) {
        self.filled += k;
        assert!(self.filled <= self.tail.len(), "commit past prepared length");
        if self.filled > 0 {
            let published = self.tail.split_to(self.filled).freeze();
            self.filled = 0;
            self.committed_len += published.len();
            self.committed.push_back(published);
        }
    }

    /// Drops the first `k` committed bytes.
    pub fn consume(&mut self, mut k: usize) {
        assert!(k <= self.committed_len, "consume past committed length");
        self.committed_len -= k;
        while k > 0 {
            let front = self.committed.front_mut().expect("consume underflow");
            if front.len() <= k {
                k -= front.len();
                self.committed.pop_front();
            } else {
                let _ = front.split_to(k);
                k = 0;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.committed_len
    }

    pub fn is_empty(&self) -> bool {
        self.committed_len == 0
    }

    /// Iterates the committed chunks in order, without copying.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.committed.iter().map(|b| &b[..])
    }

    /// Returns the byte at the given committed offset, if any is available
    /// without requiring more data. Used by the EOM/header parsers, which
    /// walk the buffer index-by-index.
    pub fn get(&self, mut offset: usize) -> Option<u8> {
        for chunk in &self.committed {
            if offset < chunk.len() {
                return Some(chunk[offset]);
            }
            offset -= chunk.len();
        }
        None
    }

    /// Copies `range` into a contiguous scratch buffer, only actually
    /// copying when the range straddles a chunk boundary. Mirrors NwSMTP's
    /// `buffer_iterator.h`, whose entire purpose is to give the EOM parser a
    /// contiguous view without forcing the buffer pool to store messages in
    /// one giant allocation.
    pub fn contiguous<'a>(&'a self, start: usize, end: usize, scratch: &'a mut Vec<u8>) -> &'a [u8] {
        assert!(start <= end && end <= self.committed_len);
        let mut pos = 0;
        for chunk in &self.committed {
            if start >= pos && end <= pos + chunk.len() {
                return &chunk[(start - pos)..(end - pos)];
            }
            pos += chunk.len();
        }
        scratch.clear();
        for i in start..end {
            scratch.push(self.get(i).expect("range within committed_len"));
        }
        scratch
    }

    /// Returns `range` as a list of zero-copy `Bytes` views, split only at
    /// existing chunk boundaries. The counterpart to `contiguous` for
    /// callers building a chunk list (e.g. an envelope's body) instead of
    /// needing one contiguous view: unlike `contiguous`, this never copies,
    /// no matter how many chunks the range straddles.
    pub fn slice_chunks(&self, start: usize, end: usize) -> Vec<Bytes> {
        assert!(start <= end && end <= self.committed_len);
        let mut out = Vec::new();
        let mut pos = 0;
        for chunk in &self.committed {
            let chunk_end = pos + chunk.len();
            if chunk_end > start && pos < end {
                let lo = start.saturating_sub(pos);
                let hi = cmp::min(end - pos, chunk.len());
                if hi > lo {
                    out.push(chunk.slice(lo..hi));
                }
            }
            pos = chunk_end;
            if pos >= end {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_commit_consume_roundtrip() {
        let pool = Pool::new(8);
        let mut buf = Streambuf::new(pool);

        let space = buf.prepare(4);
        space.copy_from_slice(b"abcd");
        buf.commit(4);
        assert_eq!(buf.len(), 4);

        let space = buf.prepare(4);
        space.copy_from_slice(b"efgh");
        buf.commit(2); // only 2 of the 4 prepared bytes were actually valid
        assert_eq!(buf.len(), 6);

        let mut scratch = Vec::new();
        assert_eq!(buf.contiguous(0, 6, &mut scratch), b"abcdef");

        buf.consume(3);
        assert_eq!(buf.len(), 3);
        let mut scratch = Vec::new();
        assert_eq!(buf.contiguous(0, 3, &mut scratch), b"def");
    }

    #[test]
    fn slice_chunks_splits_without_copying() {
        let pool = Pool::new(2);
        let mut buf = Streambuf::new(pool);
        for byte in b"abcdef" {
            let space = buf.prepare(1);
            space[0] = *byte;
            buf.commit(1);
        }
        let slices = buf.slice_chunks(1, 5);
        let joined: Vec<u8> = slices.iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(joined, b"bcde");
        assert!(slices.len() > 1, "range spans more than one pool chunk");
    }

    #[test]
    fn contiguous_crosses_chunk_boundary_by_copying() {
        let pool = Pool::new(2);
        let mut buf = Streambuf::new(pool);
        for byte in b"abcdef" {
            let space = buf.prepare(1);
            space[0] = *byte;
            buf.commit(1);
        }
        let mut scratch = Vec::new();
        assert_eq!(buf.contiguous(1, 5, &mut scratch), b"bcde");
    }
}
