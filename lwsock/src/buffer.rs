//! Inbound buffering between the stack context and consumer threads.
//!
//! - `ByteBuffer` - chained byte stream for stream and TLS sockets
//! - `RecordQueue` - typed FIFO for accept results, datagrams and lookups
//!
//! Both are plain data structures; the socket core wraps them in its
//! per-socket lock.

use std::collections::VecDeque;

use crate::config::{BUFFER_BLOCK_SIZE, MAX_CHUNK_SIZE};
use crate::error::{Errno, Result};

/// Round `n` up to the next multiple of the buffer block size.
fn round_up(n: usize) -> usize {
    n.div_ceil(BUFFER_BLOCK_SIZE) * BUFFER_BLOCK_SIZE
}

// ═══════════════════════════════════════════════════════════════════════════════
// BYTE BUFFER
// ═══════════════════════════════════════════════════════════════════════════════

/// A growable byte stream backed by a chain of chunks.
///
/// Consumed bytes are skipped by advancing `offset` inside the head chunk;
/// a chunk is released once fully read. Nothing already stored is ever
/// copied again when the buffer grows.
///
/// Invariant: `offset + len == sum of chunk lengths`.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    chain: VecDeque<Vec<u8>>,
    /// Bytes already consumed from the head chunk
    offset: usize,
    /// Unread bytes
    len: usize,
}

impl ByteBuffer {
    pub const fn new() -> Self {
        Self {
            chain: VecDeque::new(),
            offset: 0,
            len: 0,
        }
    }

    /// Unread bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes consumed from the head chunk but not yet released
    pub fn read_offset(&self) -> usize {
        self.offset
    }

    /// Total bytes held by the chain, consumed or not
    pub fn backing_len(&self) -> usize {
        self.chain.iter().map(Vec::len).sum()
    }

    /// Allocated capacity across the chain
    pub fn capacity(&self) -> usize {
        self.chain.iter().map(Vec::capacity).sum()
    }

    /// Number of chunks in the chain
    pub fn chunks(&self) -> usize {
        self.chain.len()
    }

    /// Append `data`.
    ///
    /// Fills the spare room of the tail chunk first, then links one new
    /// chunk sized to at least twice the previous tail, rounded up to the
    /// block size. Fails with `ENOMEM` without modifying the buffer when the
    /// allocation cannot be made.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let (tail_cap, spare) = match self.chain.back() {
            Some(tail) => (tail.capacity(), tail.capacity() - tail.len()),
            None => (0, 0),
        };

        let rest = data.len().saturating_sub(spare);
        let mut chunk = None;
        if rest > 0 {
            let want = round_up(rest.max((tail_cap * 2).min(MAX_CHUNK_SIZE)));
            let mut fresh = Vec::new();
            fresh.try_reserve_exact(want).map_err(|_| Errno::ENOMEM)?;
            chunk = Some(fresh);
        }

        let (head, tail) = data.split_at(data.len() - rest);
        if !head.is_empty() {
            if let Some(last) = self.chain.back_mut() {
                last.extend_from_slice(head);
            }
        }
        if let Some(mut fresh) = chunk {
            fresh.extend_from_slice(tail);
            self.chain.push_back(fresh);
        }

        self.len += data.len();
        debug_assert_eq!(self.offset + self.len, self.backing_len());
        Ok(())
    }

    /// Copy up to `out.len()` bytes out without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut skip = self.offset;
        for chunk in &self.chain {
            if copied == out.len() {
                break;
            }
            let avail = &chunk[skip..];
            let n = avail.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&avail[..n]);
            copied += n;
            skip = 0;
        }
        copied
    }

    /// Move up to `out.len()` bytes out, returning how many were copied.
    pub fn pop(&mut self, out: &mut [u8]) -> usize {
        let copied = self.peek(out);
        self.advance(copied);
        copied
    }

    /// Consume `n` bytes, releasing chunks that become fully read.
    pub fn advance(&mut self, n: usize) {
        let mut n = n.min(self.len);
        self.len -= n;
        while n > 0 {
            let Some(head) = self.chain.front() else {
                break;
            };
            let avail = head.len() - self.offset;
            if n < avail {
                self.offset += n;
                n = 0;
            } else {
                n -= avail;
                self.offset = 0;
                if self.chain.len() == 1 {
                    // Keep the last allocation around for the next push
                    if let Some(last) = self.chain.front_mut() {
                        last.clear();
                    }
                } else {
                    self.chain.pop_front();
                }
            }
        }
        debug_assert_eq!(self.offset + self.len, self.backing_len());
    }

    /// Drop everything buffered.
    pub fn discard(&mut self) -> usize {
        let dropped = self.len;
        self.chain.clear();
        self.offset = 0;
        self.len = 0;
        dropped
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORD QUEUE
// ═══════════════════════════════════════════════════════════════════════════════

/// FIFO of owned records with an optional bound.
///
/// Records are whole values, so the queue never holds a partial record and
/// dropping the queue drops (and thereby cleans up) every record left in it.
#[derive(Debug)]
pub struct RecordQueue<T> {
    records: VecDeque<T>,
    limit: Option<usize>,
}

impl<T> RecordQueue<T> {
    pub const fn new() -> Self {
        Self {
            records: VecDeque::new(),
            limit: None,
        }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            limit: Some(limit),
        }
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.records.len() >= limit)
    }

    /// Enqueue a record; hands it back when the queue is full or the
    /// allocation fails.
    pub fn push(&mut self, record: T) -> core::result::Result<(), T> {
        if self.is_full() || self.records.try_reserve(1).is_err() {
            return Err(record);
        }
        self.records.push_back(record);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.records.pop_front()
    }

    pub fn front(&self) -> Option<&T> {
        self.records.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.records.iter()
    }

    /// Remove every record, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.records.drain(..)
    }
}

impl<T> Default for RecordQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::XorShift;
    use rand_core::RngCore;

    #[test]
    fn test_push_pop_round_trip() {
        let mut buf = ByteBuffer::new();
        buf.push(b"hello ").unwrap();
        buf.push(b"world").unwrap();
        assert_eq!(buf.len(), 11);

        let mut out = [0u8; 4];
        assert_eq!(buf.pop(&mut out), 4);
        assert_eq!(&out, b"hell");
        assert_eq!(buf.read_offset() + buf.len(), buf.backing_len());

        let mut rest = [0u8; 32];
        assert_eq!(buf.pop(&mut rest), 7);
        assert_eq!(&rest[..7], b"o world");
        assert!(buf.is_empty());
        assert_eq!(buf.pop(&mut rest), 0);
    }

    #[test]
    fn test_growth_rounds_to_block_size() {
        let mut buf = ByteBuffer::new();
        buf.push(&[1u8; 10]).unwrap();
        assert_eq!(buf.capacity(), BUFFER_BLOCK_SIZE);

        // Fits in the spare room of the first chunk
        buf.push(&[2u8; 100]).unwrap();
        assert_eq!(buf.chunks(), 1);

        // Overflows: the next chunk is at least double the tail
        buf.push(&[3u8; BUFFER_BLOCK_SIZE]).unwrap();
        assert_eq!(buf.chunks(), 2);
        assert!(buf.capacity() >= 3 * BUFFER_BLOCK_SIZE);
        assert_eq!(buf.capacity() % BUFFER_BLOCK_SIZE, 0);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buf = ByteBuffer::new();
        buf.push(b"abc").unwrap();
        let mut out = [0u8; 2];
        assert_eq!(buf.peek(&mut out), 2);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.pop(&mut out), 2);
        assert_eq!(&out, b"ab");
    }

    #[test]
    fn test_discard() {
        let mut buf = ByteBuffer::new();
        buf.push(&[0u8; 2000]).unwrap();
        assert_eq!(buf.discard(), 2000);
        assert!(buf.is_empty());
        assert_eq!(buf.backing_len(), 0);
    }

    #[test]
    fn test_random_sequences_conserve_bytes() {
        let mut rng = XorShift::new(0x5eed);
        for _ in 0..50 {
            let mut buf = ByteBuffer::new();
            let mut pushed = Vec::new();
            let mut popped = Vec::new();
            for _ in 0..40 {
                let size = (rng.next_u32() % 3000) as usize;
                let data: Vec<u8> = (0..size).map(|_| rng.next_u32() as u8).collect();
                buf.push(&data).unwrap();
                pushed.extend_from_slice(&data);

                let want = (rng.next_u32() % 2000) as usize;
                let mut out = vec![0u8; want];
                let n = buf.pop(&mut out);
                assert!(n <= want);
                popped.extend_from_slice(&out[..n]);
                assert_eq!(buf.read_offset() + buf.len(), buf.backing_len());
            }
            let mut out = vec![0u8; buf.len()];
            let n = buf.pop(&mut out);
            popped.extend_from_slice(&out[..n]);
            assert_eq!(pushed, popped);
        }
    }

    #[test]
    fn test_record_queue_limit() {
        let mut q = RecordQueue::with_limit(2);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.front(), Some(&2));
        assert_eq!(q.drain().collect::<Vec<_>>(), vec![2]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_record_queue_drop_runs_destructors() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        {
            let mut q = RecordQueue::new();
            for _ in 0..3 {
                assert!(q.push(Tracked(dropped.clone())).is_ok());
            }
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }
}
