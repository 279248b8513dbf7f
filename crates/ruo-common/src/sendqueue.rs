// sendqueue.rs — per-connection coalesced outbound queue
//
// Two tiers: one partially-filled gram being coalesced into, and a FIFO of
// full grams waiting on the socket. Exactly one gram is ever in flight, so
// on-wire order is enqueue order. Gram pages come from a pool; a connection
// that backs up past the pending cap is torn down by the caller.

use std::collections::VecDeque;

use thiserror::Error;

use crate::bufpool::BufferPool;

/// Default page size for coalescing.
pub const DEFAULT_COALESCE_SIZE: usize = 512;

/// Ceiling on bytes parked in pending grams before the peer is dropped.
pub const MAX_PENDING_BYTES: usize = 256 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendQueueError {
    #[error("send queue exceeded {MAX_PENDING_BYTES} pending bytes")]
    CapacityExceeded,
}

struct Gram {
    buffer: Box<[u8]>,
    length: usize,
    /// Bytes of this gram already written to the socket.
    offset: usize,
}

impl Gram {
    fn remaining(&self) -> &[u8] {
        &self.buffer[self.offset..self.length]
    }
}

pub struct SendQueue {
    coalesce_size: usize,
    buffered: Option<Gram>,
    pending: VecDeque<Gram>,
    pending_bytes: usize,
}

impl SendQueue {
    pub fn new(coalesce_size: usize) -> SendQueue {
        SendQueue {
            coalesce_size,
            buffered: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_none() && self.pending.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Append bytes, spilling full pages into pending. Returns true when
    /// pending went from empty to non-empty, meaning a send should start.
    pub fn enqueue(&mut self, pool: &BufferPool, mut data: &[u8]) -> Result<bool, SendQueueError> {
        let mut start_send = false;

        while !data.is_empty() {
            let gram = self.buffered.get_or_insert_with(|| Gram {
                buffer: pool.acquire(),
                length: 0,
                offset: 0,
            });

            let room = self.coalesce_size - gram.length;
            let count = room.min(data.len());
            gram.buffer[gram.length..gram.length + count].copy_from_slice(&data[..count]);
            gram.length += count;
            data = &data[count..];

            if gram.length == self.coalesce_size {
                let full = self.buffered.take().unwrap();

                if self.pending_bytes + full.length > MAX_PENDING_BYTES {
                    pool.release(full.buffer);
                    return Err(SendQueueError::CapacityExceeded);
                }

                if self.pending.is_empty() {
                    start_send = true;
                }

                self.pending_bytes += full.length;
                self.pending.push_back(full);
            }
        }

        Ok(start_send)
    }

    /// Promote the buffered gram to pending. True if and only if it became
    /// the head with nothing ahead of it, i.e. a send should start now.
    pub fn check_flush_ready(&mut self) -> bool {
        let Some(gram) = self.buffered.take() else {
            return false;
        };

        if gram.length == 0 {
            self.buffered = Some(gram);
            return false;
        }

        let was_idle = self.pending.is_empty();
        self.pending_bytes += gram.length;
        self.pending.push_back(gram);
        was_idle
    }

    /// Unsent bytes of the gram currently at the head.
    pub fn head(&self) -> Option<&[u8]> {
        self.pending.front().map(Gram::remaining)
    }

    /// Record that `count` head bytes reached the socket.
    pub fn advance(&mut self, count: usize) {
        if let Some(gram) = self.pending.front_mut() {
            gram.offset = (gram.offset + count).min(gram.length);
        }
    }

    /// True when the head gram is fully written out.
    pub fn head_done(&self) -> bool {
        self.pending
            .front()
            .map(|g| g.offset == g.length)
            .unwrap_or(false)
    }

    /// Release the head gram. Returns true when another gram is waiting.
    pub fn dequeue(&mut self, pool: &BufferPool) -> bool {
        if let Some(gram) = self.pending.pop_front() {
            self.pending_bytes -= gram.length;
            pool.release(gram.buffer);
        }

        !self.pending.is_empty()
    }

    pub fn clear(&mut self, pool: &BufferPool) {
        if let Some(gram) = self.buffered.take() {
            pool.release(gram.buffer);
        }

        while let Some(gram) = self.pending.pop_front() {
            pool.release(gram.buffer);
        }

        self.pending_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gram_pool() -> std::sync::Arc<BufferPool> {
        BufferPool::new("test-gram", 4, DEFAULT_COALESCE_SIZE)
    }

    fn drain(q: &mut SendQueue, pool: &BufferPool) -> Vec<u8> {
        let mut out = Vec::new();
        q.check_flush_ready();

        while let Some(head) = q.head() {
            out.extend_from_slice(head);
            let n = head.len();
            q.advance(n);
            q.dequeue(pool);
        }

        out
    }

    #[test]
    fn test_wire_order_matches_enqueue_order() {
        let pool = gram_pool();
        let mut q = SendQueue::new(DEFAULT_COALESCE_SIZE);

        let a: Vec<u8> = (0..700u32).map(|i| (i % 256) as u8).collect();
        let b = vec![0xEEu8; 40];

        assert!(q.enqueue(&pool, &a).unwrap()); // first full page spills
        assert!(!q.enqueue(&pool, &b).unwrap()); // still coalescing

        let mut expected = a.clone();
        expected.extend_from_slice(&b);
        assert_eq!(drain(&mut q, &pool), expected);
        assert!(q.is_empty());
    }

    #[test]
    fn test_flush_ready_only_when_idle() {
        let pool = gram_pool();
        let mut q = SendQueue::new(DEFAULT_COALESCE_SIZE);

        q.enqueue(&pool, &[1, 2, 3]).unwrap();
        assert!(q.check_flush_ready());

        q.enqueue(&pool, &[4, 5]).unwrap();
        // A gram is already pending, so promotion must not start a send.
        assert!(!q.check_flush_ready());
    }

    #[test]
    fn test_empty_buffered_gram_not_promoted() {
        let pool = gram_pool();
        let mut q = SendQueue::new(DEFAULT_COALESCE_SIZE);
        assert!(!q.check_flush_ready());
        assert!(q.head().is_none());
    }

    #[test]
    fn test_partial_socket_writes() {
        let pool = gram_pool();
        let mut q = SendQueue::new(DEFAULT_COALESCE_SIZE);
        q.enqueue(&pool, &[9u8; 100]).unwrap();
        q.check_flush_ready();

        q.advance(60);
        assert_eq!(q.head().unwrap().len(), 40);
        assert!(!q.head_done());

        q.advance(40);
        assert!(q.head_done());
        assert!(!q.dequeue(&pool));
    }

    #[test]
    fn test_capacity_cap() {
        let pool = gram_pool();
        let mut q = SendQueue::new(DEFAULT_COALESCE_SIZE);
        let chunk = vec![0u8; DEFAULT_COALESCE_SIZE];

        for _ in 0..(MAX_PENDING_BYTES / DEFAULT_COALESCE_SIZE) {
            q.enqueue(&pool, &chunk).unwrap();
        }

        assert_eq!(
            q.enqueue(&pool, &chunk),
            Err(SendQueueError::CapacityExceeded)
        );
    }

    #[test]
    fn test_clear_releases_pages() {
        let pool = gram_pool();
        let baseline = pool.free_count();
        let mut q = SendQueue::new(DEFAULT_COALESCE_SIZE);
        q.enqueue(&pool, &vec![0u8; 2000]).unwrap();
        q.clear(&pool);
        assert_eq!(pool.free_count(), baseline);
        assert!(q.is_empty());
        assert_eq!(q.pending_bytes(), 0);
    }
}
