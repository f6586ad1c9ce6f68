//! # Bounded Audio Byte Buffer
//!
//! A fixed-capacity FIFO of raw audio chunks sitting between the network (which delivers bytes
//! whenever it likes) and the frame processor (which wants exactly one frame's worth at a time).
//!
//! ## Key Features:
//! - **Bounded memory**: `total_bytes` never exceeds `capacity`
//! - **Oldest-drop eviction**: on overflow the oldest chunks go first, so the freshest speech survives
//! - **Exact takes**: `take(n)` returns exactly `n` bytes or nothing, splitting the front chunk if needed
//! - **Thread safety**: one mutex guards chunks and counter together, so the invariant is atomic

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Chunks plus their running byte total. Kept in one struct so a single lock covers both.
#[derive(Debug, Default)]
struct Chunks {
    queue: VecDeque<Vec<u8>>,
    total_bytes: usize,
}

/// Fixed-capacity FIFO store of audio bytes.
///
/// ## Thread Safety:
/// Producers (`add`) and consumers (`take`) may run on different tasks. Every mutation happens
/// inside one `Mutex` critical section that only copies or moves memory; nothing awaits while the
/// lock is held.
#[derive(Debug)]
pub struct BoundedByteBuffer {
    chunks: Mutex<Chunks>,
    capacity: usize,
    stopped: AtomicBool,
}

impl BoundedByteBuffer {
    /// Create an empty buffer that holds at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: Mutex::new(Chunks::default()),
            capacity,
            stopped: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Chunks> {
        // A panic while holding the lock cannot leave the chunks half-updated in a way that
        // breaks the counter, so a poisoned lock is still usable.
        self.chunks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a chunk, evicting the oldest chunks until it fits.
    ///
    /// ## Returns:
    /// - `false` only if the buffer has been stopped
    /// - `true` otherwise (overflow is handled by eviction, never by rejection)
    ///
    /// A chunk larger than the whole capacity keeps only its newest `capacity` bytes.
    pub fn add(&self, mut chunk: Vec<u8>) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        if chunk.is_empty() {
            return true;
        }

        if chunk.len() > self.capacity {
            let excess = chunk.len() - self.capacity;
            chunk.drain(..excess);
        }

        let mut chunks = self.lock();
        if chunks.total_bytes + chunk.len() > self.capacity {
            let mut evicted = 0usize;
            while chunks.total_bytes + chunk.len() > self.capacity {
                match chunks.queue.pop_front() {
                    Some(old) => {
                        chunks.total_bytes -= old.len();
                        evicted += old.len();
                    }
                    None => break,
                }
            }
            warn!(evicted_bytes = evicted, capacity = self.capacity, "Audio buffer overflow, dropped oldest data");
        }

        chunks.total_bytes += chunk.len();
        chunks.queue.push_back(chunk);
        true
    }

    /// Remove and return exactly `n` bytes, or `None` if fewer than `n` are buffered.
    ///
    /// ## Partial chunks:
    /// If the last chunk needed is only partly consumed, its remainder goes back to the front
    /// of the queue so byte order is preserved for the next take.
    pub fn take(&self, n: usize) -> Option<Vec<u8>> {
        if n == 0 || self.stopped.load(Ordering::SeqCst) {
            return None;
        }

        let mut chunks = self.lock();
        if chunks.total_bytes < n {
            return None;
        }

        let mut result = Vec::with_capacity(n);
        while result.len() < n {
            let Some(mut chunk) = chunks.queue.pop_front() else {
                break;
            };
            let needed = n - result.len();
            if chunk.len() <= needed {
                chunks.total_bytes -= chunk.len();
                result.extend_from_slice(&chunk);
            } else {
                let remainder = chunk.split_off(needed);
                chunks.total_bytes -= chunk.len();
                result.extend_from_slice(&chunk);
                chunks.queue.push_front(remainder);
            }
        }

        Some(result)
    }

    /// Drop every buffered chunk.
    pub fn clear(&self) {
        let mut chunks = self.lock();
        chunks.queue.clear();
        chunks.total_bytes = 0;
    }

    /// Stop accepting data and release everything. Safe to call more than once.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Total bytes currently buffered.
    pub fn len(&self) -> usize {
        self.lock().total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_returns_exact_bytes_across_chunks() {
        let buffer = BoundedByteBuffer::new(64);
        assert!(buffer.add(vec![1, 2, 3]));
        assert!(buffer.add(vec![4, 5, 6, 7]));

        assert_eq!(buffer.take(5), Some(vec![1, 2, 3, 4, 5]));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.take(2), Some(vec![6, 7]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_without_enough_data_returns_nothing() {
        let buffer = BoundedByteBuffer::new(64);
        buffer.add(vec![9; 3]);
        assert_eq!(buffer.take(4), None);
        // nothing was consumed by the failed take
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.take(0), None);
    }

    #[test]
    fn test_overflow_evicts_oldest_chunks_first() {
        let buffer = BoundedByteBuffer::new(8);
        buffer.add(vec![1; 4]);
        buffer.add(vec![2; 4]);
        buffer.add(vec![3; 4]);

        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.take(8), Some(vec![2, 2, 2, 2, 3, 3, 3, 3]));
    }

    #[test]
    fn test_chunk_larger_than_capacity_keeps_newest_bytes() {
        let buffer = BoundedByteBuffer::new(4);
        buffer.add(vec![0, 0]);
        buffer.add(vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.take(4), Some(vec![3, 4, 5, 6]));
    }

    #[test]
    fn test_total_never_exceeds_capacity_and_order_is_preserved() {
        let capacity = 50;
        let buffer = BoundedByteBuffer::new(capacity);
        let mut expected: VecDeque<u8> = VecDeque::new();
        let mut next = 0u8;

        // deterministic mix of uneven adds and takes
        for step in 0..500usize {
            let size = (step * 7) % 13 + 1;
            let chunk: Vec<u8> = (0..size)
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();
            expected.extend(chunk.iter().copied());
            buffer.add(chunk);
            while expected.len() > capacity {
                // whole chunks are evicted, so trim the model to what the buffer kept
                expected.pop_front();
            }
            assert!(buffer.len() <= capacity);

            if step % 3 == 0 {
                let want = (step % 11) + 1;
                if let Some(bytes) = buffer.take(want) {
                    // the model may hold more bytes than the buffer after chunk-granular eviction;
                    // align it on the buffer's view before comparing
                    while expected.len() > buffer.len() + want {
                        expected.pop_front();
                    }
                    let model: Vec<u8> = expected.drain(..want).collect();
                    assert_eq!(bytes, model);
                }
            }
        }
    }

    #[test]
    fn test_stop_is_idempotent_and_rejects_new_data() {
        let buffer = BoundedByteBuffer::new(16);
        buffer.add(vec![1; 8]);
        buffer.stop();
        buffer.stop();

        assert!(buffer.is_stopped());
        assert!(buffer.is_empty());
        assert!(!buffer.add(vec![1; 2]));
        assert_eq!(buffer.take(1), None);
    }

    #[test]
    fn test_clear_keeps_buffer_usable() {
        let buffer = BoundedByteBuffer::new(16);
        buffer.add(vec![1; 8]);
        buffer.clear();
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.add(vec![2; 2]));
        assert_eq!(buffer.take(2), Some(vec![2, 2]));
    }
}
