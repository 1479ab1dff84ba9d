//! # Frame Queue - Timestamped Decoded-Frame FIFO
//!
//! One queue per media type sits between the decode thread and its consumer:
//! - Strict FIFO (decode order is presentation order, nothing is reordered)
//! - Every entry carries its presentation timestamp in milliseconds
//! - `pop` never blocks; an empty queue is a normal answer, not an error
//! - Throttling is the producer's job (see [`crate::signal`]), so `push`
//!   never blocks or rejects either
//!
//! ```text
//! ┌──────────┐  push   ┌────────────┐  pop   ┌──────────────┐
//! │ Decoder  │────────►│ FrameQueue │───────►│ Render loop /│
//! │ Thread   │         │  (mutex)   │        │ audio device │
//! └──────────┘         └────────────┘        └──────────────┘
//! ```

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

// ============================================================================
// Entry
// ============================================================================

/// A queued payload and its presentation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFrame<T> {
    pub payload: T,
    /// Presentation timestamp in milliseconds from stream start
    pub pts_ms: i64,
}

impl<T> QueuedFrame<T> {
    pub fn into_parts(self) -> (T, i64) {
        (self.payload, self.pts_ms)
    }
}

// ============================================================================
// Frame Queue
// ============================================================================

struct Inner<T> {
    entries: VecDeque<QueuedFrame<T>>,
    pushed: u64,
    popped: u64,
    peak_depth: usize,
    last_pushed_pts_ms: Option<i64>,
    last_popped_pts_ms: Option<i64>,
}

/// Thread-safe FIFO for one media type.
///
/// Meant for exactly one pushing thread and one popping thread; every
/// operation takes the same lock, and the lock is never held across a call
/// out of this type.
pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> FrameQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Pre-size storage; the queue still grows past this if it has to
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                pushed: 0,
                popped: 0,
                peak_depth: 0,
                last_pushed_pts_ms: None,
                last_popped_pts_ms: None,
            }),
        }
    }

    // ========================================================================
    // Producer API (Decoder Thread)
    // ========================================================================

    /// Append at the tail
    pub fn push(&self, payload: T, pts_ms: i64) {
        let mut inner = self.inner.lock();
        inner.entries.push_back(QueuedFrame { payload, pts_ms });
        inner.pushed += 1;
        inner.peak_depth = inner.peak_depth.max(inner.entries.len());
        inner.last_pushed_pts_ms = Some(pts_ms);
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Take the head entry, or `None` when nothing is queued
    pub fn pop(&self) -> Option<QueuedFrame<T>> {
        let mut inner = self.inner.lock();
        let frame = inner.entries.pop_front()?;
        inner.popped += 1;
        inner.last_popped_pts_ms = Some(frame.pts_ms);
        Some(frame)
    }

    /// PTS of the head entry without removing it
    pub fn peek_pts(&self) -> Option<i64> {
        self.inner.lock().entries.front().map(|f| f.pts_ms)
    }

    // ========================================================================
    // Status / Control
    // ========================================================================

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Drop every queued entry, returning how many were released
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let released = inner.entries.len();
        inner.entries.clear();
        released
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            depth: inner.entries.len(),
            peak_depth: inner.peak_depth,
            frames_pushed: inner.pushed,
            frames_popped: inner.popped,
            last_pushed_pts_ms: inner.last_pushed_pts_ms,
            last_popped_pts_ms: inner.last_popped_pts_ms,
        }
    }
}

impl<T> Default for FrameQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub peak_depth: usize,
    pub frames_pushed: u64,
    pub frames_popped: u64,
    pub last_pushed_pts_ms: Option<i64>,
    pub last_popped_pts_ms: Option<i64>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pop_empty_returns_none() {
        let queue: FrameQueue<Vec<u8>> = FrameQueue::new();
        assert!(queue.pop().is_none());
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_order_ignores_pts() {
        let queue = FrameQueue::new();

        // PTS deliberately out of order: the queue must not sort
        queue.push("a", 30);
        queue.push("b", 10);
        queue.push("c", 20);

        assert_eq!(queue.pop().unwrap().into_parts(), ("a", 30));
        assert_eq!(queue.pop().unwrap().into_parts(), ("b", 10));
        assert_eq!(queue.pop().unwrap().into_parts(), ("c", 20));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_len_tracks_push_and_pop() {
        let queue = FrameQueue::new();
        for i in 0..4 {
            queue.push(vec![i as u8], i * 33);
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.peek_pts(), Some(0));

        queue.pop();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek_pts(), Some(33));
    }

    #[test]
    fn test_clear_releases_payloads() {
        let payload = Arc::new(());
        let queue = FrameQueue::new();
        for pts in 0..3 {
            queue.push(Arc::clone(&payload), pts);
        }
        assert_eq!(Arc::strong_count(&payload), 4);

        assert_eq!(queue.clear(), 3);
        assert_eq!(Arc::strong_count(&payload), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_releases_payloads() {
        let payload = Arc::new(());
        {
            let queue = FrameQueue::new();
            queue.push(Arc::clone(&payload), 0);
            queue.push(Arc::clone(&payload), 1);
        }
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_stats() {
        let queue = FrameQueue::new();
        queue.push(1u8, 0);
        queue.push(2u8, 40);
        queue.push(3u8, 80);
        queue.pop();

        let stats = queue.stats();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.peak_depth, 3);
        assert_eq!(stats.frames_pushed, 3);
        assert_eq!(stats.frames_popped, 1);
        assert_eq!(stats.last_pushed_pts_ms, Some(80));
        assert_eq!(stats.last_popped_pts_ms, Some(0));
    }

    #[test]
    fn test_concurrent_push_pop_preserves_order() {
        let queue = Arc::new(FrameQueue::new());
        let producer_queue = Arc::clone(&queue);

        let producer = thread::spawn(move || {
            for i in 0..1_000u32 {
                producer_queue.push(i, i as i64);
            }
        });

        let mut seen = Vec::with_capacity(1_000);
        while seen.len() < 1_000 {
            match queue.pop() {
                Some(frame) => seen.push(frame.payload),
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();

        let expected: Vec<u32> = (0..1_000).collect();
        assert_eq!(seen, expected);
    }
}
