//! Bounded streaming buffer between the capture task and HTTP clients.
//!
//! ```text
//! capture task ──put()──▶ [ chunk | chunk | chunk ] ──get()──▶ client streamers
//!                          ▲ oldest evicted first when over capacity
//! ```
//!
//! One [`BufferWriter`] feeds any number of [`BufferReader`]s. All state sits
//! behind a single mutex that is only held for the duration of one
//! `put`/`get`/`stats` call, never across an await. Readers park on a watch
//! channel (prebuffer gate) or a `Notify` (new data) instead of spinning.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tableconf::{BufferConfig, PrebufferPolicy};
use tokio::sync::{watch, Notify};

/// Point-in-time copy of every buffer counter, taken under one lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BufferStats {
    pub current_size: usize,
    pub capacity: usize,
    pub prebuffer_threshold: usize,
    pub chunks_in_buffer: usize,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub bytes_evicted: u64,
    pub chunks_written: u64,
    pub chunks_read: u64,
    pub chunks_evicted: u64,
    pub ready: bool,
}

impl BufferStats {
    /// Fill level in percent of capacity; 0 when capacity is 0.
    pub fn fill_percentage(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.current_size as f64 / self.capacity as f64 * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct BufferState {
    chunks: VecDeque<Bytes>,
    current_size: usize,
    bytes_written: u64,
    bytes_read: u64,
    bytes_evicted: u64,
    chunks_written: u64,
    chunks_read: u64,
    chunks_evicted: u64,
    ready: bool,
}

/// FIFO of immutable chunks with overflow eviction and a prebuffer gate.
#[derive(Debug)]
pub struct StreamBuffer {
    capacity: usize,
    threshold: usize,
    policy: PrebufferPolicy,
    state: Mutex<BufferState>,
    ready_tx: watch::Sender<bool>,
    data: Notify,
}

impl StreamBuffer {
    pub fn new(capacity: usize, threshold: usize, policy: PrebufferPolicy) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            capacity,
            threshold,
            policy,
            state: Mutex::new(BufferState::default()),
            ready_tx,
            data: Notify::new(),
        }
    }

    pub fn from_config(config: &BufferConfig) -> Self {
        Self::new(config.capacity_bytes, config.prebuffer_threshold(), config.policy)
    }

    // Every mutation leaves the state consistent, so a poisoned lock is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn prebuffer_threshold(&self) -> usize {
        self.threshold
    }

    pub fn policy(&self) -> PrebufferPolicy {
        self.policy
    }

    /// Append a chunk, evicting the oldest chunks while over capacity.
    ///
    /// Never blocks on readers. Zero-length chunks are ignored.
    pub fn put(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        let len = chunk.len();
        {
            let mut state = self.lock();
            state.chunks.push_back(chunk);
            state.current_size += len;
            state.bytes_written += len as u64;
            state.chunks_written += 1;

            while state.current_size > self.capacity {
                let Some(old) = state.chunks.pop_front() else {
                    break;
                };
                state.current_size -= old.len();
                state.bytes_evicted += old.len() as u64;
                state.chunks_evicted += 1;
            }

            if !state.ready && state.current_size >= self.threshold {
                state.ready = true;
                self.ready_tx.send_replace(true);
            }
        }

        self.data.notify_waiters();
    }

    /// Pop the oldest chunk, or `None` when empty. Never blocks.
    ///
    /// Under [`PrebufferPolicy::Rearm`] finding the buffer empty closes the
    /// prebuffer gate again.
    pub fn get(&self) -> Option<Bytes> {
        let mut state = self.lock();
        match state.chunks.pop_front() {
            Some(chunk) => {
                state.current_size -= chunk.len();
                state.bytes_read += chunk.len() as u64;
                state.chunks_read += 1;
                Some(chunk)
            }
            None => {
                if self.policy == PrebufferPolicy::Rearm && state.ready {
                    state.ready = false;
                    self.ready_tx.send_replace(false);
                }
                None
            }
        }
    }

    /// Fill level in percent of capacity.
    pub fn fill_level(&self) -> f64 {
        self.stats().fill_percentage()
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.lock();
        BufferStats {
            current_size: state.current_size,
            capacity: self.capacity,
            prebuffer_threshold: self.threshold,
            chunks_in_buffer: state.chunks.len(),
            bytes_written: state.bytes_written,
            bytes_read: state.bytes_read,
            bytes_evicted: state.bytes_evicted,
            chunks_written: state.chunks_written,
            chunks_read: state.chunks_read,
            chunks_evicted: state.chunks_evicted,
            ready: state.ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Suspend the caller until the prebuffer gate opens or `timeout` elapses.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready_tx.subscribe();
        tokio::time::timeout(timeout, async move { rx.wait_for(|ready| *ready).await.is_ok() })
            .await
            .unwrap_or(false)
    }

    /// Suspend the caller until a chunk is available or `timeout` elapses.
    ///
    /// Returns true when data is (or just became) available.
    pub async fn wait_for_data(&self, timeout: Duration) -> bool {
        let notified = self.data.notified();
        tokio::pin!(notified);
        // Register before checking so a put between check and await still wakes us.
        notified.as_mut().enable();

        if !self.lock().chunks.is_empty() {
            return true;
        }

        tokio::time::timeout(timeout, notified).await.is_ok()
    }
}

/// The single producer handle. Deliberately not `Clone`.
#[derive(Debug)]
pub struct BufferWriter {
    inner: Arc<StreamBuffer>,
}

impl BufferWriter {
    pub fn put(&self, chunk: Bytes) {
        self.inner.put(chunk);
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.stats()
    }

    /// A reader over the same buffer.
    pub fn reader(&self) -> BufferReader {
        BufferReader {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Consumer handle; clone one per client.
#[derive(Debug, Clone)]
pub struct BufferReader {
    inner: Arc<StreamBuffer>,
}

impl BufferReader {
    pub fn get(&self) -> Option<Bytes> {
        self.inner.get()
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.stats()
    }

    pub fn fill_level(&self) -> f64 {
        self.inner.fill_level()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn policy(&self) -> PrebufferPolicy {
        self.inner.policy()
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        self.inner.wait_until_ready(timeout).await
    }

    pub async fn wait_for_data(&self, timeout: Duration) -> bool {
        self.inner.wait_for_data(timeout).await
    }
}

/// Create a buffer and its writer/reader handles.
pub fn stream_buffer(config: &BufferConfig) -> (BufferWriter, BufferReader) {
    split(StreamBuffer::from_config(config))
}

/// Wrap an existing buffer in writer/reader handles.
pub fn split(buffer: StreamBuffer) -> (BufferWriter, BufferReader) {
    let inner = Arc::new(buffer);
    let reader = BufferReader {
        inner: Arc::clone(&inner),
    };
    (BufferWriter { inner }, reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tag: u8, len: usize) -> Bytes {
        Bytes::from(vec![tag; len])
    }

    fn assert_accounting(stats: &BufferStats) {
        assert_eq!(
            stats.bytes_written - stats.bytes_read - stats.bytes_evicted,
            stats.current_size as u64
        );
    }

    #[test]
    fn test_prebuffer_and_eviction_scenario() {
        let buffer = StreamBuffer::new(1024, 300, PrebufferPolicy::Sticky);

        buffer.put(chunk(0, 200));
        assert!(!buffer.is_ready());
        buffer.put(chunk(1, 200));
        assert!(buffer.is_ready(), "400 >= 300 opens the gate");

        for tag in 2..5 {
            buffer.put(chunk(tag, 200));
        }
        let stats = buffer.stats();
        assert_eq!(stats.current_size, 1000);
        assert_eq!(stats.chunks_evicted, 0);

        buffer.put(chunk(5, 200));
        let stats = buffer.stats();
        assert_eq!(stats.current_size, 1000);
        assert_eq!(stats.chunks_evicted, 1);
        assert_eq!(stats.bytes_evicted, 200);
        assert_accounting(&stats);

        // The first chunk is gone; the second is now the oldest.
        assert_eq!(buffer.get().unwrap()[0], 1);
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let buffer = StreamBuffer::new(4096, 1024, PrebufferPolicy::Rearm);
        let mut seed: u32 = 0x2545_f491;

        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 {
                buffer.get();
            } else {
                buffer.put(chunk(0, (seed % 1500) as usize + 1));
            }
            let stats = buffer.stats();
            assert!(stats.current_size <= stats.capacity);
            assert_accounting(&stats);
        }
    }

    #[test]
    fn test_fifo_order_without_duplicates() {
        let buffer = StreamBuffer::new(1 << 20, 0, PrebufferPolicy::Sticky);
        for tag in 0..50u8 {
            buffer.put(chunk(tag, 10));
        }

        let mut seen = Vec::new();
        while let Some(c) = buffer.get() {
            seen.push(c[0]);
        }
        assert_eq!(seen, (0..50u8).collect::<Vec<_>>());
        assert_eq!(buffer.stats().chunks_read, 50);
    }

    #[test]
    fn test_chunk_larger_than_capacity_is_dropped() {
        let buffer = StreamBuffer::new(100, 50, PrebufferPolicy::Sticky);
        buffer.put(chunk(0, 40));
        buffer.put(chunk(1, 150));

        let stats = buffer.stats();
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.chunks_evicted, 2);
        assert!(!stats.ready);
        assert_accounting(&stats);
    }

    #[test]
    fn test_empty_chunks_are_ignored() {
        let buffer = StreamBuffer::new(100, 0, PrebufferPolicy::Sticky);
        buffer.put(Bytes::new());
        assert_eq!(buffer.stats().chunks_written, 0);
        assert!(buffer.get().is_none());
    }

    #[test]
    fn test_fill_level() {
        let buffer = StreamBuffer::new(1000, 0, PrebufferPolicy::Sticky);
        assert_eq!(buffer.fill_level(), 0.0);
        buffer.put(chunk(0, 250));
        assert!((buffer.fill_level() - 25.0).abs() < f64::EPSILON);

        let empty = StreamBuffer::new(0, 0, PrebufferPolicy::Sticky);
        empty.put(chunk(0, 10));
        assert_eq!(empty.fill_level(), 0.0);
    }

    #[test]
    fn test_rearm_policy_closes_gate_on_underrun() {
        let buffer = StreamBuffer::new(1000, 100, PrebufferPolicy::Rearm);
        buffer.put(chunk(0, 100));
        assert!(buffer.is_ready());

        assert!(buffer.get().is_some());
        // Draining the last chunk alone does not close the gate...
        assert!(buffer.is_ready());
        // ...finding the buffer empty does.
        assert!(buffer.get().is_none());
        assert!(!buffer.is_ready());

        buffer.put(chunk(1, 50));
        assert!(!buffer.is_ready());
        buffer.put(chunk(2, 50));
        assert!(buffer.is_ready());
    }

    #[test]
    fn test_sticky_policy_keeps_gate_open() {
        let buffer = StreamBuffer::new(1000, 100, PrebufferPolicy::Sticky);
        buffer.put(chunk(0, 100));
        while buffer.get().is_some() {}
        assert!(buffer.get().is_none());
        assert!(buffer.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_times_out_on_empty_buffer() {
        let buffer = StreamBuffer::new(1000, 100, PrebufferPolicy::Rearm);
        let started = tokio::time::Instant::now();
        assert!(!buffer.wait_until_ready(Duration::from_secs(10)).await);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_returns_immediately_when_ready() {
        let buffer = StreamBuffer::new(1000, 10, PrebufferPolicy::Rearm);
        buffer.put(chunk(0, 10));
        let started = tokio::time::Instant::now();
        assert!(buffer.wait_until_ready(Duration::from_secs(10)).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_wait_until_ready_wakes_on_put() {
        let (writer, reader) = split(StreamBuffer::new(1000, 100, PrebufferPolicy::Rearm));
        let waiter = tokio::spawn(async move { reader.wait_until_ready(Duration::from_secs(5)).await });

        tokio::task::yield_now().await;
        writer.put(chunk(0, 60));
        writer.put(chunk(1, 60));

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_data_wakes_on_put() {
        let (writer, reader) = split(StreamBuffer::new(1000, 0, PrebufferPolicy::Sticky));
        let waiter = tokio::spawn(async move {
            let woke = reader.wait_for_data(Duration::from_secs(5)).await;
            (woke, reader.get())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.put(chunk(7, 3));

        let (woke, got) = waiter.await.unwrap();
        assert!(woke);
        assert_eq!(got.unwrap()[0], 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_data_times_out() {
        let buffer = StreamBuffer::new(1000, 0, PrebufferPolicy::Sticky);
        assert!(!buffer.wait_for_data(Duration::from_millis(10)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_see_ordered_disjoint_chunks() {
        let (writer, reader) = split(StreamBuffer::new(1 << 20, 0, PrebufferPolicy::Sticky));
        const TOTAL: u32 = 2000;

        let mut readers = Vec::new();
        for _ in 0..3 {
            let reader = reader.clone();
            readers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    match reader.get() {
                        Some(c) => {
                            let n = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                            if n == u32::MAX {
                                break;
                            }
                            seen.push(n);
                        }
                        None => {
                            reader.wait_for_data(Duration::from_millis(5)).await;
                        }
                    }
                }
                seen
            }));
        }

        for n in 0..TOTAL {
            writer.put(Bytes::copy_from_slice(&n.to_le_bytes()));
        }
        for _ in 0..3 {
            writer.put(Bytes::copy_from_slice(&u32::MAX.to_le_bytes()));
        }

        let mut all = Vec::new();
        for handle in readers {
            let seen = handle.await.unwrap();
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "per-reader FIFO");
            all.extend(seen);
        }
        all.sort_unstable();
        assert_eq!(all, (0..TOTAL).collect::<Vec<_>>());
    }
}
