//! Deterministic in-process backend.
//!
//! Replays a fixed list of chunks, optionally slowed down or interrupted by
//! one-off read errors, and can be told to report busy or unavailable on
//! probe and start. Every factory call is
//! counted so tests can assert on the start-up and shutdown sequence.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{BackendFactory, CaptureBackend};
use crate::error::CaptureError;

/// Result of one probe or start call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Ready,
    Busy,
    Unavailable,
}

impl StartOutcome {
    fn into_result(self, what: &str) -> Result<(), CaptureError> {
        match self {
            Self::Ready => Ok(()),
            Self::Busy => Err(CaptureError::BackendBusy(format!("scripted {} busy", what))),
            Self::Unavailable => Err(CaptureError::BackendUnavailable(format!(
                "scripted {} unavailable",
                what
            ))),
        }
    }
}

/// What a backend does once its chunks are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptEnd {
    /// Stay open and silent, like a capture of a paused source.
    #[default]
    Idle,
    /// End of stream; the process is considered exited.
    Exit,
    /// Every further read fails.
    Fail,
}

/// Snapshot of how often each factory/backend entry point ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptCounters {
    pub probes: usize,
    pub clears: usize,
    pub starts: usize,
    pub stops: usize,
    pub sweeps: usize,
}

#[derive(Debug, Default)]
struct Calls {
    probes: AtomicUsize,
    clears: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    sweeps: AtomicUsize,
}

#[derive(Debug)]
pub struct ScriptedFactory {
    chunks: Vec<Bytes>,
    read_delay: Duration,
    end: ScriptEnd,
    failures_before: Vec<usize>,
    probe_outcomes: Mutex<VecDeque<StartOutcome>>,
    start_outcomes: Mutex<VecDeque<StartOutcome>>,
    calls: Arc<Calls>,
}

impl ScriptedFactory {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        Self {
            chunks,
            read_delay: Duration::ZERO,
            end: ScriptEnd::default(),
            failures_before: Vec::new(),
            probe_outcomes: Mutex::new(VecDeque::new()),
            start_outcomes: Mutex::new(VecDeque::new()),
            calls: Arc::new(Calls::default()),
        }
    }

    /// `count` chunks of `len` bytes, chunk `i` filled with `i as u8`.
    pub fn numbered(count: usize, len: usize) -> Self {
        Self::new(
            (0..count)
                .map(|i| Bytes::from(vec![i as u8; len]))
                .collect(),
        )
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn with_end(mut self, end: ScriptEnd) -> Self {
        self.end = end;
        self
    }

    /// Fail one read just before chunk `index` is served. Repeat to fail more.
    pub fn with_failure_before(mut self, index: usize) -> Self {
        self.failures_before.push(index);
        self.failures_before.sort_unstable();
        self
    }

    /// Outcomes for successive probes; `Ready` once exhausted.
    pub fn with_probe_outcomes(self, outcomes: impl IntoIterator<Item = StartOutcome>) -> Self {
        *lock(&self.probe_outcomes) = outcomes.into_iter().collect();
        self
    }

    /// Outcomes for successive starts; `Ready` once exhausted.
    pub fn with_start_outcomes(self, outcomes: impl IntoIterator<Item = StartOutcome>) -> Self {
        *lock(&self.start_outcomes) = outcomes.into_iter().collect();
        self
    }

    pub fn counters(&self) -> ScriptCounters {
        ScriptCounters {
            probes: self.calls.probes.load(Ordering::SeqCst),
            clears: self.calls.clears.load(Ordering::SeqCst),
            starts: self.calls.starts.load(Ordering::SeqCst),
            stops: self.calls.stops.load(Ordering::SeqCst),
            sweeps: self.calls.sweeps.load(Ordering::SeqCst),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn next_outcome(queue: &Mutex<VecDeque<StartOutcome>>) -> StartOutcome {
    lock(queue).pop_front().unwrap_or(StartOutcome::Ready)
}

#[async_trait]
impl BackendFactory for ScriptedFactory {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn probe(&self) -> Result<(), CaptureError> {
        self.calls.probes.fetch_add(1, Ordering::SeqCst);
        next_outcome(&self.probe_outcomes).into_result("probe")
    }

    async fn clear_conflicts(&self) {
        self.calls.clears.fetch_add(1, Ordering::SeqCst);
    }

    async fn start(&self) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        next_outcome(&self.start_outcomes).into_result("start")?;
        Ok(Box::new(ScriptedBackend {
            chunks: self.chunks.iter().cloned().collect(),
            read_delay: self.read_delay,
            end: self.end,
            failures_before: self.failures_before.iter().copied().collect(),
            served: 0,
            exited: false,
            calls: Arc::clone(&self.calls),
        }))
    }

    async fn sweep(&self) {
        self.calls.sweeps.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedBackend {
    chunks: VecDeque<Bytes>,
    read_delay: Duration,
    end: ScriptEnd,
    failures_before: VecDeque<usize>,
    served: usize,
    exited: bool,
    calls: Arc<Calls>,
}

#[async_trait]
impl CaptureBackend for ScriptedBackend {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }

        if self.failures_before.front() == Some(&self.served) {
            self.failures_before.pop_front();
            return Err(io::Error::other("scripted one-off read failure"));
        }

        if let Some(mut chunk) = self.chunks.pop_front() {
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            } else {
                self.served += 1;
            }
            return Ok(n);
        }

        match self.end {
            ScriptEnd::Idle => std::future::pending().await,
            ScriptEnd::Exit => {
                self.exited = true;
                Ok(0)
            }
            ScriptEnd::Fail => Err(io::Error::other("scripted read failure")),
        }
    }

    fn has_exited(&mut self) -> bool {
        self.exited
    }

    async fn stop(&mut self) {
        self.exited = true;
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_chunks_then_exits() {
        let factory = ScriptedFactory::numbered(2, 3).with_end(ScriptEnd::Exit);
        let mut backend = factory.start().await.unwrap();
        let mut buf = [0u8; 8];

        assert_eq!(backend.read_chunk(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], &[0, 0, 0]);
        assert_eq!(backend.read_chunk(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 1, 1]);
        assert_eq!(backend.read_chunk(&mut buf).await.unwrap(), 0);
        assert!(backend.has_exited());
    }

    #[tokio::test]
    async fn test_splits_chunks_larger_than_read_buffer() {
        let factory = ScriptedFactory::new(vec![Bytes::from_static(b"abcdef")]);
        let mut backend = factory.start().await.unwrap();
        let mut buf = [0u8; 4];

        assert_eq!(backend.read_chunk(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(backend.read_chunk(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[tokio::test]
    async fn test_one_off_failure_then_resumes() {
        let factory = ScriptedFactory::numbered(2, 3)
            .with_failure_before(1)
            .with_end(ScriptEnd::Exit);
        let mut backend = factory.start().await.unwrap();
        let mut buf = [0u8; 8];

        assert_eq!(backend.read_chunk(&mut buf).await.unwrap(), 3);
        assert!(backend.read_chunk(&mut buf).await.is_err());
        assert_eq!(backend.read_chunk(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 1, 1]);
        assert_eq!(backend.read_chunk(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_outcomes_are_consumed_in_order() {
        let factory = ScriptedFactory::numbered(0, 0)
            .with_probe_outcomes([StartOutcome::Unavailable])
            .with_start_outcomes([StartOutcome::Busy, StartOutcome::Ready]);

        assert!(matches!(
            factory.probe().await,
            Err(CaptureError::BackendUnavailable(_))
        ));
        assert!(factory.probe().await.is_ok());
        assert!(matches!(
            factory.start().await.err(),
            Some(CaptureError::BackendBusy(_))
        ));
        assert!(factory.start().await.is_ok());

        let counters = factory.counters();
        assert_eq!(counters.probes, 2);
        assert_eq!(counters.starts, 2);
    }
}
