//! Capture supervision: one background task pulling chunks from a backend
//! into the stream buffer.
//!
//! The task reads with a bounded wait (`poll_interval`) so a stop request is
//! honoured within one poll even when the source is silent. Silence is not an
//! error: empty polls are counted and warned about, then the warnings are
//! suppressed until data flows again. The loop ends on stop, end of stream,
//! or repeated read failures, and always stops the backend on the way out.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tableconf::CaptureConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendFactory, CaptureBackend};
use crate::buffer::BufferWriter;
use crate::error::CaptureError;

const PROGRESS_EVERY_CHUNKS: u64 = 250;

/// Health of the capture path as shown on `/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStatus {
    pub running: bool,
    pub backend: String,
    pub consecutive_empty_reads: u32,
    pub chunks_captured: u64,
    pub bytes_captured: u64,
    pub last_error: Option<String>,
}

/// Shared, read-only view of [`CaptureStatus`].
#[derive(Debug, Clone, Default)]
pub struct CaptureStatusHandle(Arc<Mutex<CaptureStatus>>);

impl CaptureStatusHandle {
    pub fn snapshot(&self) -> CaptureStatus {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, CaptureStatus> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut CaptureStatus)) {
        f(&mut self.lock());
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy)]
struct LoopSettings {
    chunk_size: usize,
    poll_interval: Duration,
    empty_read_warn_limit: u32,
    max_read_failures: u32,
}

/// Owns the buffer's writer handle and at most one capture task at a time.
pub struct CaptureSupervisor {
    writer: Arc<BufferWriter>,
    config: CaptureConfig,
    chunk_size: usize,
    status: CaptureStatusHandle,
    worker: Option<Worker>,
}

impl CaptureSupervisor {
    pub fn new(writer: BufferWriter, config: CaptureConfig, chunk_size: usize) -> Self {
        Self {
            writer: Arc::new(writer),
            config,
            chunk_size: chunk_size.max(1),
            status: CaptureStatusHandle::default(),
            worker: None,
        }
    }

    pub fn status_handle(&self) -> CaptureStatusHandle {
        self.status.clone()
    }

    pub fn status(&self) -> CaptureStatus {
        self.status.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.status.snapshot().running
    }

    /// Upper bound on how long [`stop`](Self::stop) waits for the task.
    pub fn stop_bound(&self) -> Duration {
        self.config.stop_bound()
    }

    /// Start a backend from `factory` and spawn the capture task.
    ///
    /// Start-up failures are recorded as the last error and returned; nothing
    /// is left running. Calling this while a task is alive is a no-op.
    pub async fn start(&mut self, factory: Arc<dyn BackendFactory>) -> Result<(), CaptureError> {
        if let Some(worker) = &self.worker {
            if !worker.handle.is_finished() {
                debug!("capture already running");
                return Ok(());
            }
        }
        self.worker = None;

        let backend = match factory.start().await {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Capture backend {} failed to start: {}", factory.name(), e);
                let message = e.to_string();
                self.status.update(|s| {
                    s.running = false;
                    s.last_error = Some(message);
                });
                return Err(e);
            }
        };

        let name = factory.name().to_string();
        self.status.update(|s| {
            s.running = true;
            s.backend = name.clone();
            s.consecutive_empty_reads = 0;
            s.last_error = None;
        });

        let settings = LoopSettings {
            chunk_size: self.chunk_size,
            poll_interval: self.config.poll_interval(),
            empty_read_warn_limit: self.config.empty_read_warn_limit,
            max_read_failures: self.config.max_read_failures.max(1),
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(capture_loop(
            backend,
            Arc::clone(&self.writer),
            self.status.clone(),
            settings,
            cancel.clone(),
        ));

        info!("🎧 Capture started from {}", name);
        self.worker = Some(Worker { cancel, handle });
        Ok(())
    }

    /// Ask the capture task to stop and wait for it, bounded by [`stop_bound`](Self::stop_bound).
    ///
    /// Returns false when the task had to be aborted.
    pub async fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };

        worker.cancel.cancel();
        let bound = self.stop_bound();
        let mut handle = worker.handle;
        match tokio::time::timeout(bound, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Capture task failed: {}", e);
                self.status.update(|s| s.running = false);
                false
            }
            Err(_) => {
                warn!("Capture task did not stop within {:?}, aborting", bound);
                // Dropping the backend kills the child (kill_on_drop).
                handle.abort();
                self.status.update(|s| s.running = false);
                false
            }
        }
    }
}

impl Drop for CaptureSupervisor {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.cancel.cancel();
        }
    }
}

async fn capture_loop(
    mut backend: Box<dyn CaptureBackend>,
    writer: Arc<BufferWriter>,
    status: CaptureStatusHandle,
    settings: LoopSettings,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; settings.chunk_size];
    let mut empty_reads: u32 = 0;
    let mut failures: u32 = 0;
    let mut chunks: u64 = 0;

    let outcome: Option<CaptureError> = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break None,
            read = tokio::time::timeout(settings.poll_interval, backend.read_chunk(&mut buf)) => read,
        };

        match read {
            Err(_elapsed) => {
                if backend.has_exited() {
                    break Some(CaptureError::BackendExited("process ended".to_string()));
                }
                empty_reads = empty_reads.saturating_add(1);
                status.update(|s| s.consecutive_empty_reads = empty_reads);
                if empty_reads <= settings.empty_read_warn_limit {
                    warn!(empty_reads, "No audio data from capture");
                } else if empty_reads == settings.empty_read_warn_limit + 1 {
                    warn!(
                        "No audio data for {} polls, suppressing further warnings",
                        empty_reads
                    );
                }
            }
            Ok(Ok(0)) => {
                break Some(CaptureError::BackendExited("end of stream".to_string()));
            }
            Ok(Ok(n)) => {
                if empty_reads > settings.empty_read_warn_limit {
                    info!("🔊 Audio resumed after {} empty polls", empty_reads);
                }
                empty_reads = 0;
                failures = 0;
                chunks += 1;

                writer.put(Bytes::copy_from_slice(&buf[..n]));
                status.update(|s| {
                    s.consecutive_empty_reads = 0;
                    s.chunks_captured += 1;
                    s.bytes_captured += n as u64;
                });

                if chunks % PROGRESS_EVERY_CHUNKS == 0 {
                    let stats = writer.stats();
                    info!(
                        chunks,
                        buffer.fill = stats.fill_percentage(),
                        "📦 Captured {} chunks, buffer {:.2} MB",
                        chunks,
                        stats.current_size as f64 / (1024.0 * 1024.0)
                    );
                }
            }
            Ok(Err(e)) => {
                failures += 1;
                let failure = CaptureError::ReadFailure(e.to_string());
                warn!(failures, "{}", failure);
                status.update(|s| s.last_error = Some(failure.to_string()));
                if failures >= settings.max_read_failures {
                    break Some(CaptureError::BackendExited(format!(
                        "{} consecutive read failures, last: {}",
                        failures, e
                    )));
                }
            }
        }
    };

    backend.stop().await;

    match outcome {
        Some(e) => {
            error!("❌ {} (captured {} chunks)", e, chunks);
            status.update(|s| {
                s.running = false;
                s.last_error = Some(e.to_string());
            });
        }
        None => {
            info!("Capture stopped after {} chunks", chunks);
            status.update(|s| s.running = false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ScriptEnd, ScriptedFactory, StartOutcome};
    use crate::buffer::{split, StreamBuffer};
    use tableconf::PrebufferPolicy;

    fn capture_config() -> CaptureConfig {
        CaptureConfig {
            poll_interval_ms: 500,
            stop_grace_ms: 100,
            kill_timeout_ms: 100,
            ..Default::default()
        }
    }

    fn supervisor() -> (CaptureSupervisor, crate::buffer::BufferReader) {
        let (writer, reader) = split(StreamBuffer::new(1 << 20, 0, PrebufferPolicy::Sticky));
        (CaptureSupervisor::new(writer, capture_config(), 4096), reader)
    }

    async fn wait_stopped(supervisor: &CaptureSupervisor) {
        for _ in 0..500 {
            if !supervisor.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("capture never stopped");
    }

    #[tokio::test]
    async fn test_chunks_flow_into_buffer_until_backend_exits() {
        let (mut supervisor, reader) = supervisor();
        let factory = Arc::new(ScriptedFactory::numbered(10, 100).with_end(ScriptEnd::Exit));

        supervisor.start(factory.clone()).await.unwrap();
        wait_stopped(&supervisor).await;

        let stats = reader.stats();
        assert_eq!(stats.chunks_written, 10);
        assert_eq!(stats.current_size, 1000);
        assert_eq!(reader.get().unwrap()[0], 0);

        let status = supervisor.status();
        assert_eq!(status.chunks_captured, 10);
        assert!(status.last_error.unwrap().contains("exited"));
        assert_eq!(factory.counters().stops, 1);
        assert!(supervisor.stop().await);
    }

    #[tokio::test]
    async fn test_busy_start_records_error_and_spawns_nothing() {
        let (mut supervisor, _reader) = supervisor();
        let factory = Arc::new(ScriptedFactory::numbered(1, 10).with_start_outcomes([StartOutcome::Busy]));

        let err = supervisor.start(factory).await.unwrap_err();
        assert!(err.is_busy());
        assert!(!supervisor.is_running());
        assert!(supervisor.status().last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_counted_but_not_fatal() {
        let (mut supervisor, _reader) = supervisor();
        let factory = Arc::new(ScriptedFactory::numbered(0, 0).with_end(ScriptEnd::Idle));

        supervisor.start(factory.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_600)).await;

        let status = supervisor.status();
        assert!(status.running);
        assert!(status.consecutive_empty_reads >= 6);
        assert!(status.last_error.is_none());

        assert!(supervisor.stop().await);
        assert!(!supervisor.is_running());
        assert_eq!(factory.counters().stops, 1);
    }

    #[tokio::test]
    async fn test_repeated_read_failures_end_capture() {
        let (mut supervisor, _reader) = supervisor();
        let factory = Arc::new(ScriptedFactory::numbered(2, 10).with_end(ScriptEnd::Fail));

        supervisor.start(factory).await.unwrap();
        wait_stopped(&supervisor).await;

        let status = supervisor.status();
        assert_eq!(status.chunks_captured, 2);
        assert!(status.last_error.unwrap().contains("consecutive read failures"));
    }

    #[tokio::test]
    async fn test_single_read_failure_keeps_capturing() {
        let (mut supervisor, reader) = supervisor();
        let factory = Arc::new(
            ScriptedFactory::numbered(3, 10)
                .with_failure_before(0)
                .with_end(ScriptEnd::Idle),
        );

        supervisor.start(factory.clone()).await.unwrap();
        for _ in 0..200 {
            if reader.stats().chunks_written == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(reader.stats().chunks_written, 3);
        for i in 0..3u8 {
            assert_eq!(reader.get().unwrap()[0], i);
        }
        let status = supervisor.status();
        assert!(status.running);
        assert_eq!(status.chunks_captured, 3);
        assert!(status.last_error.unwrap().contains("one-off read failure"));

        assert!(supervisor.stop().await);
        assert_eq!(factory.counters().stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_a_pending_read() {
        let (mut supervisor, _reader) = supervisor();
        let factory = Arc::new(ScriptedFactory::numbered(0, 0).with_end(ScriptEnd::Idle));
        supervisor.start(factory).await.unwrap();

        let started = tokio::time::Instant::now();
        assert!(supervisor.stop().await);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_restart_after_exit() {
        let (mut supervisor, reader) = supervisor();
        let factory = Arc::new(ScriptedFactory::numbered(3, 10).with_end(ScriptEnd::Exit));

        supervisor.start(factory.clone()).await.unwrap();
        wait_stopped(&supervisor).await;
        supervisor.start(factory.clone()).await.unwrap();
        wait_stopped(&supervisor).await;

        assert_eq!(reader.stats().chunks_written, 6);
        assert_eq!(factory.counters().starts, 2);
    }
}
