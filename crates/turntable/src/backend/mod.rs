//! Capture backends.
//!
//! The supervisor only sees two seams: a [`BackendFactory`] that checks,
//! clears, starts and sweeps, and the running [`CaptureBackend`] it reads
//! from. [`command`] drives a real capture program (`pw-cat`, `arecord`, ...);
//! [`scripted`] replays fixed chunks for tests and demos.

pub mod command;
pub mod scripted;

use std::io;

use async_trait::async_trait;

use crate::error::CaptureError;

pub use command::{CommandBackend, CommandBackendFactory};
pub use scripted::{ScriptCounters, ScriptEnd, ScriptedFactory, StartOutcome};

/// A started capture source exposing its raw byte stream.
#[async_trait]
pub trait CaptureBackend: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    ///
    /// Must be cancel-safe: the supervisor races every read against its poll
    /// interval and a stop request.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Whether the underlying process has already ended.
    fn has_exited(&mut self) -> bool;

    /// Terminate politely, then forcibly. Never fails; problems are logged.
    async fn stop(&mut self);
}

/// Creates capture backends and handles the process-level chores around them.
#[async_trait]
pub trait BackendFactory: Send + Sync + 'static {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Cheap reachability check before anything is spawned.
    async fn probe(&self) -> Result<(), CaptureError>;

    /// Best-effort removal of whatever else holds the source.
    async fn clear_conflicts(&self);

    /// Start a backend, failing fast with `BackendUnavailable`/`BackendBusy`.
    async fn start(&self) -> Result<Box<dyn CaptureBackend>, CaptureError>;

    /// Make sure no backend process outlives the relay.
    async fn sweep(&self);
}
