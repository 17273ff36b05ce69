//! Error types for the relay.

use std::time::Duration;

/// Failures of the capture path.
///
/// Payloads are strings so the same error can be recorded as the
/// supervisor's last error and handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// The backend cannot be started at all.
    #[error("Capture backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Another consumer holds the audio source.
    #[error("Capture backend busy: {0}")]
    BackendBusy(String),

    /// The backend process ended while we were reading from it.
    #[error("Capture backend exited: {0}")]
    BackendExited(String),

    /// I/O error on the backend stream.
    #[error("Capture read failed: {0}")]
    ReadFailure(String),
}

impl CaptureError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::BackendBusy(_))
    }
}

/// Failures local to one streaming client.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Client disconnected: {0}")]
    ClientDisconnected(#[from] std::io::Error),
}

/// Failures of the start/stop sequence.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Cannot {action} while {phase}")]
    InvalidPhase {
        action: &'static str,
        phase: &'static str,
    },

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("{step} did not finish within {timeout:?}")]
    ShutdownTimeout {
        step: &'static str,
        timeout: Duration,
    },
}
