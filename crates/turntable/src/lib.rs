//! Turntable - jitter-absorbing audio relay.
//!
//! Raw PCM from an external capture process is pushed into a bounded
//! [`StreamBuffer`](buffer::StreamBuffer) and drained to any number of HTTP
//! clients.
//!
//! ```text
//! capture process ──▶ CaptureSupervisor ──▶ StreamBuffer ──▶ ClientStreamer ──▶ GET /stream
//!                                                  │
//!                                                  └──▶ GET /status, GET /
//! ```
//!
//! - [`buffer`]: bounded FIFO with overflow eviction and the prebuffer gate
//! - [`backend`]: capture backends (external command, scripted fake)
//! - [`capture`]: background task feeding the buffer from a backend
//! - [`streamer`]: per-client loop draining the buffer
//! - [`web`]: axum routes
//! - [`lifecycle`]: start-up ordering and bounded, idempotent shutdown

pub mod backend;
pub mod buffer;
pub mod capture;
pub mod error;
pub mod lifecycle;
pub mod signals;
pub mod streamer;
pub mod telemetry;
pub mod wav;
pub mod web;

pub use buffer::{stream_buffer, BufferReader, BufferStats, BufferWriter, StreamBuffer};
pub use capture::{CaptureStatus, CaptureSupervisor};
pub use error::{CaptureError, LifecycleError, StreamError};
pub use lifecycle::{Phase, ServerLifecycle};
pub use streamer::{ClientStreamer, StreamEnd, StreamSummary};
pub use web::{router, StatusSnapshot, WebState};
