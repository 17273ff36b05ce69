//! HTTP surface of the relay.
//!
//! `/stream` hands each client its own [`ClientStreamer`] writing into an
//! in-memory pipe whose read half is the response body. When the client goes
//! away hyper drops the body, the streamer's next write fails, and that
//! streamer ends. `/status` and `/` report the same buffer snapshot as JSON
//! and HTML.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tableconf::StreamConfig;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::buffer::BufferReader;
use crate::capture::CaptureStatusHandle;
use crate::streamer::ClientStreamer;

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Default)]
struct Clients {
    next_id: AtomicU64,
    active: AtomicUsize,
}

/// Decrements the active client count when the streamer ends.
struct ActiveClient(Arc<Clients>);

impl Drop for ActiveClient {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared state for web handlers
#[derive(Clone)]
pub struct WebState {
    reader: BufferReader,
    stream: Arc<StreamConfig>,
    chunk_size: usize,
    capture: CaptureStatusHandle,
    streamers: TaskTracker,
    cancel: CancellationToken,
    clients: Arc<Clients>,
}

impl WebState {
    pub fn new(
        reader: BufferReader,
        stream: StreamConfig,
        chunk_size: usize,
        capture: CaptureStatusHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            stream: Arc::new(stream),
            chunk_size: chunk_size.max(1),
            capture,
            streamers: TaskTracker::new(),
            cancel,
            clients: Arc::new(Clients::default()),
        }
    }

    /// Tracker holding every spawned client streamer.
    pub fn streamers(&self) -> &TaskTracker {
        &self.streamers
    }

    pub fn active_clients(&self) -> usize {
        self.clients.active.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let stats = self.reader.stats();
        let capture = self.capture.snapshot();
        StatusSnapshot {
            buffer_fill_percentage: round2(stats.fill_percentage()),
            buffer_size_mb: round2(stats.current_size as f64 / MB),
            max_buffer_mb: round2(stats.capacity as f64 / MB),
            chunks_in_buffer: stats.chunks_in_buffer,
            max_chunks_hint: stats.capacity / self.chunk_size,
            total_bytes_written: stats.bytes_written,
            total_bytes_read: stats.bytes_read,
            total_chunks_written: stats.chunks_written,
            total_chunks_read: stats.chunks_read,
            bytes_evicted: stats.bytes_evicted,
            chunks_evicted: stats.chunks_evicted,
            prebuffered: stats.ready,
            active_clients: self.active_clients(),
            capture_running: capture.running,
            capture_last_error: capture.last_error,
            server: "running",
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub buffer_fill_percentage: f64,
    pub buffer_size_mb: f64,
    pub max_buffer_mb: f64,
    pub chunks_in_buffer: usize,
    pub max_chunks_hint: usize,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
    pub total_chunks_written: u64,
    pub total_chunks_read: u64,
    pub bytes_evicted: u64,
    pub chunks_evicted: u64,
    pub prebuffered: bool,
    pub active_clients: usize,
    pub capture_running: bool,
    pub capture_last_error: Option<String>,
    pub server: &'static str,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/stream", get(stream_audio))
        .route("/stream.wav", get(stream_audio))
        .route("/status", get(status))
        .route("/", get(info_page))
        .fallback(not_found)
        .with_state(state)
}

/// Live audio for one client
async fn stream_audio(State(state): State<WebState>) -> Response {
    let id = state.clients.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let active = state.clients.active.fetch_add(1, Ordering::SeqCst) + 1;
    let guard = ActiveClient(Arc::clone(&state.clients));
    info!(client.id = id, "📱 Client {} connected ({} active)", id, active);

    let (body_half, streamer_half) = tokio::io::duplex(state.stream.pipe_capacity.max(1));
    let streamer = ClientStreamer::new(
        id,
        state.reader.clone(),
        (*state.stream).clone(),
        state.cancel.child_token(),
    );
    state.streamers.spawn(async move {
        let _guard = guard;
        streamer.run(streamer_half).await;
    });

    let body = Body::from_stream(ReaderStream::new(body_half));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, state.stream.format.content_type())
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "close")
        .body(body)
        .map_err(|e| {
            tracing::error!("Failed to build response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
        .unwrap_or_else(|status| status.into_response())
}

async fn status(State(state): State<WebState>) -> impl IntoResponse {
    Json(state.snapshot())
}

async fn info_page(State(state): State<WebState>) -> impl IntoResponse {
    let s = state.snapshot();
    let capture = match (s.capture_running, &s.capture_last_error) {
        (true, _) => "running".to_string(),
        (false, Some(e)) => format!("stopped ({})", escape_html(e)),
        (false, None) => "stopped".to_string(),
    };

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Turntable</title></head>
<body>
  <h2>🎵 Turntable Audio Relay</h2>
  <p><strong>Stream:</strong> <a href="/stream">/stream</a></p>
  <p><strong>Status:</strong> <a href="/status">/status</a></p>
  <p><strong>Buffer fill:</strong> {:.1}% ({:.2} MB / {:.2} MB)</p>
  <p><strong>Chunks in buffer:</strong> {} (~{} max)</p>
  <p><strong>Prebuffered:</strong> {}</p>
  <p><strong>Total data:</strong> written {:.1} MB, read {:.1} MB, evicted {:.1} MB</p>
  <p><strong>Clients:</strong> {}</p>
  <p><strong>Capture:</strong> {}</p>
</body>
</html>
"#,
        s.buffer_fill_percentage,
        s.buffer_size_mb,
        s.max_buffer_mb,
        s.chunks_in_buffer,
        s.max_chunks_hint,
        if s.prebuffered { "yes" } else { "no" },
        s.total_bytes_written as f64 / MB,
        s.total_bytes_read as f64 / MB,
        s.bytes_evicted as f64 / MB,
        s.active_clients,
        capture,
    ))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
