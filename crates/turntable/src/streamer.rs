//! Per-client streaming loop.

use std::time::Duration;

use tableconf::{OutputFormat, PrebufferPolicy, StreamConfig};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::BufferReader;
use crate::error::StreamError;
use crate::wav::streaming_wav_header;

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    ClientDisconnected,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub client_id: u64,
    /// Bytes on the wire, header included.
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    /// Whether the prebuffer gate opened before the initial timeout.
    pub prebuffered: bool,
    pub end: StreamEnd,
}

/// Drains the shared buffer into one connection.
///
/// Chunks are written and flushed one at a time, in buffer order. Several
/// streamers on one buffer compete for chunks; each chunk goes to exactly one
/// of them.
pub struct ClientStreamer {
    id: u64,
    reader: BufferReader,
    config: StreamConfig,
    cancel: CancellationToken,
}

impl ClientStreamer {
    pub fn new(
        id: u64,
        reader: BufferReader,
        config: StreamConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            reader,
            config,
            cancel,
        }
    }

    /// Stream until the client goes away or the cancel token fires.
    pub async fn run<W>(self, mut conn: W) -> StreamSummary
    where
        W: AsyncWrite + Unpin,
    {
        let mut summary = StreamSummary {
            client_id: self.id,
            bytes_sent: 0,
            chunks_sent: 0,
            prebuffered: false,
            end: StreamEnd::Shutdown,
        };

        if let Err(StreamError::ClientDisconnected(e)) = self.stream(&mut conn, &mut summary).await {
            debug!(client.id = self.id, "Client disconnected: {}", e);
            summary.end = StreamEnd::ClientDisconnected;
        }

        info!(
            client.id = self.id,
            chunks = summary.chunks_sent,
            "👋 Client {} finished ({:?}), sent {:.2} MB",
            self.id,
            summary.end,
            summary.bytes_sent as f64 / (1024.0 * 1024.0)
        );
        summary
    }

    async fn stream<W>(&self, conn: &mut W, summary: &mut StreamSummary) -> Result<(), StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        let timeout = self.config.prebuffer_timeout();
        let ready = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            ready = self.reader.wait_until_ready(timeout) => ready,
        };
        summary.prebuffered = ready;
        if ready {
            debug!(
                client.id = self.id,
                buffer.fill = self.reader.fill_level(),
                "Prebuffer ready, streaming"
            );
        } else {
            warn!(
                client.id = self.id,
                "Prebuffer not reached within {:?}, streaming anyway", timeout
            );
        }

        if self.config.format == OutputFormat::Wav {
            let header = streaming_wav_header(&self.config);
            self.write(conn, &header).await?;
            summary.bytes_sent += header.len() as u64;
        }

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match self.reader.get() {
                Some(chunk) => {
                    if !self.write(conn, &chunk).await? {
                        return Ok(());
                    }
                    summary.bytes_sent += chunk.len() as u64;
                    summary.chunks_sent += 1;

                    let every = self.config.log_every_chunks;
                    if every > 0 && summary.chunks_sent % every == 0 {
                        info!(
                            client.id = self.id,
                            chunks = summary.chunks_sent,
                            buffer.fill = self.reader.fill_level(),
                            "🎵 Client {}: {:.2} MB sent",
                            self.id,
                            summary.bytes_sent as f64 / (1024.0 * 1024.0)
                        );
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = self.idle_wait() => {}
                    }
                }
            }
        }
    }

    /// Write and flush one buffer. Ok(false) when cancelled mid-write.
    async fn write<W>(&self, conn: &mut W, data: &[u8]) -> Result<bool, StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(false),
            written = async {
                conn.write_all(data).await?;
                conn.flush().await
            } => {
                written?;
                Ok(true)
            }
        }
    }

    async fn idle_wait(&self) {
        match self.reader.policy() {
            // An empty read closed the gate; wait for a fresh prebuffer.
            PrebufferPolicy::Rearm => {
                self.reader
                    .wait_until_ready(self.config.refill_timeout())
                    .await;
            }
            PrebufferPolicy::Sticky => {
                self.reader
                    .wait_for_data(self.config.idle_poll().max(Duration::from_millis(1)))
                    .await;
            }
        }
    }
}
