//! Start-up ordering and idempotent, bounded shutdown.
//!
//! ```text
//! Idle ──start()──▶ Starting ──ok──▶ Running ──shutdown()──▶ ShuttingDown ──▶ Stopped
//!   ▲                  │
//!   └──────failure─────┘
//! ```
//!
//! The phase lives in an atomic; entering `ShuttingDown` is a compare-and-swap
//! from `Running`, so concurrent shutdown triggers run the sequence once.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tableconf::TurntableConfig;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::BackendFactory;
use crate::buffer::stream_buffer;
use crate::capture::CaptureSupervisor;
use crate::error::{CaptureError, LifecycleError};
use crate::web::{router, WebState};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle = 0,
    Starting = 1,
    Running = 2,
    ShuttingDown = 3,
    Stopped = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        }
    }
}

/// Everything that exists only while the relay is running.
struct Running {
    supervisor: CaptureSupervisor,
    web: WebState,
    accept_cancel: CancellationToken,
    streamer_cancel: CancellationToken,
    server: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct ServerLifecycle {
    config: TurntableConfig,
    factory: Arc<dyn BackendFactory>,
    phase: AtomicU8,
    phase_tx: watch::Sender<Phase>,
    running: Mutex<Option<Running>>,
}

impl ServerLifecycle {
    pub fn new(config: TurntableConfig, factory: Arc<dyn BackendFactory>) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        Self {
            config,
            factory,
            phase: AtomicU8::new(Phase::Idle as u8),
            phase_tx,
            running: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
        self.phase_tx.send_replace(phase);
    }

    fn transition(&self, from: Phase, to: Phase) -> Result<(), Phase> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| {
                self.phase_tx.send_replace(to);
            })
            .map_err(Phase::from_u8)
    }

    /// Address the HTTP listener is bound to, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Resolve once the shutdown sequence has finished.
    pub async fn wait_stopped(&self) {
        let mut rx = self.phase_tx.subscribe();
        let _ = rx.wait_for(|phase| *phase == Phase::Stopped).await;
    }

    /// Probe the backend, start capture, then open the listener.
    ///
    /// On failure everything partially started is torn down and the phase
    /// returns to `Idle`.
    pub async fn start(&self) -> Result<SocketAddr, LifecycleError> {
        self.transition(Phase::Idle, Phase::Starting)
            .map_err(|phase| LifecycleError::InvalidPhase {
                action: "start",
                phase: phase.as_str(),
            })?;

        match self.bring_up().await {
            Ok(running) => {
                let addr = running.local_addr;
                *self.running.lock().await = Some(running);
                self.set_phase(Phase::Running);
                Ok(addr)
            }
            Err(e) => {
                error!("❌ Start-up failed: {}", e);
                self.set_phase(Phase::Idle);
                Err(e)
            }
        }
    }

    /// Like [`start`](Self::start), but give up as soon as `interrupt` resolves.
    ///
    /// Whatever was half started is dropped, the backend is swept and the
    /// phase ends at `Stopped`. Returns `Ok(None)` when interrupted.
    pub async fn start_until(
        &self,
        interrupt: impl Future<Output = ()>,
    ) -> Result<Option<SocketAddr>, LifecycleError> {
        tokio::select! {
            biased;
            _ = interrupt => {}
            started = self.start() => return started.map(Some),
        }

        warn!("Start-up interrupted");
        self.sweep().await;
        self.set_phase(Phase::Stopped);
        Ok(None)
    }

    async fn bring_up(&self) -> Result<Running, LifecycleError> {
        let (writer, reader) = stream_buffer(&self.config.buffer);
        let mut supervisor = CaptureSupervisor::new(
            writer,
            self.config.capture.clone(),
            self.config.buffer.chunk_size,
        );

        info!("🔍 Checking capture backend {}", self.factory.name());
        match self.probe_and_start(&mut supervisor).await {
            Err(e) if e.is_busy() => {
                warn!("Capture source busy ({}), clearing conflicts and retrying", e);
                self.factory.clear_conflicts().await;
                self.probe_and_start(&mut supervisor).await?;
            }
            other => other?,
        }

        let addr = self.config.bind.addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                supervisor.stop().await;
                return Err(LifecycleError::Bind { addr, source });
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local) => local,
            Err(source) => {
                supervisor.stop().await;
                return Err(LifecycleError::Bind { addr, source });
            }
        };

        let accept_cancel = CancellationToken::new();
        let streamer_cancel = CancellationToken::new();
        let web = WebState::new(
            reader,
            self.config.stream.clone(),
            self.config.buffer.chunk_size,
            supervisor.status_handle(),
            streamer_cancel.clone(),
        );

        let app = router(web.clone());
        let token = accept_cancel.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        });

        info!("🎵 Turntable relay listening on http://{}", local_addr);
        info!("   Stream: GET http://{}/stream", local_addr);
        info!("   Status: GET http://{}/status", local_addr);

        Ok(Running {
            supervisor,
            web,
            accept_cancel,
            streamer_cancel,
            server,
            local_addr,
        })
    }

    async fn probe_and_start(&self, supervisor: &mut CaptureSupervisor) -> Result<(), CaptureError> {
        self.factory.probe().await?;
        supervisor.start(Arc::clone(&self.factory)).await
    }

    /// Run the shutdown sequence once.
    ///
    /// Returns true for the caller that performed it; every other caller,
    /// including ones arriving while it runs, gets false immediately.
    pub async fn shutdown(&self) -> bool {
        if let Err(phase) = self.transition(Phase::Running, Phase::ShuttingDown) {
            debug!("Shutdown ignored while {}", phase.as_str());
            return false;
        }

        info!("🛑 Shutting down relay");
        let step = self.config.shutdown.step_timeout();
        let running = self.running.lock().await.take();

        if let Some(mut running) = running {
            running.accept_cancel.cancel();

            if !running.supervisor.stop().await {
                log_timeout("capture stop", running.supervisor.stop_bound());
            }

            running.streamer_cancel.cancel();
            let streamers = running.web.streamers();
            streamers.close();
            if tokio::time::timeout(step, streamers.wait()).await.is_err() {
                log_timeout("client streamers", step);
            }

            if tokio::time::timeout(step, &mut running.server).await.is_err() {
                log_timeout("http listener", step);
                running.server.abort();
            }
        }

        self.sweep().await;

        self.set_phase(Phase::Stopped);
        info!("✅ Relay stopped");
        true
    }

    async fn sweep(&self) {
        let step = self.config.shutdown.step_timeout();
        if tokio::time::timeout(step, self.factory.sweep()).await.is_err() {
            log_timeout("backend sweep", step);
        }
    }
}

fn log_timeout(step: &'static str, timeout: Duration) {
    warn!("{}, continuing shutdown", LifecycleError::ShutdownTimeout { step, timeout });
}
