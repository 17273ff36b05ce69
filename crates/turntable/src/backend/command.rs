//! Capture through an external program writing raw PCM to stdout.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tableconf::{CaptureConfig, ProbeConfig};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BackendFactory, CaptureBackend};
use crate::error::CaptureError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CONFLICT_SETTLE: Duration = Duration::from_secs(1);
const STDERR_DRAIN: Duration = Duration::from_millis(200);

/// A running capture process.
pub struct CommandBackend {
    program: String,
    child: Child,
    stdout: ChildStdout,
    stderr_task: JoinHandle<()>,
    stop_grace: Duration,
    kill_timeout: Duration,
}

impl CommandBackend {
    /// Spawn the capture program and watch it through the startup grace window.
    pub async fn spawn(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let args = config.command_args();
        debug!(program = %config.program, ?args, "spawning capture process");

        let mut child = Command::new(&config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CaptureError::BackendUnavailable(format!("failed to spawn {}: {}", config.program, e))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            CaptureError::BackendUnavailable(format!("{} has no stdout pipe", config.program))
        })?;

        let busy = Arc::new(AtomicBool::new(false));
        let mut stderr_task = match child.stderr.take() {
            Some(stderr) => watch_stderr(
                config.program.clone(),
                stderr,
                config.busy_marker.clone(),
                Arc::clone(&busy),
            ),
            None => tokio::spawn(async {}),
        };

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(config.startup_grace()) => None,
        };

        if let Some(status) = exited {
            // Let the stderr watcher see the last lines before judging.
            let _ = tokio::time::timeout(STDERR_DRAIN, &mut stderr_task).await;
            let status = status
                .map(|s| s.to_string())
                .unwrap_or_else(|e| e.to_string());
            return Err(if busy.load(Ordering::SeqCst) {
                CaptureError::BackendBusy(format!("{} exited: {}", config.program, status))
            } else {
                CaptureError::BackendUnavailable(format!(
                    "{} exited during startup: {}",
                    config.program, status
                ))
            });
        }

        let mut backend = Self {
            program: config.program.clone(),
            child,
            stdout,
            stderr_task,
            stop_grace: config.stop_grace(),
            kill_timeout: config.kill_timeout(),
        };

        if busy.load(Ordering::SeqCst) {
            backend.stop().await;
            return Err(CaptureError::BackendBusy(format!(
                "{} reported '{}'",
                config.program, config.busy_marker
            )));
        }

        if let Some(pid) = backend.child.id() {
            info!("🎙️  Capture process {} running (pid {})", backend.program, pid);
        }
        Ok(backend)
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to {} failed: {}", self.program, e);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}
}

fn watch_stderr(
    program: String,
    stderr: ChildStderr,
    marker: String,
    busy: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !marker.is_empty() && line.contains(&marker) {
                busy.store(true, Ordering::SeqCst);
            }
            debug!(target: "turntable::capture::stderr", "{}: {}", program, line);
        }
    })
}

#[async_trait]
impl CaptureBackend for CommandBackend {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf).await
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    async fn stop(&mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("{} already exited: {}", self.program, status);
            self.stderr_task.abort();
            return;
        }

        self.terminate();
        match tokio::time::timeout(self.stop_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("{} stopped: {}", self.program, status);
            }
            Ok(Err(e)) => warn!("Waiting for {} failed: {}", self.program, e),
            Err(_) => {
                warn!(
                    "{} ignored terminate for {:?}, killing",
                    self.program, self.stop_grace
                );
                if let Err(e) = self.child.start_kill() {
                    warn!("Failed to kill {}: {}", self.program, e);
                }
                if tokio::time::timeout(self.kill_timeout, self.child.wait())
                    .await
                    .is_err()
                {
                    warn!("{} not reaped after kill", self.program);
                }
            }
        }

        self.stderr_task.abort();
    }
}

/// Factory for [`CommandBackend`] built from the `[capture]` config section.
#[derive(Debug, Clone)]
pub struct CommandBackendFactory {
    config: CaptureConfig,
}

impl CommandBackendFactory {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    async fn run_probe(&self, probe: &ProbeConfig) -> Result<(), CaptureError> {
        let output = tokio::time::timeout(
            PROBE_TIMEOUT,
            Command::new(&probe.program)
                .args(&probe.args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            CaptureError::BackendUnavailable(format!(
                "probe {} timed out after {:?}",
                probe.program, PROBE_TIMEOUT
            ))
        })?
        .map_err(|e| {
            CaptureError::BackendUnavailable(format!("probe {} failed: {}", probe.program, e))
        })?;

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        probe_verdict(
            &probe.program,
            output.status.success(),
            &text,
            &probe.expect,
            &self.config.busy_marker,
        )
    }
}

fn probe_verdict(
    program: &str,
    success: bool,
    text: &str,
    expect: &str,
    busy_marker: &str,
) -> Result<(), CaptureError> {
    if !busy_marker.is_empty() && text.contains(busy_marker) {
        return Err(CaptureError::BackendBusy(format!(
            "probe {} reported '{}'",
            program, busy_marker
        )));
    }
    if !success {
        return Err(CaptureError::BackendUnavailable(format!(
            "probe {} exited unsuccessfully",
            program
        )));
    }
    if !expect.is_empty() && !text.contains(expect) {
        return Err(CaptureError::BackendUnavailable(format!(
            "probe {} output lacks '{}'",
            program, expect
        )));
    }
    Ok(())
}

/// Resolve `program` the way a shell would: paths as-is, bare names on `PATH`.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

async fn pkill(args: &[&str]) {
    match Command::new("pkill")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        // pkill exits 1 when nothing matched
        Ok(status) => debug!(?args, code = status.code(), "pkill finished"),
        Err(e) => warn!("pkill {:?} failed: {}", args, e),
    }
}

#[async_trait]
impl BackendFactory for CommandBackendFactory {
    fn name(&self) -> &str {
        &self.config.program
    }

    async fn probe(&self) -> Result<(), CaptureError> {
        match &self.config.probe {
            Some(probe) => self.run_probe(probe).await,
            None => resolve_program(&self.config.program).map(|_| ()).ok_or_else(|| {
                CaptureError::BackendUnavailable(format!("{} not found on PATH", self.config.program))
            }),
        }
    }

    async fn clear_conflicts(&self) {
        if self.config.conflicting.is_empty() {
            return;
        }
        for pattern in &self.config.conflicting {
            info!("🧹 Clearing conflicting consumer: {}", pattern);
            pkill(&["-f", pattern]).await;
        }
        tokio::time::sleep(CONFLICT_SETTLE).await;
    }

    async fn start(&self) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        let backend = CommandBackend::spawn(&self.config).await?;
        Ok(Box::new(backend))
    }

    async fn sweep(&self) {
        if !self.config.sweep_on_shutdown {
            return;
        }
        let Some(name) = Path::new(&self.config.program)
            .file_name()
            .and_then(|n| n.to_str())
        else {
            return;
        };
        debug!("Sweeping leftover {} processes", name);
        pkill(&["-x", name]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(program: &str, args: &[&str]) -> CaptureConfig {
        CaptureConfig {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            startup_grace_ms: 100,
            stop_grace_ms: 500,
            kill_timeout_ms: 500,
            sweep_on_shutdown: false,
            conflicting: Vec::new(),
            ..Default::default()
        }
    }

    #[test]
    fn test_probe_verdict() {
        let busy = "Device or resource busy";
        assert!(probe_verdict("p", true, "Connected: yes", "Connected: yes", busy).is_ok());
        assert!(matches!(
            probe_verdict("p", true, "Connected: no", "Connected: yes", busy),
            Err(CaptureError::BackendUnavailable(_))
        ));
        assert!(matches!(
            probe_verdict("p", false, "", "", busy),
            Err(CaptureError::BackendUnavailable(_))
        ));
        assert!(matches!(
            probe_verdict("p", false, "open: Device or resource busy", "", busy),
            Err(CaptureError::BackendBusy(_))
        ));
    }

    #[test]
    fn test_resolve_program() {
        assert!(resolve_program("definitely-not-a-capture-tool-xyz").is_none());
        assert!(resolve_program("/nonexistent/dir/pw-cat").is_none());
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let factory = CommandBackendFactory::new(config("definitely-not-a-capture-tool-xyz", &[]));
        assert!(matches!(
            factory.probe().await,
            Err(CaptureError::BackendUnavailable(_))
        ));
        assert!(matches!(
            factory.start().await.err(),
            Some(CaptureError::BackendUnavailable(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_busy_marker_on_stderr() {
        let factory = CommandBackendFactory::new(config(
            "sh",
            &["-c", "echo 'audio open error: Device or resource busy' >&2; exit 1"],
        ));
        assert!(matches!(
            factory.start().await.err(),
            Some(CaptureError::BackendBusy(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reads_stdout_and_stops() {
        let factory =
            CommandBackendFactory::new(config("sh", &["-c", "printf 'pcm-bytes'; exec sleep 30"]));
        let mut backend = factory.start().await.unwrap();

        let mut buf = [0u8; 64];
        let n = backend.read_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pcm-bytes");
        assert!(!backend.has_exited());

        backend.stop().await;
        assert!(backend.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_a_process_ignoring_sigterm() {
        let mut config = config(
            "sh",
            &["-c", "trap '' TERM; printf x; while :; do sleep 0.05; done"],
        );
        config.stop_grace_ms = 300;
        let mut backend = CommandBackendFactory::new(config).start().await.unwrap();

        let mut buf = [0u8; 8];
        let n = backend.read_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"x");

        let started = std::time::Instant::now();
        backend.stop().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(300), "stopped after {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(300 + 500 + 500), "stopped after {:?}", elapsed);
        assert!(backend.has_exited());
    }
}
