//! Configuration sections for the relay.
//!
//! Every field carries a serde default so a config file only needs to name
//! the values it changes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to the "ready to stream" gate once the buffer runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrebufferPolicy {
    /// The gate closes when a reader finds the buffer empty, so clients wait
    /// for a fresh prebuffer after a capture stall.
    #[default]
    Rearm,
    /// Once the first prebuffer completes the gate stays open forever.
    Sticky,
}

impl std::str::FromStr for PrebufferPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rearm" => Ok(Self::Rearm),
            "sticky" => Ok(Self::Sticky),
            other => Err(format!("unknown prebuffer policy: {}", other)),
        }
    }
}

/// Framing of the bytes sent to `/stream` clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Raw PCM behind a 44-byte streaming WAV header.
    #[default]
    Wav,
    /// Raw PCM, no header.
    Raw,
}

impl OutputFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Raw => "audio/pcm",
        }
    }
}

/// Streaming buffer sizing and prebuffer gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum bytes held before the oldest chunks are evicted.
    /// Default: 5 MiB
    #[serde(default = "BufferConfig::default_capacity_bytes")]
    pub capacity_bytes: usize,

    /// Fraction of capacity that must accumulate before streaming starts.
    /// Default: 0.10
    #[serde(default = "BufferConfig::default_prebuffer_fraction")]
    pub prebuffer_fraction: f64,

    /// Whether the prebuffer gate re-arms after the buffer drains.
    /// Default: rearm
    #[serde(default)]
    pub policy: PrebufferPolicy,

    /// Bytes requested per capture read.
    /// Default: 4096
    #[serde(default = "BufferConfig::default_chunk_size")]
    pub chunk_size: usize,
}

impl BufferConfig {
    fn default_capacity_bytes() -> usize {
        5 * 1024 * 1024
    }

    fn default_prebuffer_fraction() -> f64 {
        0.10
    }

    fn default_chunk_size() -> usize {
        4096
    }

    /// Prebuffer threshold in bytes.
    pub fn prebuffer_threshold(&self) -> usize {
        let fraction = if self.prebuffer_fraction.is_nan() {
            0.0
        } else {
            self.prebuffer_fraction.clamp(0.0, 1.0)
        };
        (self.capacity_bytes as f64 * fraction).floor() as usize
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: Self::default_capacity_bytes(),
            prebuffer_fraction: Self::default_prebuffer_fraction(),
            policy: PrebufferPolicy::default(),
            chunk_size: Self::default_chunk_size(),
        }
    }
}

/// Cheap command run before capture starts to check the source is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Substring the probe output must contain. Empty means exit status only.
    #[serde(default)]
    pub expect: String,
}

/// External capture process and its supervision timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Capture program producing raw audio on stdout.
    /// Default: pw-cat
    #[serde(default = "CaptureConfig::default_program")]
    pub program: String,

    /// Arguments for the capture program.
    /// Default: --record --format s16 --rate 44100 --channels 2 -
    #[serde(default = "CaptureConfig::default_args")]
    pub args: Vec<String>,

    /// Source node or device, passed as `--target <target>`.
    #[serde(default)]
    pub target: Option<String>,

    /// Optional reachability probe.
    #[serde(default)]
    pub probe: Option<ProbeConfig>,

    /// Output marker meaning another consumer holds the source.
    /// Default: "Device or resource busy"
    #[serde(default = "CaptureConfig::default_busy_marker")]
    pub busy_marker: String,

    /// Process patterns cleared when the source is busy.
    /// Default: ["bluealsa-aplay"]
    #[serde(default = "CaptureConfig::default_conflicting")]
    pub conflicting: Vec<String>,

    /// Kill leftover capture processes at the end of shutdown.
    /// Default: true
    #[serde(default = "CaptureConfig::default_sweep_on_shutdown")]
    pub sweep_on_shutdown: bool,

    /// Bounded wait per capture read.
    /// Default: 500
    #[serde(default = "CaptureConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive empty reads logged before warnings are suppressed.
    /// Default: 5
    #[serde(default = "CaptureConfig::default_empty_read_warn_limit")]
    pub empty_read_warn_limit: u32,

    /// Consecutive read errors treated as the backend having exited.
    /// Default: 3
    #[serde(default = "CaptureConfig::default_max_read_failures")]
    pub max_read_failures: u32,

    /// Window in which a freshly spawned backend may report busy/unavailable.
    /// Default: 300
    #[serde(default = "CaptureConfig::default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    /// Wait after SIGTERM before the backend is killed.
    /// Default: 2000
    #[serde(default = "CaptureConfig::default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Wait after SIGKILL before giving up on reaping the backend.
    /// Default: 1000
    #[serde(default = "CaptureConfig::default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
}

impl CaptureConfig {
    fn default_program() -> String {
        "pw-cat".to_string()
    }

    fn default_args() -> Vec<String> {
        ["--record", "--format", "s16", "--rate", "44100", "--channels", "2", "-"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn default_busy_marker() -> String {
        "Device or resource busy".to_string()
    }

    fn default_conflicting() -> Vec<String> {
        vec!["bluealsa-aplay".to_string()]
    }

    fn default_sweep_on_shutdown() -> bool {
        true
    }

    fn default_poll_interval_ms() -> u64 {
        500
    }

    fn default_empty_read_warn_limit() -> u32 {
        5
    }

    fn default_max_read_failures() -> u32 {
        3
    }

    fn default_startup_grace_ms() -> u64 {
        300
    }

    fn default_stop_grace_ms() -> u64 {
        2000
    }

    fn default_kill_timeout_ms() -> u64 {
        1000
    }

    /// Full argument list including `--target`, inserted before a trailing `-`.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(target) = &self.target {
            let at = if args.last().map(String::as_str) == Some("-") {
                args.len() - 1
            } else {
                args.len()
            };
            args.splice(at..at, ["--target".to_string(), target.clone()]);
        }
        args
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// Longest a capture stop can take: one poll, the terminate grace, then the kill.
    pub fn stop_bound(&self) -> Duration {
        self.poll_interval() + self.stop_grace() + self.kill_timeout()
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
            args: Self::default_args(),
            target: None,
            probe: None,
            busy_marker: Self::default_busy_marker(),
            conflicting: Self::default_conflicting(),
            sweep_on_shutdown: Self::default_sweep_on_shutdown(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            empty_read_warn_limit: Self::default_empty_read_warn_limit(),
            max_read_failures: Self::default_max_read_failures(),
            startup_grace_ms: Self::default_startup_grace_ms(),
            stop_grace_ms: Self::default_stop_grace_ms(),
            kill_timeout_ms: Self::default_kill_timeout_ms(),
        }
    }
}

/// Per-client streaming behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Default: wav
    #[serde(default)]
    pub format: OutputFormat,

    /// Declared in the WAV header.
    /// Default: 44100
    #[serde(default = "StreamConfig::default_sample_rate")]
    pub sample_rate: u32,

    /// Default: 2
    #[serde(default = "StreamConfig::default_channels")]
    pub channels: u16,

    /// Default: 16
    #[serde(default = "StreamConfig::default_bits_per_sample")]
    pub bits_per_sample: u16,

    /// Initial wait for the prebuffer before streaming starts anyway.
    /// Default: 10000
    #[serde(default = "StreamConfig::default_prebuffer_timeout_ms")]
    pub prebuffer_timeout_ms: u64,

    /// Wait for a re-armed prebuffer after an underrun.
    /// Default: 5000
    #[serde(default = "StreamConfig::default_refill_timeout_ms")]
    pub refill_timeout_ms: u64,

    /// Longest idle wait on an empty buffer.
    /// Default: 10
    #[serde(default = "StreamConfig::default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Bytes of in-memory pipe between a streamer and its HTTP body.
    /// Default: 65536
    #[serde(default = "StreamConfig::default_pipe_capacity")]
    pub pipe_capacity: usize,

    /// Progress log cadence.
    /// Default: 100
    #[serde(default = "StreamConfig::default_log_every_chunks")]
    pub log_every_chunks: u64,
}

impl StreamConfig {
    fn default_sample_rate() -> u32 {
        44100
    }

    fn default_channels() -> u16 {
        2
    }

    fn default_bits_per_sample() -> u16 {
        16
    }

    fn default_prebuffer_timeout_ms() -> u64 {
        10_000
    }

    fn default_refill_timeout_ms() -> u64 {
        5_000
    }

    fn default_idle_poll_ms() -> u64 {
        10
    }

    fn default_pipe_capacity() -> usize {
        64 * 1024
    }

    fn default_log_every_chunks() -> u64 {
        100
    }

    pub fn prebuffer_timeout(&self) -> Duration {
        Duration::from_millis(self.prebuffer_timeout_ms)
    }

    pub fn refill_timeout(&self) -> Duration {
        Duration::from_millis(self.refill_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            sample_rate: Self::default_sample_rate(),
            channels: Self::default_channels(),
            bits_per_sample: Self::default_bits_per_sample(),
            prebuffer_timeout_ms: Self::default_prebuffer_timeout_ms(),
            refill_timeout_ms: Self::default_refill_timeout_ms(),
            idle_poll_ms: Self::default_idle_poll_ms(),
            pipe_capacity: Self::default_pipe_capacity(),
            log_every_chunks: Self::default_log_every_chunks(),
        }
    }
}

/// HTTP listener address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    /// Default: 0.0.0.0
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// Default: 8888
    #[serde(default = "BindConfig::default_port")]
    pub port: u16,
}

impl BindConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        8888
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

/// Logging and optional OTLP export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or `EnvFilter` directive string.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// OTLP gRPC endpoint; unset means console logging only.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            otlp_endpoint: None,
        }
    }
}

/// Bounds on the shutdown sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Upper bound for each shutdown step.
    /// Default: 2000
    #[serde(default = "ShutdownConfig::default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Process exits this long after the first signal no matter what.
    /// Default: unset, derived from the step bounds (see `TurntableConfig::force_exit`)
    #[serde(default)]
    pub force_exit_ms: Option<u64>,
}

impl ShutdownConfig {
    fn default_step_timeout_ms() -> u64 {
        2000
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Sum of the step bounds shutdown runs after stopping capture:
    /// client streamers, the listener and the final sweep.
    pub fn steps_after_capture(&self) -> Duration {
        self.step_timeout() * 3
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: Self::default_step_timeout_ms(),
            force_exit_ms: None,
        }
    }
}
