//! Configuration loading for the turntable audio relay.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/turntable/config.toml` (system)
//! 2. `~/.config/turntable/config.toml` (user)
//! 3. `./turntable.toml` (local override, replaced by `--config` when given)
//! 4. Environment variables (`TURNTABLE_*`)
//!
//! # Example Config
//!
//! ```toml
//! [buffer]
//! capacity_bytes = 5242880
//! prebuffer_fraction = 0.1
//! policy = "rearm"
//!
//! [capture]
//! program = "pw-cat"
//! target = "bluez_input.F4_04_4C_1A_E5_B9"
//!
//! [stream]
//! format = "wav"
//!
//! [bind]
//! port = 8888
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use sections::{
    BindConfig, BufferConfig, CaptureConfig, OutputFormat, PrebufferPolicy, ProbeConfig,
    ShutdownConfig, StreamConfig, TelemetryConfig,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TurntableConfig {
    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl TurntableConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace `./turntable.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and variables contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        let (mut config, mut sources) = loader::load_files(&files)?;

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Watchdog after the first shutdown signal.
    ///
    /// An explicit `shutdown.force_exit_ms` wins. Otherwise it covers the
    /// whole bounded shutdown sequence, so a capture program that ignores
    /// SIGTERM still gets killed and swept before the process exits.
    pub fn force_exit(&self) -> Duration {
        match self.shutdown.force_exit_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.capture.stop_bound() + self.shutdown.steps_after_capture(),
        }
    }

    /// Serialize the effective config to TOML.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# Turntable Configuration\n\n");
        match toml::to_string_pretty(self) {
            Ok(body) => output.push_str(&body),
            Err(e) => output.push_str(&format!("# failed to render config: {}\n", e)),
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TurntableConfig::default();
        assert_eq!(config.bind.port, 8888);
        assert_eq!(config.capture.program, "pw-cat");
        assert_eq!(config.stream.format, OutputFormat::Wav);
    }

    #[test]
    fn test_to_toml_round_trips() {
        let mut config = TurntableConfig::default();
        config.capture.target = Some("hw:2".to_string());
        config.buffer.policy = PrebufferPolicy::Sticky;

        let rendered = config.to_toml();
        assert!(rendered.contains("[buffer]"));
        assert!(rendered.contains("[capture]"));
        assert!(rendered.contains("policy = \"sticky\""));

        let parsed: TurntableConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.capture.target.as_deref(), Some("hw:2"));
        assert_eq!(parsed.buffer.policy, PrebufferPolicy::Sticky);
    }

    #[test]
    fn test_force_exit_covers_shutdown_steps() {
        let mut config = TurntableConfig::default();
        // 500 poll + 2000 grace + 1000 kill, then 3 x 2000 step bounds
        assert_eq!(config.force_exit(), Duration::from_millis(9_500));
        assert!(config.force_exit() > config.capture.stop_bound());

        config.shutdown.force_exit_ms = Some(1_500);
        assert_eq!(config.force_exit(), Duration::from_millis(1_500));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[bind]\nport = 9100\n").unwrap();

        let (config, sources) = TurntableConfig::load_with_sources_from(Some(&path)).unwrap();
        assert!(sources.files.contains(&path));
        // Env may still override the port on a developer machine.
        if !sources.env_overrides.iter().any(|k| k == "TURNTABLE_PORT") {
            assert_eq!(config.bind.port, 9100);
        }
    }
}
