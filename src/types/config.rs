//! Configuration structures.
//!
//! Configuration has serde defaults and can be overridden from `NGSOCK_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::ErrorMode;

/// Global ngsock configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Control/data socket configuration.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Dispatcher behaviour.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Defaults overridden by `NGSOCK_*` environment variables.
    ///
    /// Recognized: `NGSOCK_ENGINE_CONTROL`, `NGSOCK_ENGINE_DATA`,
    /// `NGSOCK_LOCAL_DIR`, `NGSOCK_REPLY_TIMEOUT` (humantime, e.g. `2s`),
    /// `NGSOCK_LOG_LEVEL`. Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("NGSOCK_ENGINE_CONTROL") {
            config.channel.engine_control = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("NGSOCK_ENGINE_DATA") {
            config.channel.engine_data = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("NGSOCK_LOCAL_DIR") {
            config.channel.local_dir = Some(PathBuf::from(dir));
        }
        if let Ok(raw) = std::env::var("NGSOCK_REPLY_TIMEOUT") {
            match humantime_serde::re::humantime::parse_duration(&raw) {
                Ok(timeout) => config.dispatch.reply_timeout = timeout,
                Err(e) => tracing::warn!("ignoring NGSOCK_REPLY_TIMEOUT={}: {}", raw, e),
            }
        }
        if let Ok(level) = std::env::var("NGSOCK_LOG_LEVEL") {
            config.observability.log_level = level;
        }
        config
    }
}

/// Control/data socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Engine control socket path.
    pub engine_control: PathBuf,

    /// Engine data socket path.
    pub engine_data: PathBuf,

    /// Directory for the local socket files. Defaults to a per-process
    /// directory under the system temp dir.
    #[serde(default)]
    pub local_dir: Option<PathBuf>,

    /// Largest datagram sent or accepted, header included.
    pub max_datagram_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            engine_control: PathBuf::from("/var/run/ngsock/control.sock"),
            engine_data: PathBuf::from("/var/run/ngsock/data.sock"),
            local_dir: None,
            max_datagram_bytes: 64 * 1024,
        }
    }
}

/// Dispatcher behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How long a transmit waits for the engine's status reply.
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,

    /// Poll timeout used by callers that do not pick their own.
    #[serde(with = "humantime_serde")]
    pub default_poll_timeout: Duration,

    /// Error mode the dispatcher starts in.
    #[serde(default)]
    pub initial_mode: ErrorMode,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(2),
            default_poll_timeout: Duration::from_millis(50),
            initial_mode: ErrorMode::Strict,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.dispatch.reply_timeout, Duration::from_secs(2));
        assert_eq!(config.dispatch.default_poll_timeout, Duration::from_millis(50));
        assert_eq!(config.dispatch.initial_mode, ErrorMode::Strict);
        assert_eq!(config.channel.max_datagram_bytes, 65536);
    }

    #[test]
    fn test_deserialize_humantime() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "dispatch": {
                "reply_timeout": "500ms",
                "default_poll_timeout": "1s",
                "initial_mode": "tolerant"
            }
        }))
        .unwrap();
        assert_eq!(config.dispatch.reply_timeout, Duration::from_millis(500));
        assert_eq!(config.dispatch.default_poll_timeout, Duration::from_secs(1));
        assert_eq!(config.dispatch.initial_mode, ErrorMode::Tolerant);
        assert_eq!(config.observability.log_level, "info");
    }
}
