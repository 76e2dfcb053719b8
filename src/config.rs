use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::assets;
use crate::error::ConfigError;
use crate::pipeline::receiver::{ReceiverConfig, SchedulerConfig, SessionConfig};
use crate::pipeline::types::Transport;

/// Player settings, loaded from an optional JSON file and overridden by CLI flags
///
/// Durations are whole milliseconds, matching window and horizon are seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlayerConfig {
    pub host: String,
    pub video_port: u16,
    pub audio_port: u16,
    pub control_port: u16,
    pub transport: Transport,
    /// Pairing window for timestamp matching, in seconds
    pub tolerance: f64,
    /// Units older than this behind the playback position are dropped, in seconds
    pub staleness_horizon: f64,
    pub warm_up_ms: u64,
    pub max_frame_len: usize,
    pub audio_chunk_bytes: usize,
    pub connect_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub health_log_interval_ms: u64,
    pub stall_threshold_ms: u64,
    pub quit_poll_interval_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            host: assets::DEFAULT_HOST.into(),
            video_port: assets::VIDEO_PORT,
            audio_port: assets::AUDIO_PORT,
            control_port: assets::CONTROL_PORT,
            transport: Transport::Raw,
            tolerance: assets::MATCH_TOLERANCE,
            staleness_horizon: assets::STALENESS_HORIZON,
            warm_up_ms: assets::WARM_UP_MS,
            max_frame_len: assets::MAX_FRAME_LEN,
            audio_chunk_bytes: assets::AUDIO_CHUNK_BYTES,
            connect_timeout_ms: assets::CONNECT_TIMEOUT_MS,
            shutdown_grace_ms: assets::SHUTDOWN_GRACE_MS,
            health_log_interval_ms: assets::HEALTH_LOG_INTERVAL_MS,
            stall_threshold_ms: assets::STALL_THRESHOLD_MS,
            quit_poll_interval_ms: assets::QUIT_POLL_INTERVAL_MS,
        }
    }
}

impl PlayerConfig {
    /// Read a JSON config file; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("tolerance", self.tolerance > 0.0 && self.tolerance.is_finite()),
            (
                "staleness_horizon",
                self.staleness_horizon > 0.0 && self.staleness_horizon.is_finite(),
            ),
            ("max_frame_len", self.max_frame_len > 0),
            ("audio_chunk_bytes", self.audio_chunk_bytes > 0),
            ("quit_poll_interval_ms", self.quit_poll_interval_ms > 0),
            ("health_log_interval_ms", self.health_log_interval_ms > 0),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, ok)| !ok) {
            return Err(ConfigError::NotPositive { field });
        }

        let ports = [
            ("video", self.video_port),
            ("audio", self.audio_port),
            ("control", self.control_port),
        ];
        for (i, (first, port)) in ports.iter().enumerate() {
            if let Some((second, _)) = ports[i + 1..].iter().find(|(_, other)| other == port) {
                return Err(ConfigError::PortClash {
                    first: *first,
                    second: *second,
                    port: *port,
                });
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn addr(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }

    pub fn receiver(&self) -> ReceiverConfig {
        ReceiverConfig {
            transport: self.transport,
            max_frame_len: self.max_frame_len,
            audio_chunk_bytes: self.audio_chunk_bytes,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            tolerance: self.tolerance,
            warm_up: Duration::from_millis(self.warm_up_ms),
            quit_poll_interval: Duration::from_millis(self.quit_poll_interval_ms),
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            receiver: self.receiver(),
            scheduler: self.scheduler(),
            horizon: Duration::from_secs_f64(self.staleness_horizon),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            health_log_interval: Duration::from_millis(self.health_log_interval_ms),
            stall_threshold: Duration::from_millis(self.stall_threshold_ms),
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
