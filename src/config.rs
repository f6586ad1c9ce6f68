//! # Configuration Management
//!
//! Loads the transport configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables such as `APP_CONNECTIONS__MAX_CONNECTIONS=20`
//! - `HOST` / `PORT`, which deployment platforms commonly set
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: derive macros turn these structs into/from TOML, JSON and env maps
//! - **Nested structs**: one struct per concern keeps the settings discoverable
//! - **Result<T, E>**: every loading step can fail and is propagated with `?`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file (config.toml)
//! 3. Default values

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub connections: ConnectionsConfig,
    pub audio: AudioConfig,
    pub playback: PlaybackConfig,
    pub resilience: ResilienceConfig,
    pub pipeline: PipelineConfig,
}

/// Where the HTTP/WebSocket server listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection registry settings.
///
/// ## Fields:
/// - `max_connections`: admission ceiling; the oldest connection is evicted beyond it
/// - `connection_timeout`: seconds without activity before the idle sweep reaps a connection
/// - `sweep_interval_seconds`: pause between two idle sweeps
/// - `terminal_grace_seconds`: delay between a terminal state and removal, for in-flight cleanup
/// - `ice_failure_threshold`: ICE-layer failures that force removal
/// - `heartbeat_interval_seconds` / `heartbeat_timeout_seconds`: WebSocket liveness checks;
///   a missed heartbeat counts as one ICE-layer failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionsConfig {
    pub max_connections: usize,
    pub connection_timeout: u64,
    pub sweep_interval_seconds: u64,
    pub terminal_grace_seconds: u64,
    pub ice_failure_threshold: u32,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    pub event_channel_capacity: usize,
}

/// Inbound audio (peer → AI pipeline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
    pub buffer_capacity_bytes: usize,
    /// How long `frame_stream` sleeps when no full frame is buffered yet
    pub frame_poll_interval_ms: u64,
    /// Buffer fill percentage above which overload is logged
    pub buffer_warn_percent: f64,
    /// Capacity of the channel between the socket actor and the ingestion task
    pub inbound_channel_capacity: usize,
}

/// Outbound audio (AI pipeline → peer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub playback_queue_capacity: usize,
    /// Bounded wait on the queue before a silence frame is emitted
    pub recv_timeout_ms: u64,
}

/// Retry, circuit breaker and degraded-mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    pub retry_delay_seconds: f64,
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_timeout_seconds: u64,
    /// Text sent to the user while any service is unhealthy
    pub fallback_message: String,
    /// Optional pre-rendered WAV of the fallback message; empty means a generated chime
    pub fallback_audio_path: String,
}

/// Which AI pipeline a new connection is wired to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// `echo` loops inbound frames back as synthesized audio
    pub mode: String,
    /// Capacity of the per-connection pipeline output channel
    pub output_channel_capacity: usize,
}

pub const DEFAULT_FALLBACK_MESSAGE: &str = "I'm experiencing some technical difficulties right now. \
Please try again in a moment or use the text chat option for now.";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            connections: ConnectionsConfig {
                max_connections: 10,
                connection_timeout: 300,
                sweep_interval_seconds: 30,
                terminal_grace_seconds: 5,
                ice_failure_threshold: 3,
                heartbeat_interval_seconds: 10,
                heartbeat_timeout_seconds: 30,
                event_channel_capacity: 256,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                channels: 1,
                frame_duration_ms: 20,
                buffer_capacity_bytes: 1024 * 1024,
                frame_poll_interval_ms: 1,
                buffer_warn_percent: 80.0,
                inbound_channel_capacity: 256,
            },
            playback: PlaybackConfig {
                sample_rate: 24000,
                frame_duration_ms: 20,
                playback_queue_capacity: 100,
                recv_timeout_ms: 1000,
            },
            resilience: ResilienceConfig {
                max_retries: 3,
                retry_delay_seconds: 1.0,
                circuit_failure_threshold: 5,
                circuit_recovery_timeout_seconds: 60,
                fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
                fallback_audio_path: String::new(),
            },
            pipeline: PipelineConfig {
                mode: "echo".to_string(),
                output_channel_capacity: 64,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_CONNECTIONS__MAX_CONNECTIONS=50`
    /// - `APP_RESILIENCE__RETRY_DELAY_SECONDS=0.5`
    /// - `PORT=3000` (platform convention)
    ///
    /// Field names contain underscores, so sections are separated by a double underscore.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values that would make the transport misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        let c = &self.connections;
        if c.max_connections == 0 {
            return Err(anyhow!("max_connections must be greater than 0"));
        }
        if c.connection_timeout == 0 {
            return Err(anyhow!("connection_timeout must be greater than 0"));
        }
        if c.sweep_interval_seconds == 0 {
            return Err(anyhow!("sweep_interval_seconds must be greater than 0"));
        }
        if c.ice_failure_threshold == 0 {
            return Err(anyhow!("ice_failure_threshold must be greater than 0"));
        }
        if c.heartbeat_interval_seconds == 0 || c.heartbeat_timeout_seconds == 0 {
            return Err(anyhow!("heartbeat settings must be greater than 0"));
        }
        if c.event_channel_capacity == 0 {
            return Err(anyhow!("event_channel_capacity must be greater than 0"));
        }

        let a = &self.audio;
        if a.sample_rate == 0 || a.channels == 0 || a.frame_duration_ms == 0 {
            return Err(anyhow!("audio sample_rate, channels and frame_duration_ms must be greater than 0"));
        }
        if a.buffer_capacity_bytes < a.frame_size_bytes() {
            return Err(anyhow!(
                "buffer_capacity_bytes ({}) must hold at least one frame ({} bytes)",
                a.buffer_capacity_bytes,
                a.frame_size_bytes()
            ));
        }
        if !(0.0..=100.0).contains(&a.buffer_warn_percent) {
            return Err(anyhow!("buffer_warn_percent must be between 0 and 100"));
        }
        if a.inbound_channel_capacity == 0 {
            return Err(anyhow!("inbound_channel_capacity must be greater than 0"));
        }

        let p = &self.playback;
        if p.sample_rate == 0 || p.frame_duration_ms == 0 {
            return Err(anyhow!("playback sample_rate and frame_duration_ms must be greater than 0"));
        }
        if p.playback_queue_capacity == 0 {
            return Err(anyhow!("playback_queue_capacity must be greater than 0"));
        }
        if p.recv_timeout_ms == 0 {
            return Err(anyhow!("playback recv_timeout_ms must be greater than 0"));
        }

        let r = &self.resilience;
        if !r.retry_delay_seconds.is_finite() || r.retry_delay_seconds < 0.0 {
            return Err(anyhow!("retry_delay_seconds must be a non-negative number"));
        }
        if r.circuit_failure_threshold == 0 {
            return Err(anyhow!("circuit_failure_threshold must be greater than 0"));
        }
        if r.fallback_message.trim().is_empty() {
            return Err(anyhow!("fallback_message cannot be empty"));
        }

        if self.pipeline.mode != "echo" {
            return Err(anyhow!("Unknown pipeline mode '{}'", self.pipeline.mode));
        }
        if self.pipeline.output_channel_capacity == 0 {
            return Err(anyhow!("output_channel_capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON document on top of the current configuration.
    ///
    /// Only the keys present in `json_str` change, e.g. `{"connections": {"max_connections": 20}}`.
    /// The merged result is validated before it replaces `self`.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, patch);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Recursively overwrite `target` with the keys of `patch`.
fn merge_json(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

impl AudioConfig {
    /// Bytes in one inbound frame: samples per frame * channels * 2 (16-bit PCM).
    ///
    /// 16 kHz, mono, 20 ms → 320 samples → 640 bytes.
    pub fn frame_size_bytes(&self) -> usize {
        let samples = self.sample_rate as usize * self.frame_duration_ms as usize / 1000;
        samples * self.channels as usize * 2
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.frame_poll_interval_ms)
    }
}

impl PlaybackConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

impl ResilienceConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_seconds)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_recovery_timeout_seconds)
    }
}

impl ConnectionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn terminal_grace(&self) -> Duration {
        Duration::from_secs(self.terminal_grace_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.connections.max_connections, 10);
        assert_eq!(config.connections.connection_timeout, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_size_for_16khz_mono_20ms() {
        let config = AppConfig::default();
        assert_eq!(config.audio.frame_size_bytes(), 640);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.connections.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.buffer_capacity_bytes = 100;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.mode = "gemini".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update_merges_partial_document() {
        let mut config = AppConfig::default();
        let json = r#"{"connections": {"max_connections": 25}, "playback": {"playback_queue_capacity": 8}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.connections.max_connections, 25);
        assert_eq!(config.playback.playback_queue_capacity, 8);
        // untouched siblings survive the merge
        assert_eq!(config.connections.connection_timeout, 300);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        let json = r#"{"resilience": {"circuit_failure_threshold": 0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.resilience.circuit_failure_threshold, 5);
    }
}
