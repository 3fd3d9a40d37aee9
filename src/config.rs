//! # Configuration Management
//!
//! Loads the relay configuration from layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix (`APP_RELAY__MAX_ATTEMPTS=3`)
//! - Deployment overrides: `HOST`, `PORT` and `GEMINI_API_KEY`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment overrides
//! 2. `APP_` environment variables
//! 3. `config.toml`
//! 4. Defaults

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Size of one upload window sent to the generation API.
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 16_000;

/// Initial attempt plus five retries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Fixed pause between rate-limited attempts.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 6_000;

/// Largest WebSocket frame, i.e. the largest single utterance, the relay accepts.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Capture emission period on the client.
pub const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 250;

/// Main application configuration.
///
/// ## Why separate config structs:
/// Each section maps to one concern (listener, upstream API, relay tuning, limits,
/// headless client) so environment overrides stay readable, e.g. `APP_SERVER__PORT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub generation: GenerationConfig,
    pub relay: RelayConfig,
    pub performance: PerformanceConfig,
    pub client: ClientConfig,
}

/// Listener settings.
///
/// - `host = "127.0.0.1"`: only local clients (development)
/// - `host = "0.0.0.0"`: every interface (deployment)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream generation API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// API root, without the `/v1beta/...` path
    pub base_url: String,
    /// Model id placed in the request path
    pub model: String,
    /// Declared mime type of the uploaded audio windows
    pub mime_type: String,
    /// Credential sent as `x-goog-api-key`; empty means "not configured"
    pub api_key: String,
    pub request_timeout_secs: u64,
}

/// Chunking, retry and connection liveness settings for each relay session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub chunk_size_bytes: usize,
    /// Frame size limit for incoming audio; larger frames close the connection
    pub max_payload_bytes: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

/// Settings for the headless `client` subcommand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket URL of the relay
    pub relay_url: String,
    pub capture_interval_ms: u64,
    /// Bytes the file-backed recorder hands over per capture tick
    pub segment_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            generation: GenerationConfig {
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                model: "gemini-2.5-flash".to_string(),
                mime_type: "audio/webm".to_string(),
                api_key: String::new(),
                request_timeout_secs: 60,
            },
            relay: RelayConfig {
                chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 90,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 64,
            },
            client: ClientConfig {
                relay_url: "ws://127.0.0.1:3000/ws".to_string(),
                capture_interval_ms: DEFAULT_CAPTURE_INTERVAL_MS,
                // 128 kbit/s opus for 250 ms
                segment_bytes: 4_000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`
    /// - `APP_RELAY__RETRY_DELAY_MS=2000`
    /// - `PORT=8080` and `GEMINI_API_KEY=...` for hosted deployments
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("generation.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values that would make the relay or client misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.relay.chunk_size_bytes == 0 {
            return Err(anyhow::anyhow!("Chunk size must be greater than 0"));
        }

        if self.relay.max_payload_bytes < self.relay.chunk_size_bytes {
            return Err(anyhow::anyhow!(
                "Max payload size must be at least one chunk ({} bytes)",
                self.relay.chunk_size_bytes
            ));
        }

        if self.relay.max_attempts == 0 {
            return Err(anyhow::anyhow!("Max attempts must be at least 1"));
        }

        if self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.client.capture_interval_ms == 0 {
            return Err(anyhow::anyhow!("Capture interval must be greater than 0"));
        }

        if self.client.segment_bytes == 0 {
            return Err(anyhow::anyhow!("Segment size must be greater than 0"));
        }

        Ok(())
    }

    /// Whether an API key was provided by any source.
    pub fn has_api_key(&self) -> bool {
        !self.generation.api_key.trim().is_empty()
    }

    /// Apply a partial JSON update, e.g. `{"relay": {"max_attempts": 3}}`.
    ///
    /// Only known fields are read; anything else in the document is ignored.
    /// The updated configuration is validated before this returns.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Port {} is out of range", port))?;
            }
        }

        if let Some(generation) = partial.get("generation") {
            if let Some(model) = generation.get("model").and_then(|v| v.as_str()) {
                self.generation.model = model.to_string();
            }
            if let Some(mime) = generation.get("mime_type").and_then(|v| v.as_str()) {
                self.generation.mime_type = mime.to_string();
            }
        }

        if let Some(relay) = partial.get("relay") {
            if let Some(size) = relay.get("chunk_size_bytes").and_then(|v| v.as_u64()) {
                self.relay.chunk_size_bytes = usize::try_from(size)
                    .map_err(|_| anyhow::anyhow!("Chunk size {} is out of range", size))?;
            }
            if let Some(size) = relay.get("max_payload_bytes").and_then(|v| v.as_u64()) {
                self.relay.max_payload_bytes = usize::try_from(size)
                    .map_err(|_| anyhow::anyhow!("Max payload size {} is out of range", size))?;
            }
            if let Some(attempts) = relay.get("max_attempts").and_then(|v| v.as_u64()) {
                self.relay.max_attempts = u32::try_from(attempts)
                    .map_err(|_| anyhow::anyhow!("Max attempts {} is out of range", attempts))?;
            }
            if let Some(delay) = relay.get("retry_delay_ms").and_then(|v| v.as_u64()) {
                self.relay.retry_delay_ms = delay;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = usize::try_from(sessions).map_err(|_| {
                    anyhow::anyhow!("Max concurrent sessions {} is out of range", sessions)
                })?;
            }
        }

        self.validate()?;
        Ok(())
    }
}

impl ClientConfig {
    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Defaults carry the relay constants and pass validation.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.relay.chunk_size_bytes, 16_000);
        assert_eq!(config.relay.max_attempts, 6);
        assert_eq!(config.relay.retry_delay_ms, 6_000);
        assert_eq!(config.relay.max_payload_bytes, 16 * 1024 * 1024);
        assert_eq!(config.client.capture_interval(), Duration::from_millis(250));
        assert!(!config.has_api_key());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.chunk_size_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.max_payload_bytes = config.relay.chunk_size_bytes - 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.client_timeout_secs = config.relay.heartbeat_interval_secs;
        assert!(config.validate().is_err());
    }

    /// Partial updates touch only the named fields.
    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"relay": {"max_attempts": 3, "retry_delay_ms": 100}, "server": {"port": 9090}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.relay.max_attempts, 3);
        assert_eq!(config.relay.retry_delay_ms, 100);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.relay.chunk_size_bytes, 16_000);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert!(config.update_from_json(r#"{"relay": {"chunk_size_bytes": 0}}"#).is_err());
        assert!(config.update_from_json("not json").is_err());
    }

    /// Values wider than the target field are refused instead of wrapping around.
    #[test]
    fn test_config_update_rejects_overflowing_integers() {
        let mut config = AppConfig::default();
        let err = config
            .update_from_json(r#"{"relay": {"max_attempts": 4294967297}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert_eq!(config.relay.max_attempts, 6);

        assert!(config
            .update_from_json(r#"{"relay": {"max_attempts": 4294967295}}"#)
            .is_ok());
        assert_eq!(config.relay.max_attempts, u32::MAX);
    }
}
