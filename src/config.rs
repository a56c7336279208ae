use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::codec::EncodingMode;
use crate::error::RelayError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
    pub codec: CodecConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    pub client_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Wildcard topic devices publish requests on
    pub request_topic: String,
    /// Per-device reply topic, `{device_id}` is substituted
    pub response_topic: String,
    pub health_topic: String,
    pub publish_retries: u32,
    pub publish_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// `openai` or `echo`
    pub provider: String,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub voice: String,
    pub instructions: String,
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub max_concurrent_sessions: usize,
    pub session_timeout_seconds: u64,
    pub sweep_interval_ms: u64,
    pub idle_grace_ms: u64,
    pub close_grace_ms: u64,
    pub enable_health_checks: bool,
    pub health_check_interval_secs: u64,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    pub encoding: EncodingMode,
    pub max_payload_bytes: usize,
    pub target_chunk_bytes: usize,
}

impl Config {
    /// Load defaults, then `path` (any extension `config` understands, optional),
    /// then `VOICE_RELAY_*` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        Self::load_with_overrides(path, &[])
    }

    /// Like [`load`](Self::load), with `(key, value)` pairs applied last
    /// (command-line flags).
    pub fn load_with_overrides(path: &str, overrides: &[(&str, String)]) -> Result<Self> {
        let mut builder = Self::defaults(config::Config::builder())?
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("VOICE_RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        for (key, value) in overrides {
            builder = builder.set_override(*key, value.as_str())?;
        }
        let settings = builder.build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Built-in defaults only, without file or environment sources
    pub fn from_defaults() -> Result<Self> {
        let settings = Self::defaults(config::Config::builder())?.build()?;
        Ok(settings.try_deserialize()?)
    }

    fn defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(builder
            .set_default("broker.url", "nats://localhost:4222")?
            .set_default("broker.client_name", "voice-relay")?
            .set_default("broker.request_topic", "iot/+/audio_request")?
            .set_default("broker.response_topic", "iot/{device_id}/audio_response")?
            .set_default("broker.health_topic", "iot/server/health")?
            .set_default("broker.publish_retries", 3)?
            .set_default("broker.publish_backoff_ms", 100)?
            .set_default("upstream.provider", "openai")?
            .set_default("upstream.model", "gpt-4o-realtime-preview")?
            .set_default("upstream.base_url", "wss://api.openai.com/v1/realtime")?
            .set_default("upstream.voice", "alloy")?
            .set_default(
                "upstream.instructions",
                "You are a helpful AI assistant responding to voice commands from IoT devices.",
            )?
            .set_default("upstream.handshake_timeout_ms", 10_000)?
            .set_default("server.max_concurrent_sessions", 50)?
            .set_default("server.session_timeout_seconds", 300)?
            .set_default("server.sweep_interval_ms", 5_000)?
            .set_default("server.idle_grace_ms", 2_000)?
            .set_default("server.close_grace_ms", 3_000)?
            .set_default("server.enable_health_checks", true)?
            .set_default("server.health_check_interval_secs", 30)?
            .set_default("server.http.enabled", true)?
            .set_default("server.http.bind", "0.0.0.0")?
            .set_default("server.http.port", 8080)?
            .set_default("codec.encoding", "base64")?
            .set_default("codec.max_payload_bytes", 1_048_576)?
            .set_default("codec.target_chunk_bytes", 8_192)?)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.server.max_concurrent_sessions == 0 {
            return Err(RelayError::Config(
                "server.max_concurrent_sessions must be at least 1".into(),
            ));
        }
        if self.codec.target_chunk_bytes == 0 {
            return Err(RelayError::Config(
                "codec.target_chunk_bytes must be at least 1".into(),
            ));
        }
        if !self.broker.response_topic.contains("{device_id}") {
            return Err(RelayError::Config(format!(
                "broker.response_topic '{}' has no {{device_id}} placeholder",
                self.broker.response_topic
            )));
        }
        if self.upstream.provider == "openai"
            && self.upstream.api_key.as_deref().map_or(true, str::is_empty)
        {
            return Err(RelayError::Config(
                "upstream.api_key is required for the openai provider".into(),
            ));
        }
        Ok(())
    }

    /// Copy with secrets masked, for logging.
    pub fn redacted(&self) -> Self {
        let mut cfg = self.clone();
        let mask = |s: &mut Option<String>| {
            if s.is_some() {
                *s = Some("***".to_string());
            }
        };
        mask(&mut cfg.broker.password);
        mask(&mut cfg.upstream.api_key);
        cfg
    }
}

impl ServerConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

impl UpstreamConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
