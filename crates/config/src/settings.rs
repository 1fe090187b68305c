//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use speech_gateway_synth::ReplicaConfig;

use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Session limits and timeouts
    #[serde(default)]
    pub session: SessionConfig,

    /// Streaming queue and timeout tuning
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Replica pool and voices
    #[serde(default)]
    pub synthesis: SynthesisConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions == 0 {
            return Err(ConfigError::invalid("session.max_sessions", "must be at least 1"));
        }
        if self.session.idle_timeout_secs == 0 {
            return Err(ConfigError::invalid("session.idle_timeout_secs", "must be at least 1"));
        }
        if self.streaming.outbound_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "streaming.outbound_queue_capacity",
                "must be at least 1",
            ));
        }
        if self.streaming.send_timeout_ms == 0 {
            return Err(ConfigError::invalid("streaming.send_timeout_ms", "must be at least 1"));
        }
        if self.synthesis.replicas.is_empty() {
            return Err(ConfigError::invalid("synthesis.replicas", "at least one replica required"));
        }
        for replica in &self.synthesis.replicas {
            if replica.capacity == 0 {
                return Err(ConfigError::invalid(
                    "synthesis.replicas",
                    format!("replica {} has zero capacity", replica.device_id),
                ));
            }
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket path for the synthesis endpoint
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_ws_path() -> String {
    "/ws/v1/tts".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            cors_enabled: default_true(),
        }
    }
}

/// Authentication configuration
///
/// When `token` is unset the gateway accepts unauthenticated connections,
/// matching the optional-token deployment mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Expected value of the X-NLS-Token header
    #[serde(default)]
    pub token: Option<String>,

    /// Expected appkey carried in StartSynthesis headers
    #[serde(default)]
    pub appkey: Option<String>,
}

/// Session registry limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Global concurrent-session ceiling
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Idle eviction timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Idle sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_sessions() -> usize {
    256
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Streaming coordinator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Bounded outbound frame queue per session, in frames
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue_capacity: usize,

    /// Abort a job when the client send path stalls this long
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

fn default_outbound_queue() -> usize {
    32
}
fn default_send_timeout() -> u64 {
    10_000
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: default_outbound_queue(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

/// Replica pool and voice catalog seeds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// One replica per compute device
    #[serde(default = "default_replicas")]
    pub replicas: Vec<ReplicaConfig>,

    /// Consecutive job failures before a replica is marked unhealthy
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,

    /// Preset voice identifiers
    #[serde(default = "default_preset_voices")]
    pub preset_voices: Vec<String>,
}

fn default_replicas() -> Vec<ReplicaConfig> {
    vec![ReplicaConfig {
        device_id: "cpu".to_string(),
        capacity: 2,
    }]
}
fn default_fail_threshold() -> u32 {
    3
}
fn default_preset_voices() -> Vec<String> {
    vec![
        "default".to_string(),
        "zh-female".to_string(),
        "zh-male".to_string(),
        "en-female".to_string(),
        "en-male".to_string(),
    ]
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            fail_threshold: default_fail_threshold(),
            preset_voices: default_preset_voices(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (SPEECH_GATEWAY__ prefix)
/// 2. config/{env}.yaml (if env specified)
/// 3. config/default.yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("SPEECH_GATEWAY")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}
