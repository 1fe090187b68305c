//! Gateway configuration
//!
//! Layered loading: `config/default` file, then an optional
//! environment-specific file, then `SPEECH_GATEWAY__`-prefixed environment
//! variables. Every field has a serde default so an empty deployment
//! starts with sane values.

mod settings;

pub use settings::{
    load_settings, AuthConfig, ObservabilityConfig, ServerConfig, SessionConfig, Settings,
    StreamingConfig, SynthesisConfig,
};

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
