//! Wire protocol for the streaming synthesis gateway
//!
//! The control plane is JSON frames with a `header` (routing + status) and an
//! optional `payload`; the data plane is raw binary audio with no envelope.
//! This crate is pure data: parsing, validation, and frame construction live
//! here, transport and session logic do not.

pub mod frame;
pub mod params;
pub mod status;
pub mod text;

pub use frame::{
    generate_message_id, ClientMessage, Header, ServerFrame, ServerPayload, Subtitle,
    NAMESPACE_DEFAULT, NAMESPACE_SYNTHESIS,
};
pub use params::{AudioFormat, StartParams, MAX_TEXT_LEN, SUPPORTED_SAMPLE_RATES};

use thiserror::Error;

/// Errors produced while parsing or validating protocol frames
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    NotJson(String),

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("invalid message name: {0}")]
    InvalidName(String),

    #[error("invalid parameter {field}: {message}")]
    InvalidParameter { field: String, message: String },

    #[error("missing payload for {0}")]
    MissingPayload(String),
}

impl ProtocolError {
    pub fn invalid_parameter(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
