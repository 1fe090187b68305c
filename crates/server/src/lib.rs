//! Streaming Synthesis Gateway Server
//!
//! Hosts the bidirectional WebSocket endpoint: JSON control frames in and
//! out, raw binary audio out. Each connection owns one session state
//! machine; synthesis jobs stream through a bounded queue so control
//! handling never waits on audio production.

pub mod connection;
pub mod http;
pub mod registry;
pub mod session;
pub mod state;
pub mod streaming;

pub use connection::{ws_handler, Connection, Flow};
pub use http::create_router;
pub use registry::{RegistryError, SessionHandle, SessionRegistry};
pub use session::{InvalidTransition, SessionEvent, SessionState};
pub use state::AppState;
pub use streaming::{spawn_job, JobContext, JobOutcome, OutboundFrame};

use speech_gateway_protocol::{status, ProtocolError};
use speech_gateway_synth::{RouterBusy, SynthesisError};
use thiserror::Error;

/// Everything that can fail while driving a session
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Busy(#[from] RouterBusy),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol violation: {0}")]
    Violation(String),
}

impl ServerError {
    /// Wire status code reported in the `TaskFailed` frame for this error.
    pub fn status_code(&self) -> u32 {
        match self {
            Self::Protocol(ProtocolError::InvalidParameter { .. })
            | Self::Protocol(ProtocolError::MissingPayload(_)) => status::INVALID_PARAMETER,
            Self::Protocol(_) => status::TASK_FAILED,
            Self::Registry(RegistryError::Full { .. }) => status::QUOTA_EXCEEDED,
            Self::Registry(RegistryError::DuplicateTaskId(_)) => status::TASK_FAILED,
            Self::Busy(_) => status::SERVICE_UNAVAILABLE,
            Self::Synthesis(SynthesisError::DeviceUnavailable(_)) => status::SERVICE_UNAVAILABLE,
            Self::Synthesis(SynthesisError::UnknownVoice(_)) => status::INVALID_PARAMETER,
            Self::Synthesis(SynthesisError::Job(_)) => status::TASK_FAILED,
            Self::Auth(_) => status::AUTHENTICATION_FAILED,
            Self::Violation(_) => status::TASK_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let err = ServerError::Protocol(ProtocolError::invalid_parameter("volume", "too loud"));
        assert_eq!(err.status_code(), status::INVALID_PARAMETER);

        let err = ServerError::Busy(RouterBusy);
        assert_eq!(err.status_code(), status::SERVICE_UNAVAILABLE);

        let err = ServerError::Registry(RegistryError::Full { limit: 1 });
        assert_eq!(err.status_code(), status::QUOTA_EXCEEDED);

        let err = ServerError::Auth("bad token".into());
        assert_eq!(err.status_code(), status::AUTHENTICATION_FAILED);
    }
}
