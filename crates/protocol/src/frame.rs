//! Control frame parsing and construction

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::params::StartParams;
use crate::status;
use crate::ProtocolError;

pub const NAMESPACE_SYNTHESIS: &str = "FlowingSpeechSynthesizer";
pub const NAMESPACE_DEFAULT: &str = "Default";

/// 32 hex characters, the vendor's message id shape
pub fn generate_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Frame header shared by every control message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub message_id: String,
    pub task_id: String,
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl Header {
    fn server(task_id: &str, name: &str, status: u32) -> Self {
        Self {
            message_id: generate_message_id(),
            task_id: task_id.to_string(),
            namespace: NAMESPACE_SYNTHESIS.to_string(),
            name: name.to_string(),
            appkey: None,
            status: Some(status),
            status_text: None,
            status_message: Some(status::SUCCESS_MESSAGE.to_string()),
        }
    }
}

/// Raw envelope used only during parsing; clients are free to omit fields
/// the gateway tolerates missing.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    header: RawHeader,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    appkey: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunPayload {
    #[serde(default)]
    text: String,
}

/// A control message from the client, already validated against namespace
/// and name. Payload range validation stays with the caller.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Start {
        task_id: String,
        message_id: String,
        appkey: Option<String>,
        params: StartParams,
    },
    Run {
        task_id: String,
        message_id: String,
        text: String,
    },
    Stop {
        task_id: String,
        message_id: String,
    },
}

impl ClientMessage {
    /// Parse one text frame into a client message.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let envelope: RawEnvelope =
            serde_json::from_str(raw).map_err(|e| ProtocolError::NotJson(e.to_string()))?;

        let header = envelope.header;
        if header.namespace != NAMESPACE_SYNTHESIS {
            return Err(ProtocolError::InvalidNamespace(header.namespace));
        }

        match header.name.as_str() {
            "StartSynthesis" => {
                let payload = envelope
                    .payload
                    .ok_or_else(|| ProtocolError::MissingPayload("StartSynthesis".to_string()))?;
                let params: StartParams = serde_json::from_value(payload)
                    .map_err(|e| ProtocolError::invalid_parameter("payload", e.to_string()))?;
                Ok(Self::Start {
                    task_id: header.task_id,
                    message_id: header.message_id,
                    appkey: header.appkey,
                    params,
                })
            }
            "RunSynthesis" => {
                let payload: RunPayload = envelope
                    .payload
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| ProtocolError::invalid_parameter("payload", e.to_string()))?
                    .unwrap_or(RunPayload { text: String::new() });
                Ok(Self::Run {
                    task_id: header.task_id,
                    message_id: header.message_id,
                    text: payload.text,
                })
            }
            "StopSynthesis" => Ok(Self::Stop {
                task_id: header.task_id,
                message_id: header.message_id,
            }),
            other => Err(ProtocolError::InvalidName(other.to_string())),
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::Start { task_id, .. } | Self::Run { task_id, .. } | Self::Stop { task_id, .. } => {
                task_id
            }
        }
    }
}

/// Subtitle entry carried by `SentenceSynthesis` / `SentenceEnd`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtitle {
    pub text: String,
    pub begin_time: u64,
    pub end_time: u64,
    pub begin_index: usize,
    pub end_index: usize,
    pub sentence: bool,
    pub phoneme_list: Vec<Value>,
}

impl Subtitle {
    /// Best-effort estimate: no aligner on this path, 200 ms per character.
    pub fn estimate(text: &str) -> Self {
        let chars = text.chars().count();
        Self {
            text: text.to_string(),
            begin_time: 0,
            end_time: chars as u64 * 200,
            begin_index: 0,
            end_index: chars,
            sentence: true,
            phoneme_list: Vec::new(),
        }
    }
}

/// Payload of a server-side control frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitles: Option<Vec<Subtitle>>,
}

impl ServerPayload {
    fn session(session_id: &str, index: u64) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            index: Some(index),
            subtitles: None,
        }
    }

    fn subtitles(subtitles: Vec<Subtitle>) -> Self {
        Self {
            session_id: None,
            index: None,
            subtitles: Some(subtitles),
        }
    }
}

/// A server-to-client control frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    pub header: Header,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<ServerPayload>,
}

impl ServerFrame {
    pub fn synthesis_started(task_id: &str, session_id: &str) -> Self {
        Self {
            header: Header::server(task_id, "SynthesisStarted", status::SUCCESS),
            payload: Some(ServerPayload::session(session_id, 1)),
        }
    }

    pub fn sentence_begin(task_id: &str, session_id: &str) -> Self {
        Self {
            header: Header::server(task_id, "SentenceBegin", status::SUCCESS),
            payload: Some(ServerPayload::session(session_id, 1)),
        }
    }

    pub fn sentence_synthesis(task_id: &str, subtitles: Vec<Subtitle>) -> Self {
        Self {
            header: Header::server(task_id, "SentenceSynthesis", status::SUCCESS),
            payload: Some(ServerPayload::subtitles(subtitles)),
        }
    }

    pub fn sentence_end(task_id: &str, subtitles: Vec<Subtitle>) -> Self {
        Self {
            header: Header::server(task_id, "SentenceEnd", status::SUCCESS),
            payload: Some(ServerPayload::subtitles(subtitles)),
        }
    }

    pub fn synthesis_completed(task_id: &str, session_id: &str) -> Self {
        Self {
            header: Header::server(task_id, "SynthesisCompleted", status::SUCCESS),
            payload: Some(ServerPayload::session(session_id, 1)),
        }
    }

    /// `TaskFailed` uses the default namespace and carries the reason in
    /// `status_text`, matching the vendor protocol.
    pub fn task_failed(task_id: &str, status: u32, reason: &str) -> Self {
        Self {
            header: Header {
                message_id: generate_message_id(),
                task_id: task_id.to_string(),
                namespace: NAMESPACE_DEFAULT.to_string(),
                name: "TaskFailed".to_string(),
                appkey: None,
                status: Some(status),
                status_text: Some(reason.to_string()),
                status_message: None,
            },
            payload: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
