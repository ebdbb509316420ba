use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Partial,
    Complete,
    Error,
}

/// Outbound frame delivered to the calling connection. For one request the
/// stream is `partial*` (with inline agent `error` markers) followed by
/// exactly one `complete` or one terminal `error` without an agent name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl OutboundFrame {
    pub fn partial(agent_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Partial,
            agent_name: Some(agent_name.into()),
            content: content.into(),
            request_id: None,
            error_kind: None,
            retryable: None,
            warning: None,
        }
    }

    /// Inline failure marker inside one agent's segment. Not terminal.
    pub fn agent_error(agent_name: impl Into<String>, kind: &str, message: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Error,
            agent_name: Some(agent_name.into()),
            content: message.into(),
            request_id: None,
            error_kind: Some(kind.to_string()),
            retryable: Some(false),
            warning: None,
        }
    }

    pub fn complete(warning: Option<String>) -> Self {
        Self {
            frame_type: FrameType::Complete,
            agent_name: None,
            content: String::new(),
            request_id: None,
            error_kind: None,
            retryable: None,
            warning,
        }
    }

    /// Terminal failure for the whole request.
    pub fn failure(kind: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            frame_type: FrameType::Error,
            agent_name: None,
            content: message.into(),
            request_id: None,
            error_kind: Some(kind.to_string()),
            retryable: Some(retryable),
            warning: None,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        match self.frame_type {
            FrameType::Complete => true,
            FrameType::Error => self.agent_name.is_none(),
            FrameType::Partial => false,
        }
    }
}
