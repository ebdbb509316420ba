use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{RequestId, SessionId};

/// One inbound request. Transient: only the messages it produces are stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub raw_text: String,
    /// Explicit override; honored only if the named agent is registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_agent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentRequest {
    pub fn new(session_id: SessionId, raw_text: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            session_id,
            raw_text: raw_text.into(),
            requested_agent: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.request_id = id;
        self
    }

    pub fn with_agent(mut self, name: impl Into<String>) -> Self {
        self.requested_agent = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Read a boolean metadata flag (`true`/`false`, `1`/`0`, `yes`/`no`).
    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.metadata.get(key)?.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        }
    }
}
