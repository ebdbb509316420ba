use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// Storage backend a session lives in. Fixed for the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreMode {
    /// Process memory only; lost on restart.
    Ephemeral,
    /// SQLite behind the connection pool; survives restart.
    PersistentPooled,
    /// Delegated to an external managed session service.
    ManagedRemote,
}

impl StoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::PersistentPooled => "persistent-pooled",
            Self::ManagedRemote => "managed-remote",
        }
    }
}

impl std::fmt::Display for StoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StoreMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ephemeral" | "memory" => Ok(Self::Ephemeral),
            "persistent-pooled" | "persistent" | "sqlite" => Ok(Self::PersistentPooled),
            "managed-remote" | "managed" | "remote" => Ok(Self::ManagedRemote),
            other => Err(format!("unknown store mode: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Whether an agent finished its output or was cut short.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Complete,
    Partial,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(Self::Complete),
            "partial" => Ok(Self::Partial),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// Message body. Domain objects stay opaque: structured payloads are carried
/// as raw JSON and never interpreted by the session layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },
    Structured { value: serde_json::Value },
}

impl Content {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text { text: s.into() }
    }

    /// Flatten to text for prompts and logs.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Structured { value } => value.to_string(),
        }
    }
}

/// A message that has not been appended yet. Sequence numbers and
/// timestamps are assigned by the store at append time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub content: Content,
    #[serde(default)]
    pub status: MessageStatus,
}

impl NewMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            agent_name: None,
            content: Content::text(text),
            status: MessageStatus::Complete,
        }
    }

    pub fn agent(name: impl Into<String>, text: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            role: Role::Agent,
            agent_name: Some(name.into()),
            content: Content::text(text),
            status,
        }
    }

    /// Stamp with a sequence number. Only stores should call this.
    pub fn into_message(self, sequence: u64, timestamp: DateTime<Utc>) -> Message {
        Message {
            role: self.role,
            agent_name: self.agent_name,
            content: self.content,
            status: self.status,
            sequence,
            timestamp,
        }
    }
}

/// An appended, immutable history entry. Ordering is `sequence`, never
/// `timestamp`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub content: Content,
    #[serde(default)]
    pub status: MessageStatus,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub mode: StoreMode,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Number of appended messages, equal to the last sequence number.
    pub message_count: u64,
}
