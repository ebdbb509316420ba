//! Bundled story agents backed by an HTTP text generator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use regex::Regex;
use reqwest::{Client, Url};
use saga_core::settings::GeneratorSettings;
use saga_core::{
    AgentError, AgentKind, AgentRequest, Capability, ChunkStream, Message, MessageStatus, Role,
};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::classify;

/// One history entry as the generator sees it.
#[derive(Clone, Debug, Serialize)]
pub struct PromptTurn {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub text: String,
    pub status: MessageStatus,
}

impl From<&Message> for PromptTurn {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role,
            agent_name: m.agent_name.clone(),
            text: m.content.as_text(),
            status: m.status,
        }
    }
}

/// Request body sent to the generator.
#[derive(Clone, Debug, Serialize)]
pub struct GenerationPrompt {
    pub agent: String,
    pub kind: AgentKind,
    pub request: String,
    pub history: Vec<PromptTurn>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Produces streamed text for a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: GenerationPrompt) -> Result<ChunkStream, AgentError>;
}

/// Agent that accepts requests matching its kind's keywords and delegates
/// generation.
pub struct KeywordAgent {
    name: String,
    kind: AgentKind,
    pattern: Option<&'static Regex>,
    generator: Arc<dyn Generator>,
}

impl KeywordAgent {
    pub fn new(name: impl Into<String>, kind: AgentKind, generator: Arc<dyn Generator>) -> Self {
        Self {
            name: name.into(),
            kind,
            pattern: classify::kind_pattern(kind),
            generator,
        }
    }
}

#[async_trait]
impl Capability for KeywordAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn accepts(&self, request: &AgentRequest) -> bool {
        self.pattern.is_some_and(|re| re.is_match(&request.raw_text))
    }

    async fn stream(
        &self,
        request: &AgentRequest,
        history: &[Message],
    ) -> Result<ChunkStream, AgentError> {
        let prompt = GenerationPrompt {
            agent: self.name.clone(),
            kind: self.kind,
            request: request.raw_text.clone(),
            history: history.iter().map(PromptTurn::from).collect(),
            metadata: request.metadata.clone(),
        };
        self.generator.generate(prompt).await
    }
}

/// POSTs the prompt as JSON and streams the response body back as chunks.
pub struct HttpGenerator {
    client: Client,
    url: Option<Url>,
    /// Longest wait for a connection or for the next piece of the body.
    idle_timeout: Duration,
}

impl HttpGenerator {
    /// `timeout` bounds connecting and each read, not the whole streamed
    /// body; the router's hard cap limits total generation time.
    pub fn new(url: Option<&str>, timeout: Duration) -> Result<Self, AgentError> {
        let url = url
            .filter(|u| !u.is_empty())
            .map(|u| {
                Url::parse(u).map_err(|e| AgentError::Unavailable(format!("invalid generator url {u}: {e}")))
            })
            .transpose()?;
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| AgentError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url,
            idle_timeout: timeout,
        })
    }

    pub fn from_settings(settings: &GeneratorSettings) -> Result<Self, AgentError> {
        Self::new(
            settings.url.as_deref(),
            Duration::from_millis(settings.timeout_ms),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    #[instrument(skip_all, fields(agent = %prompt.agent))]
    async fn generate(&self, prompt: GenerationPrompt) -> Result<ChunkStream, AgentError> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| AgentError::Unavailable("no generator url configured".into()))?;
        let response = self
            .client
            .post(url)
            .json(&prompt)
            .send()
            .await
            .map_err(|e| AgentError::Unavailable(format!("generator request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "generator rejected prompt");
            return Err(AgentError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let idle_timeout = self.idle_timeout;
        // `None` marks the end of the body so a dangling partial character
        // is still emitted.
        let chunks = response
            .bytes_stream()
            .map(Some)
            .chain(stream::once(future::ready(None)))
            .scan(Vec::<u8>::new(), move |pending, item| {
                let out = match item {
                    Some(Ok(bytes)) => {
                        pending.extend_from_slice(&bytes);
                        Ok(take_utf8(pending))
                    }
                    Some(Err(e)) if e.is_timeout() => Err(AgentError::Timeout(idle_timeout)),
                    Some(Err(e)) => Err(AgentError::Failed(format!("generator stream: {e}"))),
                    None => Ok(flush_utf8(pending)),
                };
                future::ready(Some(out))
            })
            .filter(|item| future::ready(!matches!(item, Ok(text) if text.is_empty())));
        Ok(Box::pin(chunks))
    }
}

/// Drain the longest valid UTF-8 prefix, keeping a trailing incomplete
/// sequence for the next read. Invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

/// Whatever is left at end of stream, with an incomplete trailing
/// sequence replaced.
fn flush_utf8(pending: &mut Vec<u8>) -> String {
    String::from_utf8_lossy(&std::mem::take(pending)).into_owned()
}

/// The standard story agents, one per kind, sharing one generator.
pub fn default_agents(generator: Arc<dyn Generator>) -> Vec<Arc<dyn Capability>> {
    [
        AgentKind::Plot,
        AgentKind::Author,
        AgentKind::World,
        AgentKind::Characters,
        AgentKind::Enhancement,
    ]
    .into_iter()
    .map(|kind| {
        Arc::new(KeywordAgent::new(kind.as_str(), kind, Arc::clone(&generator))) as Arc<dyn Capability>
    })
    .collect()
}
