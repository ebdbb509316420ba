//! Client for an external managed session service.
//!
//! Wire protocol (JSON):
//! - `PUT    /sessions/{id}` → [`wire::RemoteSession`] (created or existing)
//! - `POST   /sessions/{id}/messages` with [`wire::AppendRequest`] → [`wire::MessagesResponse`]
//! - `GET    /sessions/{id}/messages?limit=N` → [`wire::MessagesResponse`]
//! - `DELETE /sessions/{id}` → 204, or 404 when unknown
//! - `GET    /health` → 200 when live
//!
//! The service owns sequence numbering and idle expiry.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use saga_core::{Message, NewMessage, Session, SessionId, StoreMode};
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::store::{SessionStore, StoreHealth};

pub mod wire {
    use chrono::{DateTime, Utc};
    use saga_core::{Message, NewMessage, Session, SessionId, StoreMode};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct RemoteSession {
        pub id: SessionId,
        pub created_at: DateTime<Utc>,
        pub last_active_at: DateTime<Utc>,
        #[serde(default)]
        pub message_count: u64,
    }

    impl RemoteSession {
        pub fn into_session(self) -> Session {
            Session {
                id: self.id,
                mode: StoreMode::ManagedRemote,
                created_at: self.created_at,
                last_active_at: self.last_active_at,
                message_count: self.message_count,
            }
        }
    }

    impl From<Session> for RemoteSession {
        fn from(s: Session) -> Self {
            Self {
                id: s.id,
                created_at: s.created_at,
                last_active_at: s.last_active_at,
                message_count: s.message_count,
            }
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AppendRequest {
        pub messages: Vec<NewMessage>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct MessagesResponse {
        pub messages: Vec<Message>,
    }
}

pub struct RemoteStore {
    client: Client,
    base: Url,
}

impl RemoteStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let base = Url::parse(base_url)
            .map_err(|e| StoreError::Unavailable(format!("invalid remote url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::Unavailable(format!(
                "remote url cannot be a base: {base_url}"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("http client: {e}")))?;
        Ok(Self { client, base })
    }

    /// Join path segments onto the base url, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            let _ = path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.client.request(method, self.url(segments))
    }

    async fn send(&self, request: RequestBuilder, id: &SessionId) -> Result<Response, StoreError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::SessionNotFound(id.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %body, "remote session service error");
        Err(StoreError::Remote {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl SessionStore for RemoteStore {
    fn mode(&self) -> StoreMode {
        StoreMode::ManagedRemote
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn get_or_create(&self, id: &SessionId) -> Result<Session, StoreError> {
        let request = self.request(Method::PUT, &["sessions", id.as_str()]);
        let session: wire::RemoteSession = self.send(request, id).await?.json().await?;
        Ok(session.into_session())
    }

    #[instrument(skip(self, messages), fields(session_id = %id, count = messages.len()))]
    async fn append_batch(
        &self,
        id: &SessionId,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError> {
        let request = self
            .request(Method::POST, &["sessions", id.as_str(), "messages"])
            .json(&wire::AppendRequest { messages });
        let body: wire::MessagesResponse = self.send(request, id).await?.json().await?;
        Ok(body.messages)
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn history(
        &self,
        id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        let mut request = self.request(Method::GET, &["sessions", id.as_str(), "messages"]);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        let body: wire::MessagesResponse = self.send(request, id).await?.json().await?;
        Ok(body.messages)
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn close(&self, id: &SessionId) -> Result<bool, StoreError> {
        let request = self.request(Method::DELETE, &["sessions", id.as_str()]);
        match self.send(request, id).await {
            Ok(_) => Ok(true),
            Err(StoreError::SessionNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The remote service expires sessions on its own schedule.
    async fn reap_idle(&self, _max_idle: Duration) -> Result<usize, StoreError> {
        Ok(0)
    }

    async fn health(&self) -> StoreHealth {
        let result = self.client.get(self.url(&["health"])).send().await;
        match result {
            Ok(r) if r.status().is_success() => StoreHealth::live(StoreMode::ManagedRemote),
            Ok(r) => StoreHealth::down(
                StoreMode::ManagedRemote,
                format!("remote health returned {}", r.status()),
            ),
            Err(e) => StoreHealth::down(StoreMode::ManagedRemote, e.to_string()),
        }
    }
}
