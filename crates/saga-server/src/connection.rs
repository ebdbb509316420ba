use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use saga_core::{AgentRequest, OutboundFrame, RequestId, SessionId};
use saga_engine::{ChannelSink, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Requests queued per connection while an earlier one is still running.
const MAX_PENDING_REQUESTS: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl Default for ConnectionId {
    fn default() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl ConnectionId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ping cadence and how long a silent client is tolerated.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

/// Inbound frame from a streaming client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    pub text: String,
    /// Explicit agent override.
    #[serde(default, alias = "agent_name", skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Client-chosen id; resending the same id never runs agents twice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let frame: Self = serde_json::from_str(raw).map_err(|e| format!("invalid frame: {e}"))?;
        if frame.text.trim().is_empty() {
            return Err("invalid frame: text is empty".into());
        }
        Ok(frame)
    }

    pub fn into_request(self, session_id: SessionId) -> AgentRequest {
        let request_id = self
            .request_id
            .filter(|id| !id.is_empty())
            .map_or_else(RequestId::new, RequestId::from_raw);
        AgentRequest {
            request_id,
            session_id,
            raw_text: self.text,
            requested_agent: self.agent.filter(|a| !a.is_empty()),
            metadata: self.metadata,
        }
    }
}

/// A live streaming connection.
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub session_id: SessionId,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl ConnectionInfo {
    fn new(session_id: SessionId) -> Self {
        Self {
            id: ConnectionId::new(),
            session_id,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// All open streaming connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: SessionId) -> Arc<ConnectionInfo> {
        let info = Arc::new(ConnectionInfo::new(session_id));
        self.connections.insert(info.id.clone(), Arc::clone(&info));
        info
    }

    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, info)) = self.connections.remove(id) {
            info.connected.store(false, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn for_session(&self, session_id: &SessionId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|e| &e.value().session_id == session_id)
            .map(|e| e.key().clone())
            .collect()
    }
}

/// Serve one streaming connection bound to `session_id`.
///
/// The reader queues requests, a dispatcher runs them one at a time through
/// the router, and the writer drains frames to the socket with a heartbeat.
/// When the client goes away the dispatcher is left running so in-flight
/// output is still persisted.
pub async fn handle_connection(
    socket: WebSocket,
    session_id: SessionId,
    router: Arc<Router>,
    registry: Arc<ConnectionRegistry>,
    max_send_queue: usize,
    heartbeat: Heartbeat,
    shutdown: CancellationToken,
) {
    let info = registry.register(session_id.clone());
    let conn_id = info.id.clone();
    router
        .metrics()
        .gauge_set("saga.connections.active", &[], registry.count() as f64);
    info!(connection_id = %conn_id, session_id = %session_id, "stream connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(max_send_queue.max(1));
    let (req_tx, mut req_rx) = mpsc::channel::<AgentRequest>(MAX_PENDING_REQUESTS);

    let writer_info = Arc::clone(&info);
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat.interval);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "failed to encode frame");
                            continue;
                        }
                    };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if !writer_info.is_alive(heartbeat.timeout) {
                        info!(connection_id = %writer_info.id, "client missed heartbeats");
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    trace!(connection_id = %writer_info.id, "sent ping");
                }
                () = shutdown.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    let reader_info = Arc::clone(&info);
    let reader_out = out_tx.clone();
    let reader_session = session_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let request = match InboundFrame::parse(text.as_str()) {
                        Ok(frame) => frame.into_request(reader_session.clone()),
                        Err(reason) => {
                            debug!(connection_id = %reader_info.id, %reason, "rejected frame");
                            let _ = reader_out
                                .send(OutboundFrame::failure("invalid_frame", reason, false))
                                .await;
                            continue;
                        }
                    };
                    let request_id = request.request_id.clone();
                    if let Err(mpsc::error::TrySendError::Full(_)) = req_tx.try_send(request) {
                        warn!(connection_id = %reader_info.id, "request queue full");
                        let frame = OutboundFrame::failure(
                            "too_many_requests",
                            "too many requests in flight on this connection",
                            true,
                        )
                        .with_request_id(request_id.as_str());
                        let _ = reader_out.send(frame).await;
                    }
                }
                WsMessage::Pong(_) => reader_info.record_pong(),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // Detached: keeps running after a disconnect so the transcript is saved.
    let dispatch_router = Arc::clone(&router);
    tokio::spawn(async move {
        let sink = ChannelSink::new(out_tx);
        while let Some(request) = req_rx.recv().await {
            let _ = dispatch_router.dispatch(request, &sink).await;
        }
    });

    tokio::select! {
        _ = &mut writer => {}
        _ = &mut reader => {}
    }
    writer.abort();
    reader.abort();

    registry.unregister(&conn_id);
    router
        .metrics()
        .gauge_set("saga.connections.active", &[], registry.count() as f64);
    info!(connection_id = %conn_id, session_id = %session_id, "stream disconnected");
}
