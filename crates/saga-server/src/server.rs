use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get};
use axum::Router as HttpRouter;
use saga_core::settings::ServerSettings;
use saga_engine::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::connection::{ConnectionRegistry, Heartbeat};
use crate::handlers;

/// How long `ServerHandle::shutdown` waits for the listener to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat: Heartbeat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_send_queue: s.max_send_queue,
            heartbeat: Heartbeat::default(),
        }
    }
}

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub connections: Arc<ConnectionRegistry>,
    pub max_send_queue: usize,
    pub heartbeat: Heartbeat,
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> HttpRouter {
    HttpRouter::new()
        .route("/ws/{session_id}", get(handlers::stream))
        .route("/health", get(handlers::health))
        .route("/agents", get(handlers::agents))
        .route("/metrics", get(handlers::metrics))
        .route("/sessions/{session_id}", delete(handlers::close_session))
        .route("/sessions/{session_id}/messages", get(handlers::history))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Port 0 picks a free port.
pub async fn start(config: ServerConfig, router: Arc<Router>) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let state = AppState {
        router,
        connections: Arc::new(ConnectionRegistry::new()),
        max_send_queue: config.max_send_queue,
        heartbeat: config.heartbeat,
        shutdown: shutdown.clone(),
    };

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "saga server listening");

    let app = build_router(state);
    let stop = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr,
        shutdown,
        server,
    })
}

/// Running server. Dropping it leaves the server running; call
/// [`ServerHandle::shutdown`] to stop.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Close streaming connections, stop accepting and wait for the listener.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let mut server = self.server;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
            warn!("server did not drain in time; aborting");
            server.abort();
        }
        info!("saga server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_engine::{AgentRegistry, RouterConfig};
    use saga_store::EphemeralStore;
    use saga_telemetry::MetricsRecorder;

    fn router() -> Arc<Router> {
        Arc::new(Router::new(
            Arc::new(EphemeralStore::new()),
            Arc::new(AgentRegistry::default()),
            Arc::new(MetricsRecorder::new()),
            RouterConfig::default(),
        ))
    }

    #[test]
    fn config_from_settings() {
        let config = ServerConfig::from(&ServerSettings {
            host: "127.0.0.1".into(),
            port: 0,
            max_send_queue: 8,
        });
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_send_queue, 8);
        assert_eq!(config.heartbeat.interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn starts_on_random_port_and_stops() {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        let handle = start(config, router()).await.unwrap();
        assert!(handle.port() > 0);
        handle.shutdown().await;
    }
}
