use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use saga_core::settings::{load_settings, load_settings_from_path};
use saga_core::StoreMode;
use saga_engine::{default_agents, AgentRegistry, Generator, HttpGenerator, Router, RouterConfig};
use saga_server::ServerConfig;
use saga_store::{open_store, spawn_idle_reaper};
use saga_telemetry::{init_telemetry, MetricsRecorder, TelemetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

/// Multi-agent story orchestration server.
#[derive(Debug, Parser)]
#[command(name = "saga", version)]
struct Cli {
    /// Settings file (defaults to ~/.saga/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port; overrides settings.
    #[arg(long)]
    port: Option<u16>,

    /// Session backend: ephemeral, persistent-pooled or managed-remote.
    #[arg(long)]
    mode: Option<StoreMode>,

    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    plain_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        json: !cli.plain_logs,
        ..TelemetryConfig::default()
    });

    let mut settings = match &cli.config {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("loading settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(mode) = cli.mode {
        settings.store.mode = mode;
    }
    settings.validate().context("invalid settings")?;

    let store = open_store(&settings).await.context("opening session store")?;

    let generator = HttpGenerator::from_settings(&settings.generator).context("generator client")?;
    if !generator.is_configured() {
        warn!("generator.url not set; bundled agents will report unavailable");
    }
    let generator: Arc<dyn Generator> = Arc::new(generator);
    let registry = Arc::new(AgentRegistry::new(settings.engine.tie_break));
    for agent in default_agents(generator) {
        registry.register(agent.name().to_string(), agent);
    }

    let router = Arc::new(Router::new(
        Arc::clone(&store),
        registry,
        Arc::new(MetricsRecorder::new()),
        RouterConfig::from(&settings.engine),
    ));

    let background = CancellationToken::new();
    let reaper = spawn_idle_reaper(
        Arc::clone(&store),
        settings.store.reap_interval(),
        settings.store.session_idle_timeout(),
        background.clone(),
    );

    let server = saga_server::start(ServerConfig::from(&settings.server), router)
        .await
        .context("starting server")?;
    info!(port = server.port(), mode = %store.mode(), "saga ready");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    server.shutdown().await;
    background.cancel();
    let _ = reaper.await;
    store.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_overrides() {
        let cli = Cli::parse_from([
            "saga",
            "--port",
            "0",
            "--mode",
            "persistent-pooled",
            "--log-level",
            "debug",
            "--plain-logs",
        ]);
        assert_eq!(cli.port, Some(0));
        assert_eq!(cli.mode, Some(StoreMode::PersistentPooled));
        assert_eq!(cli.log_level, Level::DEBUG);
        assert!(cli.plain_logs);
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["saga", "--mode", "floppy"]).is_err());
    }
}
