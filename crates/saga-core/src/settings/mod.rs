//! Deployment configuration.
//!
//! Every field has a compiled default, so a partial JSON file or a bare
//! environment is enough to run. See [`loader`] for the merge order.

mod loader;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messages::StoreMode;

pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// How to pick among several accepting agents for a non-composite request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// First accepting agent in registration order.
    #[default]
    RegistrationOrder,
    /// Accepting agent with the lowest kind priority; registration order
    /// breaks remaining ties.
    KindPriority,
}

impl std::str::FromStr for TieBreak {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registration-order" => Ok(Self::RegistrationOrder),
            "kind-priority" => Ok(Self::KindPriority),
            other => Err(format!("unknown tie-break policy: {other}")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub pool: PoolSettings,
    pub engine: EngineSettings,
    pub server: ServerSettings,
    pub generator: GeneratorSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub mode: StoreMode,
    pub database_path: String,
    pub remote_url: Option<String>,
    pub remote_timeout_ms: u64,
    pub session_idle_timeout_ms: u64,
    pub reap_interval_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            mode: StoreMode::Ephemeral,
            database_path: saga_home()
                .join("database")
                .join("sessions.db")
                .to_string_lossy()
                .into_owned(),
            remote_url: None,
            remote_timeout_ms: 10_000,
            session_idle_timeout_ms: 30 * 60 * 1000,
            reap_interval_ms: 60_000,
        }
    }
}

impl StoreSettings {
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_size: u32,
    pub max_size: u32,
    pub idle_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 8,
            idle_timeout_ms: 5 * 60 * 1000,
            connection_timeout_ms: 5_000,
            health_check_interval_ms: 30_000,
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Hard cap on one agent's generation time.
    pub agent_timeout_ms: u64,
    /// Messages of history handed to agents.
    pub history_limit: usize,
    pub session_retry_attempts: u32,
    pub session_retry_base_delay_ms: u64,
    pub tie_break: TieBreak,
    pub dedupe_window_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            agent_timeout_ms: 120_000,
            history_limit: 50,
            session_retry_attempts: 3,
            session_retry_base_delay_ms: 100,
            tie_break: TieBreak::RegistrationOrder,
            dedupe_window_ms: 10 * 60 * 1000,
        }
    }
}

impl EngineSettings {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn session_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.session_retry_base_delay_ms)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9092,
            max_send_queue: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    pub url: Option<String>,
    /// Connect and per-read timeout; total time is bounded by
    /// `engine.agent_timeout_ms`.
    pub timeout_ms: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 60_000,
        }
    }
}

impl Settings {
    /// Reject combinations the pool or store cannot honor.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.pool.max_size == 0 {
            return Err(SettingsError::InvalidValue("pool.max_size must be at least 1".into()));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(SettingsError::InvalidValue(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.store.mode == StoreMode::ManagedRemote
            && self.store.remote_url.as_deref().filter(|u| !u.is_empty()).is_none()
        {
            return Err(SettingsError::InvalidValue(
                "store.remote_url is required for managed-remote mode".into(),
            ));
        }
        Ok(())
    }
}

/// `~/.saga`, falling back to `/tmp/.saga` without a home directory.
pub fn saga_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".saga")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.store.mode, StoreMode::Ephemeral);
        assert_eq!(settings.engine.tie_break, TieBreak::RegistrationOrder);
    }

    #[test]
    fn min_above_max_rejected() {
        let mut settings = Settings::default();
        settings.pool.min_size = 4;
        settings.pool.max_size = 2;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn zero_max_rejected() {
        let mut settings = Settings::default();
        settings.pool.min_size = 0;
        settings.pool.max_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn remote_mode_needs_url() {
        let mut settings = Settings::default();
        settings.store.mode = StoreMode::ManagedRemote;
        assert!(settings.validate().is_err());
        settings.store.remote_url = Some("http://sessions.internal".into());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"pool": {"max_size": 2}, "store": {"mode": "persistent-pooled"}}"#)
                .unwrap();
        assert_eq!(settings.pool.max_size, 2);
        assert_eq!(settings.pool.min_size, 1);
        assert_eq!(settings.store.mode, StoreMode::PersistentPooled);
        assert_eq!(settings.server.port, 9092);
    }

    #[test]
    fn tie_break_parses() {
        assert_eq!("kind-priority".parse::<TieBreak>(), Ok(TieBreak::KindPriority));
        assert!("random".parse::<TieBreak>().is_err());
    }

    #[test]
    fn duration_helpers() {
        let pool = PoolSettings {
            connection_timeout_ms: 100,
            ..Default::default()
        };
        assert_eq!(pool.connection_timeout(), Duration::from_millis(100));
    }
}
