//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `SAGA_*` environment variable overrides (highest priority)
//!
//! Invalid env values are logged and ignored.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use super::{saga_home, Settings, SettingsError, TieBreak};
use crate::messages::StoreMode;

/// `~/.saga/settings.json`.
pub fn settings_path() -> PathBuf {
    saga_home().join("settings.json")
}

pub fn load_settings() -> Result<Settings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` (defaults if missing), apply env overrides, validate.
pub fn load_settings_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Objects merge per key; arrays and primitives are replaced; nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Override source is injectable so tests don't touch process env.
fn apply_overrides_from(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // store
    if let Some(mode) = env.parsed::<StoreMode>("SAGA_STORE_MODE") {
        settings.store.mode = mode;
    }
    if let Some(v) = env.string("SAGA_DATABASE_PATH") {
        settings.store.database_path = v;
    }
    if let Some(v) = env.string("SAGA_REMOTE_URL") {
        settings.store.remote_url = Some(v);
    }
    if let Some(v) = env.u64("SAGA_SESSION_IDLE_TIMEOUT_MS", 1_000, 7 * 24 * 3_600_000) {
        settings.store.session_idle_timeout_ms = v;
    }

    // pool
    if let Some(v) = env.u64("SAGA_POOL_MIN", 0, 1_024) {
        settings.pool.min_size = v as u32;
    }
    if let Some(v) = env.u64("SAGA_POOL_MAX", 1, 1_024) {
        settings.pool.max_size = v as u32;
    }
    if let Some(v) = env.u64("SAGA_POOL_IDLE_TIMEOUT_MS", 1_000, 24 * 3_600_000) {
        settings.pool.idle_timeout_ms = v;
    }
    if let Some(v) = env.u64("SAGA_POOL_CONNECTION_TIMEOUT_MS", 1, 600_000) {
        settings.pool.connection_timeout_ms = v;
    }
    if let Some(v) = env.u64("SAGA_POOL_HEALTH_CHECK_INTERVAL_MS", 100, 3_600_000) {
        settings.pool.health_check_interval_ms = v;
    }

    // engine
    if let Some(v) = env.u64("SAGA_AGENT_TIMEOUT_MS", 100, 3_600_000) {
        settings.engine.agent_timeout_ms = v;
    }
    if let Some(v) = env.parsed::<TieBreak>("SAGA_TIE_BREAK") {
        settings.engine.tie_break = v;
    }

    // server
    if let Some(v) = env.string("SAGA_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64("SAGA_PORT", 0, u64::from(u16::MAX)) {
        settings.server.port = v as u16;
    }

    // generator
    if let Some(v) = env.string("SAGA_GENERATOR_URL") {
        settings.generator.url = Some(v);
    }
}

/// Parse `val` as a `u64` within `[min, max]`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        let val = self.string(name)?;
        let result = val.parse::<T>().ok();
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "unrecognized env var value, ignoring");
        }
        result
    }
}
