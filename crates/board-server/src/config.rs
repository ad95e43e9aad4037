//! Configuration for the hub and the headless client.
//!
//! Loaded from `config.json` in the config directory. A default file is
//! written on first start for reference.

use anyhow::{Context, Result};
use board_sync::{BreakerConfig, SessionConfig, SyncOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::client::ReconnectConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Bearer tokens the hub accepts. Empty disables authentication.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Debounce period for storage watcher events
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,

    #[serde(default)]
    pub client: ClientConfig,
}

/// Settings for sessions run by `board-server follow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// URL path prefix of embeddable file links
    #[serde(default = "default_files_prefix")]
    pub files_prefix: String,

    #[serde(default = "default_change_debounce_ms")]
    pub change_debounce_ms: u64,

    #[serde(default = "default_state_debounce_ms")]
    pub state_debounce_ms: u64,

    /// How often the session is ticked
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default)]
    pub options: SyncOptions,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            files_prefix: default_files_prefix(),
            change_debounce_ms: default_change_debounce_ms(),
            state_debounce_ms: default_state_debounce_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            options: SyncOptions::default(),
            breaker: BreakerConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Session settings for `board`.
    pub fn session_config(&self, board: &str) -> SessionConfig {
        let mut config = SessionConfig::new(board).with_options(self.options.clone());
        config.files_prefix = self.files_prefix.clone();
        config.change_debounce_ms = self.change_debounce_ms;
        config.state_debounce_ms = self.state_debounce_ms;
        config.breaker = self.breaker;
        config
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

fn default_watch_debounce_ms() -> u64 {
    200
}

fn default_files_prefix() -> String {
    "/files/".to_string()
}

fn default_change_debounce_ms() -> u64 {
    300
}

fn default_state_debounce_ms() -> u64 {
    500
}

fn default_tick_interval_ms() -> u64 {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            watch_debounce_ms: default_watch_debounce_ms(),
            client: ClientConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config directory
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_file = config_path.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config =
                serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            std::fs::create_dir_all(config_path)
                .with_context(|| format!("Failed to create config directory: {:?}", config_path))?;

            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();

        assert!(config.tokens.is_empty());
        assert_eq!(config.watch_debounce_ms, 200);
        assert!(dir.path().join("config.json").exists());

        // The written file loads back.
        let again = Config::load(dir.path()).unwrap();
        assert_eq!(again.client.tick_interval_ms, 50);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"tokens":["abc"],"client":{"filesPrefix":"/boards/","stateDebounceMs":250}}"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.tokens, vec!["abc".to_string()]);

        let session = config.client.session_config("demo");
        assert_eq!(session.board_name, "demo");
        assert_eq!(session.files_prefix, "/boards/");
        assert_eq!(session.state_debounce_ms, 250);
        assert_eq!(session.change_debounce_ms, 300);
        assert_eq!(session.breaker.threshold, 3);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
