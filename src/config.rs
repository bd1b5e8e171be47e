//! Application configuration
//!
//! Loaded from `config.json` in the data directory; every field can be
//! overridden by a `REWALL_*` environment variable, which is how
//! containerized and test deployments run without a config file.

use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log would-be iptables commands instead of executing them.
    /// For non-privileged environments; env: `REWALL_MOCK=1`
    #[serde(default)]
    pub mock_mode: bool,

    /// SQLite database path; env: `REWALL_DB_PATH`.
    /// Defaults to `<data dir>/rewall.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// HTTP listen address; env: `REWALL_LISTEN_ADDR`
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Command invoked by the explicit save step. When unset, falls back
    /// to `iptables-save` > /etc/iptables/rules.v4.
    /// env: `REWALL_SAVE_COMMAND`
    #[serde(default)]
    pub save_command: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mock_mode: false,
            db_path: None,
            listen_addr: default_listen_addr(),
            save_command: None,
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8722".to_string()
}

impl AppConfig {
    /// Resolved database path: explicit config, else the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            get_data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("rewall.db")
        })
    }

    /// Applies `REWALL_*` environment overrides on top of the file-loaded
    /// values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("REWALL_MOCK") {
            self.mock_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("REWALL_DB_PATH") {
            if !v.is_empty() {
                self.db_path = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = std::env::var("REWALL_LISTEN_ADDR") {
            if !v.is_empty() {
                self.listen_addr = v;
            }
        }
        if let Ok(v) = std::env::var("REWALL_SAVE_COMMAND") {
            if !v.is_empty() {
                self.save_command = Some(v);
            }
        }
    }
}

/// Loads the app config from disk (default when missing or unreadable),
/// then applies environment overrides.
pub async fn load_config() -> AppConfig {
    let mut config = AppConfig::default();
    if let Some(mut path) = get_data_dir() {
        path.push("config.json");
        if let Ok(json) = tokio::fs::read_to_string(&path).await {
            if let Ok(loaded) = serde_json::from_str::<AppConfig>(&json) {
                config = loaded;
            }
        }
    }
    config.apply_env_overrides();
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listen_addr() {
        let config = AppConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:8722");
        assert!(!config.mock_mode);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig = serde_json::from_str("{\"mock_mode\": true}").unwrap();
        assert!(config.mock_mode);
        assert_eq!(config.listen_addr, "127.0.0.1:8722");
        assert!(config.save_command.is_none());
    }

    #[test]
    fn test_database_path_prefers_explicit() {
        let config = AppConfig {
            db_path: Some(PathBuf::from("/tmp/custom.db")),
            ..AppConfig::default()
        };
        assert_eq!(config.database_path(), PathBuf::from("/tmp/custom.db"));
    }
}
