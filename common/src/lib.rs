/*!
common/src/lib.rs

Shared configuration types and database bootstrap for mirrorfeed.

This crate provides:
- `Config`, deserialized from TOML, covering every key in the spec's
  configuration surface
- An async loader that merges a default config file with an optional
  override file (override wins key-by-key)
- A helper that opens the single SQLite connection the store is built on
*/

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to open database at {path}: {source}")]
    Database {
        path: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to create database directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A seed target written to the store only on first boot (empty store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSeed {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub poll_interval_seconds: i64,
}

fn default_user_agent() -> String {
    "mirrorfeed/0.1".to_string()
}

fn default_max_rpm() -> i64 {
    10
}

fn default_backoff_base_seconds() -> i64 {
    30
}

fn default_enable_sse() -> bool {
    true
}

fn default_html_fallback_pattern() -> String {
    r"/status/(\d+)".to_string()
}

/// Top-level application configuration (deserialized from `config.toml`).
///
/// Every field corresponds to a key in the spec's "Configuration"
/// section; only `storage_path`, `log_path` and `nitter_instances` are
/// required, the rest fall back to the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage_path: String,
    pub log_path: String,
    pub nitter_instances: Vec<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_rpm")]
    pub max_requests_per_instance_per_minute: i64,
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: i64,
    #[serde(default = "default_enable_sse")]
    pub enable_sse: bool,
    pub keep_only_last_n_per_target: Option<i64>,
    #[serde(default = "default_html_fallback_pattern")]
    pub html_fallback_pattern: String,
    #[serde(default)]
    pub targets: Vec<TargetSeed>,
}

impl Config {
    /// Load configuration from a single TOML file asynchronously.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|source| ConfigError::Read {
                path: path.as_ref().display().to_string(),
                source,
            })?;
        let cfg: Config = toml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional
    /// override file. If both are present, they are merged with the
    /// override taking precedence key-by-key.
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if path.exists() {
                let data =
                    tokio::fs::read_to_string(path)
                        .await
                        .map_err(|source| ConfigError::Read {
                            path: path.display().to_string(),
                            source,
                        })?;
                let val: toml::Value = toml::from_str(&data)?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value.try_into()?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Open the single SQLite connection the store runs on.
///
/// The store deliberately uses one connection behind a mutex rather than
/// a pool (see DESIGN.md) so insert-or-ignore dedupe and the
/// newest-id bookkeeping in `update_target_fetch_state` can never race
/// across two physical connections.
pub async fn open_sqlite_connection(path: &str) -> Result<SqliteConnection, ConfigError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Directory {
                    path: parent.display().to_string(),
                    source,
                })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
        .map_err(|source| ConfigError::Database {
            path: path.to_string(),
            source,
        })?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    SqliteConnection::connect_with(&options)
        .await
        .map_err(|source| ConfigError::Database {
            path: path.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let toml = r#"
            storage_path = "data/mirrorfeed.db"
            log_path = "data/mirrorfeed.log"
            nitter_instances = ["https://a.example", "https://b.example"]
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert_eq!(cfg.nitter_instances.len(), 2);
        assert_eq!(cfg.user_agent, "mirrorfeed/0.1");
        assert_eq!(cfg.max_requests_per_instance_per_minute, 10);
        assert_eq!(cfg.backoff_base_seconds, 30);
        assert!(cfg.enable_sse);
        assert_eq!(cfg.keep_only_last_n_per_target, None);
        assert_eq!(cfg.html_fallback_pattern, r"/status/(\d+)");
        assert!(cfg.targets.is_empty());
    }

    #[test]
    fn parses_full_config_and_seed_targets() {
        let toml = r#"
            storage_path = "data/mirrorfeed.db"
            log_path = "data/mirrorfeed.log"
            nitter_instances = ["https://a.example"]
            user_agent = "custom-ua/2"
            max_requests_per_instance_per_minute = 30
            backoff_base_seconds = 5
            enable_sse = false
            keep_only_last_n_per_target = 200

            [[targets]]
            type = "user"
            value = "alice"
            poll_interval_seconds = 120
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert_eq!(cfg.max_requests_per_instance_per_minute, 30);
        assert!(!cfg.enable_sse);
        assert_eq!(cfg.keep_only_last_n_per_target, Some(200));
        assert_eq!(cfg.targets.len(), 1);
        assert_eq!(cfg.targets[0].kind, "user");
        assert_eq!(cfg.targets[0].value, "alice");
    }

    #[tokio::test]
    async fn load_with_defaults_merges_override_over_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");

        tokio::fs::write(
            &default_path,
            r#"
                storage_path = "data/default.db"
                log_path = "data/default.log"
                nitter_instances = ["https://default.example"]
                backoff_base_seconds = 10
            "#,
        )
        .await
        .unwrap();

        tokio::fs::write(
            &override_path,
            r#"
                storage_path = "data/override.db"
            "#,
        )
        .await
        .unwrap();

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load merged config");

        assert_eq!(cfg.storage_path, "data/override.db");
        assert_eq!(cfg.log_path, "data/default.log");
        assert_eq!(cfg.backoff_base_seconds, 10);
    }

    #[tokio::test]
    async fn open_sqlite_connection_creates_parent_dir_and_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("mirrorfeed.db");
        let db_path_str = db_path.to_string_lossy().to_string();

        let conn = open_sqlite_connection(&db_path_str)
            .await
            .expect("open connection");
        drop(conn);
        assert!(db_path.exists());
    }
}
