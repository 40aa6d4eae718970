//! Server configuration: defaults, optional TOML file, CLI overrides.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to.
    pub bind_addr: String,
    /// Root directory for vaults, backups and the membership database.
    pub data_root: PathBuf,
    /// Seconds between autosave flushes of dirty vaults.
    pub autosave_secs: u64,
    /// Milliseconds of quiet time before a changed file hits disk.
    pub debounce_ms: u64,
    /// Seconds between backup scheduler ticks.
    pub backup_interval_secs: u64,
    /// Seconds a connection may stay unauthenticated before being dropped.
    pub auth_timeout_secs: u64,
    /// Token file for the built-in static verifier.
    pub tokens_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            data_root: PathBuf::from("quill_data"),
            autosave_secs: 10,
            debounce_ms: 200,
            backup_interval_secs: 3600,
            auth_timeout_secs: 30,
            tokens_path: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9191");
        assert_eq!(config.autosave_secs, 10);
        assert_eq!(config.debounce_ms, 200);
        assert_eq!(config.backup_interval_secs, 3600);
        assert!(config.tokens_path.is_none());
    }

    #[test]
    fn loads_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.toml");
        std::fs::write(
            &path,
            "bind_addr = \"0.0.0.0:9000\"\ndebounce_ms = 500\n",
        )
        .unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.debounce_ms, 500);
        // Everything else keeps its default.
        assert_eq!(config.autosave_secs, 10);
    }

    #[test]
    fn rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.toml");
        std::fs::write(&path, "bind_adr = \"oops\"\n").unwrap();
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_errors() {
        assert!(matches!(
            ServerConfig::load(Path::new("/nonexistent/quill.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
