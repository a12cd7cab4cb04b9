//! Configuration management for the server and the watch client.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for sensor-hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for storing data
    pub data_dir: PathBuf,

    /// Path to SQLite database
    pub db_path: PathBuf,

    /// Path to config directory
    pub config_dir: PathBuf,

    /// Log filter used when neither `RUST_LOG` nor `--verbose`/`--debug` is given
    pub log_level: String,

    /// Address the HTTP server binds to
    pub host: String,

    /// HTTP port for the REST API and push channel
    pub http_port: u16,

    /// Browser origin allowed to call the API and open the push channel
    pub allowed_origin: String,

    /// Base URL of the REST API, used by the client commands
    pub api_url: String,

    /// Push channel endpoint, used by the watch client
    pub ws_url: String,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| home.join(".local/share"))
            .join("sensor-hub");
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join("sensor-hub");

        Self {
            db_path: data_dir.join("sensors.db"),
            config_dir,
            data_dir,
            log_level: "warn".to_string(),
            host: "127.0.0.1".to_string(),
            http_port: 3001,
            allowed_origin: "http://localhost:3000".to_string(),
            api_url: "http://127.0.0.1:3001".to_string(),
            ws_url: "ws://127.0.0.1:3001/ws".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load the config file if present, otherwise defaults; then apply the environment.
    pub fn resolve(path: Option<&str>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::load(p)?,
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::load(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        Ok(config.apply_env(|key| std::env::var(key).ok()))
    }

    /// Save configuration to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Ensure all directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.config_dir)?;
        Ok(())
    }

    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        Self::default().config_dir.join("config.json")
    }

    /// Override fields from environment variables.
    ///
    /// The lookup is injected so tests don't have to touch the process environment.
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("BACKEND_PORT").and_then(|p| p.parse().ok()) {
            self.http_port = port;
        }
        if let Some(host) = lookup("SENSOR_HUB_HOST") {
            self.host = host;
        }
        if let Some(db) = lookup("SENSOR_HUB_DB") {
            self.db_path = PathBuf::from(db);
        }
        if let Some(origin) = lookup("SENSOR_HUB_ALLOWED_ORIGIN") {
            self.allowed_origin = origin;
        }
        if let Some(url) = lookup("SENSOR_HUB_API_URL") {
            self.api_url = url;
        }
        if let Some(url) = lookup("SENSOR_HUB_WS_URL") {
            self.ws_url = url;
        }
        self
    }
}
