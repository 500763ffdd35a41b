// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::infra::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Base URL of the agent runtime.
    pub base_url: String,
    /// Application name registered with the runtime.
    pub app_name: String,
    /// Use the SSE streaming endpoint. When false, progress is simulated
    /// over the synchronous run endpoint.
    pub streaming: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            app_name: "drop_agent".into(),
            streaming: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Base URL of the video endpoints. Defaults to the runtime base URL.
    pub base_url: Option<String>,
    /// Seconds between status polls for a long-running job.
    pub poll_interval_secs: u64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Override for the SQLite database path.
    pub db_path: Option<String>,
}

impl Config {
    /// Load config from file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        Ok(config)
    }

    /// The effective video base URL: the explicit one or the runtime's.
    pub fn video_base_url(&self) -> &str {
        self.video
            .base_url
            .as_deref()
            .unwrap_or(&self.runtime.base_url)
    }
}
