//! Configuration loader - YAML settings + .env overrides

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_STREAMLINES_URL: &str =
    "https://neuroinformatics.nl/HBP/allen-connectivity-viewer/json/streamlines_{id}.json.gz";
pub const DEFAULT_CONNECTIVITY_API: &str = "http://api.brain-map.org/api/v2/data/query.json";

/// Main configuration loaded from streamlines.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache_dir: PathBuf,
    /// Download URL with an `{id}` placeholder
    pub streamlines_url: String,
    pub connectivity_api: String,
    pub user_agent: String,
    pub request_timeout_secs: Option<u64>,
    pub render: RenderDefaults,
}

/// Default tube styling for streamline geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderDefaults {
    pub radius: f32,
    pub color: String,
    pub alpha: f32,
    pub resolution: u32,
}

/// Overrides loaded from .env
#[derive(Debug, Clone, Default)]
pub struct Env {
    pub cache_dir: Option<PathBuf>,
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data/streamlines"),
            streamlines_url: DEFAULT_STREAMLINES_URL.to_string(),
            connectivity_api: DEFAULT_CONNECTIVITY_API.to_string(),
            user_agent: "BrainStreamlines/0.1".to_string(),
            request_timeout_secs: None,
            render: RenderDefaults::default(),
        }
    }
}

impl Default for RenderDefaults {
    fn default() -> Self {
        Self {
            radius: 10.0,
            color: "ivory".to_string(),
            alpha: 0.8,
            resolution: 24,
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Apply .env overrides on top of the file settings
    pub fn with_env(mut self, env: &Env) -> Self {
        if let Some(dir) = &env.cache_dir {
            self.cache_dir = dir.clone();
        }
        self
    }
}

impl Env {
    /// Load overrides from .env file
    pub fn load() -> Self {
        dotenvy::dotenv().ok();

        Env {
            cache_dir: std::env::var("STREAMLINES_CACHE").ok().map(PathBuf::from),
            log_dir: std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string()),
        }
    }
}
