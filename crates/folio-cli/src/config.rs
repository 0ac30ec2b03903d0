//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use folio_client::SessionConfig;
use serde::Deserialize;

/// Global configuration for folio
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub session: SessionSettings,
    pub cache: CacheConfig,
    pub import: ImportConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    #[serde(deserialize_with = "deserialize_env_string")]
    pub base_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("FOLIO_API_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Assumed access token lifetime in seconds
    pub lifetime_secs: u64,
    /// Refresh this many seconds before the token expires
    pub lead_secs: u64,
    pub file: PathBuf,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            lifetime_secs: 900,
            lead_secs: 60,
            file: data_dir().join("session.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Chapters kept ahead of the reading position
    pub window: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: data_dir().join("cache"),
            window: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub status_throttle_ms: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            status_throttle_ms: 250,
        }
    }
}

fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "folio")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".folio"))
}

/// Deserialize a string that may be an environment variable reference like ${VAR}
fn deserialize_env_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    expand_env_var(&s)
        .ok_or_else(|| serde::de::Error::custom(format!("environment variable in {s} is not set")))
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./folio.toml (current directory)
    /// 2. ~/.config/folio/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("folio.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "folio") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject settings that would make the session refresh loop spin.
    pub fn validate(&self) -> Result<()> {
        let (lifetime_secs, lead_secs) = (self.session.lifetime_secs, self.session.lead_secs);
        if lead_secs >= lifetime_secs {
            bail!(
                "session.lead_secs ({lead_secs}) must be less than session.lifetime_secs ({lifetime_secs})"
            );
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            lifetime: Duration::from_secs(self.session.lifetime_secs),
            lead: Duration::from_secs(self.session.lead_secs),
        }
    }

    pub fn status_throttle(&self) -> Duration {
        Duration::from_millis(self.import.status_throttle_ms)
    }
}
