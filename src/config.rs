//! Operator configuration: TOML file plus environment overrides.
//!
//! The file lives at the platform config dir (`live-interp/config.toml`).
//! A missing file means defaults. Secrets are usually supplied through
//! the environment:
//!
//! | Variable               | Overrides               |
//! |------------------------|-------------------------|
//! | `GEMINI_API_KEY`       | `gemini.api_key`        |
//! | `SUPABASE_URL`         | `relay.supabase.url`    |
//! | `SUPABASE_SERVICE_KEY` | `relay.supabase.service_key` |
//! | `SUPABASE_RELAY_TABLE` | `relay.supabase.table`   |

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::SupabaseConfig;
use crate::voice::gemini_live::{DEFAULT_SETUP_TIMEOUT, GEMINI_LIVE_WS_URL};
use crate::voice::pipeline::{SessionConfig, DEFAULT_MODEL};

const APP_NAME: &str = "live-interp";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub setup_timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            endpoint: GEMINI_LIVE_WS_URL.to_string(),
            setup_timeout_secs: DEFAULT_SETUP_TIMEOUT.as_secs(),
        }
    }
}

impl GeminiConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Without a Supabase section the relay stays in-process.
    pub supabase: Option<SupabaseConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gemini: GeminiConfig,
    pub session: SessionConfig,
    pub relay: RelayConfig,
}

impl Config {
    /// `<config dir>/live-interp/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .session
            .validate()
            .with_context(|| format!("Invalid session settings in {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` or the default location, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("GEMINI_API_KEY") {
            self.gemini.api_key = Some(key);
        }

        match &mut self.relay.supabase {
            Some(supabase) => supabase.overlay_vars(&get),
            None => self.relay.supabase = SupabaseConfig::from_vars(&get),
        }
    }

    pub fn api_key(&self) -> anyhow::Result<&str> {
        self.gemini
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No Gemini API key: set GEMINI_API_KEY or gemini.api_key"))
    }
}
