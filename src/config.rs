//! Runtime configuration. Every section has defaults, so a missing file or a
//! partial file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::{DEFAULT_CHANGE_THRESHOLD, DEFAULT_MAX_RETRIES, DEFAULT_MAX_TURNS, ELEMENT_TEXT_MAX_CHARS};

pub const DEFAULT_CONFIG_FILE: &str = "webpilot.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: ModelConfig,
    pub turn: TurnConfig,
    pub executor: ExecutorConfig,
    pub features: FeatureConfig,
    pub browser: BrowserConfig,
    pub server: ServerConfig,
}

impl AgentConfig {
    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key_env: "OPENAI_API_KEY".into(),
            model: "gpt-4o".into(),
            base_url: "https://api.openai.com/v1".into(),
            temperature: 0.2,
            max_tokens: 2000,
            timeout_secs: 60,
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub max_turns: usize,
    /// Re-decisions allowed per turn before falling back to ASK_USER.
    pub max_retries: u32,
    /// Jaccard similarity below which the view counts as changed.
    pub change_threshold: f64,
    pub settle_delay_ms: u64,
    pub post_action_delay_ms: u64,
    /// Characters of element text shown to the model.
    pub max_element_text: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            max_retries: DEFAULT_MAX_RETRIES,
            change_threshold: DEFAULT_CHANGE_THRESHOLD,
            settle_delay_ms: 1000,
            post_action_delay_ms: 3000,
            max_element_text: ELEMENT_TEXT_MAX_CHARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub visible_timeout_ms: u64,
    pub new_page_timeout_ms: u64,
    pub load_timeout_ms: u64,
    pub type_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            visible_timeout_ms: 10_000,
            new_page_timeout_ms: 5_000,
            load_timeout_ms: 10_000,
            type_timeout_ms: 5_000,
        }
    }
}

impl ExecutorConfig {
    pub fn visible_timeout(&self) -> Duration {
        Duration::from_millis(self.visible_timeout_ms)
    }

    pub fn new_page_timeout(&self) -> Duration {
        Duration::from_millis(self.new_page_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn type_timeout(&self) -> Duration {
        Duration::from_millis(self.type_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub vision_enabled: bool,
    pub knowledge_enabled: bool,
    pub knowledge_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub start_url: Option<String>,
    pub chrome_path: Option<PathBuf>,
    /// DevTools endpoint of an already running Chrome, tried before launching.
    pub attach_url: Option<String>,
    /// Chrome user data directory. Defaults to `webpilot/profile` under the
    /// local data directory.
    pub profile_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".into(),
        }
    }
}
