use proto::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_API_VERSION: &str = "2023-07-01-preview";
const DEFAULT_MAX_TOOL_ROUNDS: usize = agent::DEFAULT_MAX_TOOL_ROUNDS;

/// Chat-completions backend flavour.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI API or any OpenAI-compatible endpoint.
    #[default]
    OpenAi,
    /// Azure OpenAI; `base_url` is the resource endpoint and `model` the deployment.
    Azure,
}

impl LlmProvider {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
        }
    }
}

/// Top-level CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Language model connection.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Turn loop and storage settings.
    #[serde(default)]
    pub agent: AgentSection,
}

/// Language model connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    /// API key (env overrides applied at load time; see `Config::load`).
    #[serde(default)]
    pub api_key: String,
    /// Explicit API base URL, or the Azure resource endpoint.
    pub base_url: Option<String>,
    /// Model id, or the Azure deployment name.
    #[serde(default = "default_model")]
    pub model: String,
    /// Azure API version.
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            api_key: String::new(),
            base_url: None,
            model: default_model(),
            api_version: default_api_version(),
        }
    }
}

impl LlmConfig {
    /// Returns the base URL when one is set and non-empty.
    pub fn effective_base_url(&self) -> Option<&str> {
        self.base_url.as_deref().filter(|url| !url.trim().is_empty())
    }
}

/// `[agent]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Maximum LLM round trips per user turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Directory holding one `<agent>.json` per agent.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_max_tool_rounds() -> usize {
    DEFAULT_MAX_TOOL_ROUNDS
}

fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.toolgate/agents")
}

impl AgentSection {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn data_path(&self) -> PathBuf {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(rest)
            }
            None => PathBuf::from(&self.data_dir),
        }
    }
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            data_dir: default_data_dir(),
        }
    }
}

fn env_first(names: &[&str]) -> Option<(String, String)> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| (name.to_string(), v))
    })
}

impl Config {
    /// Loads configuration from explicit path, fallback locations, and env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            // Look in current dir, then home dir
            let cwd = std::env::current_dir().ok()?.join("config.toml");
            if cwd.exists() {
                return Some(cwd);
            }
            let home = std::env::var("HOME").ok()?;
            let home_config = PathBuf::from(home).join(".toolgate").join("config.toml");
            if home_config.exists() {
                return Some(home_config);
            }
            None
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = if let Some(path) = config_path {
            let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        debug!(
            provider = %config.llm.provider.name(),
            model = %config.llm.model,
            base_url = ?config.llm.effective_base_url(),
            data_dir = %config.agent.data_dir,
            "Config loaded"
        );
        Ok(config)
    }

    /// Environment variable overrides; Azure names win over the OpenAI ones.
    fn apply_env_overrides(&mut self) {
        if let Some((name, key)) = env_first(&["AZURE_OPENAI_KEY", "OPENAI_API_KEY"]) {
            if name.starts_with("AZURE_") {
                self.llm.provider = LlmProvider::Azure;
            }
            self.llm.api_key = key;
        }
        if let Some((name, endpoint)) =
            env_first(&["AZURE_OPENAI_ENDPOINT", "OPENAI_API_ENDPOINT"])
        {
            if name.starts_with("AZURE_") {
                self.llm.provider = LlmProvider::Azure;
            }
            self.llm.base_url = Some(endpoint);
        }
        if let Some((_, deployment)) =
            env_first(&["AZURE_OPENAI_DEPLOYMENT", "OPENAI_API_DEPLOYMENT"])
        {
            self.llm.model = deployment;
        }
        if let Some((_, version)) = env_first(&["OPENAI_API_VERSION"]) {
            self.llm.api_version = version;
        }
    }

    /// Rejects settings the turn loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::MissingField("llm.model".to_string()));
        }
        if self.agent.max_tool_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "agent.max_tool_rounds".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.llm.provider == LlmProvider::Azure && self.llm.effective_base_url().is_none() {
            return Err(ConfigError::MissingField("llm.base_url".to_string()));
        }
        Ok(())
    }
}
