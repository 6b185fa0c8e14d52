//! Configuration management for reviewloop
//!
//! Reads `config.toml` (per-language prompts, chunk size, model/provider).
//! Loaded once at startup and read-only afterwards; CLI flags for provider and
//! model are applied on top with [`Config::apply_overrides`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LOCAL_ENDPOINT: &str = "http://127.0.0.1:1234/v1/chat/completions";

const DEFAULT_REVIEW_PROMPT: &str = "You are a panel of senior reviewers covering correctness, \
testing, security, and resource handling. Review the code you are given. For each finding give \
the location, why it matters, a concrete recommendation, and a severity. Finish with the most \
important actions to take before merging. Answer in markdown.";

const DEFAULT_TEST_PROMPT: &str = "You write unit tests. Produce complete, runnable test files \
for the code you are given, using the language's standard test framework. Put each file in its \
own fenced code block and do not add prose inside the blocks.";

/// Which kind of model backend to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Managed chat-completion API (needs OPENAI_API_KEY)
    #[default]
    #[serde(alias = "openai")]
    #[value(alias = "openai")]
    Hosted,
    /// OpenAI-compatible server on this machine (LM Studio and friends)
    #[serde(alias = "lmstudio")]
    #[value(alias = "lmstudio")]
    Local,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Hosted => "hosted",
            Provider::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    /// File suffix including the dot, e.g. `.go`
    pub extension: String,
    pub review_prompt: String,
    pub test_prompt: String,
}

impl LanguageConfig {
    pub fn review_prompt(&self) -> &str {
        non_empty_or(&self.review_prompt, DEFAULT_REVIEW_PROMPT)
    }

    pub fn test_prompt(&self) -> &str {
        non_empty_or(&self.test_prompt, DEFAULT_TEST_PROMPT)
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default model for the hosted provider
    pub model: String,
    /// Lines per chunk
    pub chunk_size: usize,
    pub llm_provider: Provider,
    /// Model name override; wins over `model` when set
    pub llm_model: String,
    pub languages: BTreeMap<String, LanguageConfig>,
    /// Output token budget per request
    pub max_tokens: u32,
    pub local_endpoint: String,
    /// Attempts per backend call inside one chunk attempt
    pub request_retries: u32,
    /// Fixed delay between chunk-level attempts
    pub retry_delay_secs: u64,
    pub test_timeout_secs: u64,
    /// If non-empty, the local provider only accepts these model names
    pub allowed_local_models: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            chunk_size: 200,
            llm_provider: Provider::Hosted,
            llm_model: String::new(),
            languages: BTreeMap::new(),
            max_tokens: 2048,
            local_endpoint: DEFAULT_LOCAL_ENDPOINT.to_string(),
            request_retries: 3,
            retry_delay_secs: 2,
            test_timeout_secs: 600,
            allowed_local_models: Vec::new(),
        }
    }
}

impl Config {
    /// Per-user fallback location, used when the given path doesn't exist.
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("reviewloop").join("config.toml"))
    }

    /// Pick the file to load: `path` if it exists, else the per-user config.
    pub fn resolve_path(path: &Path) -> PathBuf {
        if path.exists() {
            return path.to_path_buf();
        }
        match Self::user_config_path() {
            Some(user) if user.exists() => user,
            _ => path.to_path_buf(),
        }
    }

    /// Load and validate the config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be at least 1");
        }
        if self.languages.is_empty() {
            bail!("no [languages.*] tables configured");
        }
        for (name, lang) in &self.languages {
            if lang.extension.trim().is_empty() {
                bail!("language '{}' has an empty extension", name);
            }
        }
        Ok(())
    }

    /// Apply CLI overrides. Empty strings count as "not given".
    pub fn apply_overrides(&mut self, provider: Option<Provider>, model: Option<&str>) {
        if let Some(provider) = provider {
            self.llm_provider = provider;
        }
        if let Some(model) = model.filter(|m| !m.trim().is_empty()) {
            self.llm_model = model.to_string();
        }
    }

    /// Model name actually sent to the backend.
    pub fn effective_model(&self) -> &str {
        non_empty_or(&self.llm_model, &self.model)
    }

    /// Reject local models outside the configured allow-list.
    pub fn check_local_model(&self) -> Result<()> {
        if self.llm_provider != Provider::Local || self.allowed_local_models.is_empty() {
            return Ok(());
        }
        let model = self.effective_model();
        if !self.allowed_local_models.iter().any(|m| m == model) {
            bail!(
                "Invalid local model: {} (allowed: {})",
                model,
                self.allowed_local_models.join(", ")
            );
        }
        Ok(())
    }

    pub fn language(&self, name: &str) -> Option<&LanguageConfig> {
        self.languages.get(name)
    }

    /// Language whose extension the path ends with.
    pub fn language_for_path(&self, path: &Path) -> Option<&str> {
        let name = path.to_string_lossy();
        self.languages
            .iter()
            .find(|(_, lang)| name.ends_with(lang.extension.as_str()))
            .map(|(id, _)| id.as_str())
    }

    pub fn language_names(&self) -> Vec<&str> {
        self.languages.keys().map(String::as_str).collect()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}
