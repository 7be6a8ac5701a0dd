//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.qna/config.json`) and environment.

use crate::questions::{AdmissionPolicy, DEFAULT_MAX_CONCURRENT, DEFAULT_SHARDS};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Channel settings (e.g. Telegram).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Question manager limits.
    #[serde(default)]
    pub questions: QuestionsConfig,
}

/// Per-channel config (e.g. Telegram bot token).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
}

/// Question manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionsConfig {
    /// Max questions running at once (default 64, minimum 1).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// "block" (default): asking waits for a free slot. "reject": asking fails when full.
    #[serde(default)]
    pub admission: AdmissionPolicy,

    /// Registry lock shards (default 16). 1 = a single lock over all pending questions.
    #[serde(default = "default_registry_shards")]
    pub registry_shards: usize,

    /// How long the bundled bot flows wait for each answer (default 300s).
    #[serde(default = "default_answer_timeout_secs")]
    pub answer_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_registry_shards() -> usize {
    DEFAULT_SHARDS
}

fn default_answer_timeout_secs() -> u64 {
    300
}

impl Default for QuestionsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            admission: AdmissionPolicy::default(),
            registry_shards: default_registry_shards(),
            answer_timeout_secs: default_answer_timeout_secs(),
        }
    }
}

impl QuestionsConfig {
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs.max(1))
    }
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    non_empty(std::env::var("TELEGRAM_BOT_TOKEN").ok()).or_else(|| {
        non_empty(config.channels.telegram.bot_token.clone())
    })
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("QNA_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".qna").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (or QNA_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        parse_config(&s).with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn parse_config(s: &str) -> Result<Config> {
    Ok(serde_json::from_str(s)?)
}
