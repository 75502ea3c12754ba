use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::profile::{Gender, ProfileDraft};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_asr_url")]
    pub asr_url: String,
    #[serde(default = "default_cuid")]
    pub cuid: String,
    #[serde(default = "default_audio_format")]
    pub format: String,
    #[serde(default = "default_sample_rate")]
    pub rate: u32,
    #[serde(default = "default_dev_pid")]
    pub dev_pid: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_token_url() -> String {
    "https://aip.baidubce.com/oauth/2.0/token".to_string()
}

fn default_asr_url() -> String {
    "https://vop.baidu.com/pro_api".to_string()
}

fn default_cuid() -> String {
    "confidant".to_string()
}

fn default_audio_format() -> String {
    "wav".to_string()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_dev_pid() -> u32 {
    80001
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            token_url: default_token_url(),
            asr_url: default_asr_url(),
            cuid: default_cuid(),
            format: default_audio_format(),
            rate: default_sample_rate(),
            dev_pid: default_dev_pid(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Persona used by the headless driver when no profile has been saved yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub name: String,
    pub gender: String,
    #[serde(default)]
    pub personality: Option<String>,
    #[serde(default)]
    pub horoscope: Option<String>,
}

impl PersonaConfig {
    pub fn to_draft(&self) -> ProfileDraft {
        ProfileDraft {
            name: self.name.clone(),
            gender: Gender::parse(&self.gender),
            personality: self.personality.clone(),
            horoscope: self.horoscope.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionConfig {
    // Chat completion (OpenAI-compatible: DeepSeek, OpenAI, Ollama, ...)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Proactive notifications
    #[serde(default = "default_proactive_min_interval_hours")]
    pub proactive_min_interval_hours: u64,
    #[serde(default = "default_proactive_max_interval_hours")]
    pub proactive_max_interval_hours: u64,
    #[serde(default = "default_notification_title")]
    pub notification_title: String,
    #[serde(default = "default_notification_body")]
    pub notification_body: String,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub persona: Option<PersonaConfig>,
}

fn default_llm_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    500
}

fn default_context_window() -> usize {
    crate::context::DEFAULT_CONTEXT_WINDOW
}

fn default_database_path() -> String {
    "confidant.db".to_string()
}

fn default_proactive_min_interval_hours() -> u64 {
    4
}

fn default_proactive_max_interval_hours() -> u64 {
    12
}

fn default_notification_title() -> String {
    "New message from your AI friend".to_string()
}

fn default_notification_body() -> String {
    "Tap to view the message".to_string()
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_timeout_secs: default_request_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            context_window: default_context_window(),
            database_path: default_database_path(),
            proactive_min_interval_hours: default_proactive_min_interval_hours(),
            proactive_max_interval_hours: default_proactive_max_interval_hours(),
            notification_title: default_notification_title(),
            notification_body: default_notification_body(),
            speech: SpeechConfig::default(),
            persona: None,
        }
    }
}

impl CompanionConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("confidant_config.toml")
    }

    /// Load config from confidant_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<CompanionConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults overlaid with environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Some(seconds) = env_parse("LLM_TIMEOUT_SECS") {
            config.llm_timeout_secs = seconds;
        }

        if let Ok(path) = env::var("CONFIDANT_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Some(hours) = env_parse("CONFIDANT_PROACTIVE_MIN_HOURS") {
            config.proactive_min_interval_hours = hours;
        }

        if let Some(hours) = env_parse("CONFIDANT_PROACTIVE_MAX_HOURS") {
            config.proactive_max_interval_hours = hours;
        }

        if let Ok(key) = env::var("SPEECH_API_KEY") {
            config.speech.api_key = key;
        }

        if let Ok(secret) = env::var("SPEECH_SECRET_KEY") {
            config.speech.secret_key = secret;
        }

        if let Ok(cuid) = env::var("SPEECH_CUID") {
            config.speech.cuid = cuid;
        }

        config
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs.max(1))
    }

    pub fn proactive_min_interval(&self) -> Duration {
        Duration::from_secs(self.proactive_min_interval_hours * 60 * 60)
    }

    pub fn proactive_max_interval(&self) -> Duration {
        Duration::from_secs(self.proactive_max_interval_hours * 60 * 60)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}
