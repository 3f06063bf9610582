use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teloxide::types::{ChatId, UserId};

use crate::solver::RetryPolicy;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// A secret is missing or still set to a placeholder.
    MissingSecret(&'static str),
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::MissingSecret(field) => {
                write!(f, "{field} is missing or still set to a placeholder value")
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::MissingSecret(_) | Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    telegram_bot_token: String,
    /// Key for the chat completions endpoint.
    #[serde(default)]
    llm_api_key: String,
    /// The only chat where /solve is answered.
    allowed_chat_id: i64,
    /// How the allowed chat is named in replies, e.g. "#question-ai".
    #[serde(default = "default_channel_label")]
    channel_label: String,
    #[serde(default = "default_bot_name")]
    bot_name: String,
    #[serde(default = "default_llm_api_url")]
    llm_api_url: String,
    #[serde(default = "default_text_model")]
    text_model: String,
    /// Used instead of `text_model` when the question carries an image.
    #[serde(default = "default_vision_model")]
    vision_model: String,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(default = "default_rate_limit_requests")]
    rate_limit_requests: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    rate_limit_window_secs: u64,
    /// Admin title that grants unlimited requests (case-insensitive).
    #[serde(default = "default_moderator_role")]
    moderator_role: String,
    /// Users with unlimited requests regardless of title.
    #[serde(default)]
    moderator_ids: Vec<u64>,
    #[serde(default = "default_supported_extensions")]
    supported_extensions: Vec<String>,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    backoff_base_ms: u64,
    #[serde(default = "default_download_timeout_secs")]
    download_timeout_secs: u64,
    #[serde(default = "default_model_timeout_secs")]
    model_timeout_secs: u64,
    #[serde(default = "default_preview_max_chars")]
    preview_max_chars: usize,
    #[serde(default = "default_tesseract_path")]
    tesseract_path: String,
    #[serde(default = "default_ocr_language")]
    ocr_language: String,
    /// How often idle users are dropped from the rate limiter (0 = never).
    #[serde(default = "default_sweep_interval_secs")]
    sweep_interval_secs: u64,
    log_chat_id: Option<i64>,
    /// Provider quota for the text model, listed in `/info`.
    provider_limits: Option<ProviderLimits>,
    /// Directory for log files. Defaults to current directory.
    data_dir: Option<String>,
}

/// Request and token quotas the model provider enforces on our account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderLimits {
    #[serde(default = "default_provider_name")]
    pub provider: String,
    pub model: String,
    pub rpm: u32,
    pub rpd: u32,
    pub tpm: u32,
    pub tpd: u32,
}

fn default_provider_name() -> String {
    "Groq (Free plan)".to_string()
}

fn default_channel_label() -> String {
    "the question channel".to_string()
}

fn default_bot_name() -> String {
    "Solvebot".to_string()
}

fn default_llm_api_url() -> String {
    "https://api.groq.com/openai/v1/chat/completions".to_string()
}

fn default_text_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_vision_model() -> String {
    "meta-llama/llama-4-scout-17b-16e-instruct".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    500
}

fn default_rate_limit_requests() -> u32 {
    10
}

fn default_rate_limit_window_secs() -> u64 {
    3600
}

fn default_moderator_role() -> String {
    "MOD".to_string()
}

fn default_supported_extensions() -> Vec<String> {
    [".png", ".jpg", ".jpeg", ".webp"].map(String::from).to_vec()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_model_timeout_secs() -> u64 {
    60
}

fn default_preview_max_chars() -> usize {
    512
}

fn default_tesseract_path() -> String {
    "/usr/bin/tesseract".to_string()
}

fn default_ocr_language() -> String {
    "eng".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    600
}

pub struct Config {
    pub telegram_bot_token: String,
    pub llm_api_key: String,
    pub allowed_chat_id: ChatId,
    pub channel_label: String,
    pub bot_name: String,
    pub llm_api_url: String,
    pub text_model: String,
    pub vision_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub moderator_role: String,
    pub moderator_ids: HashSet<UserId>,
    /// Lowercase, each with a leading dot.
    pub supported_extensions: Vec<String>,
    pub retry: RetryPolicy,
    pub download_timeout: Duration,
    pub model_timeout: Duration,
    pub preview_max_chars: usize,
    pub tesseract_path: PathBuf,
    pub ocr_language: String,
    /// `None` disables the sweep.
    pub sweep_interval: Option<Duration>,
    pub log_chat_id: Option<ChatId>,
    pub provider_limits: Option<ProviderLimits>,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if is_placeholder(&file.llm_api_key) {
            return Err(ConfigError::MissingSecret("llm_api_key"));
        }
        if is_placeholder(&file.telegram_bot_token) {
            return Err(ConfigError::MissingSecret("telegram_bot_token"));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }

        if file.rate_limit_requests == 0 {
            return Err(ConfigError::Validation("rate_limit_requests must be at least 1".into()));
        }
        if file.rate_limit_window_secs == 0 {
            return Err(ConfigError::Validation("rate_limit_window_secs must be positive".into()));
        }
        if file.preview_max_chars < 4 {
            return Err(ConfigError::Validation("preview_max_chars must be at least 4".into()));
        }

        let supported_extensions: Vec<String> = file
            .supported_extensions
            .iter()
            .map(|ext| format!(".{}", ext.trim().trim_start_matches('.').to_lowercase()))
            .filter(|ext| ext.len() > 1)
            .collect();
        if supported_extensions.is_empty() {
            return Err(ConfigError::Validation("supported_extensions must not be empty".into()));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            llm_api_key: file.llm_api_key,
            allowed_chat_id: ChatId(file.allowed_chat_id),
            channel_label: file.channel_label,
            bot_name: file.bot_name,
            llm_api_url: file.llm_api_url,
            text_model: file.text_model,
            vision_model: file.vision_model,
            temperature: file.temperature,
            max_tokens: file.max_tokens,
            rate_limit_requests: file.rate_limit_requests,
            rate_limit_window: Duration::from_secs(file.rate_limit_window_secs),
            moderator_role: file.moderator_role,
            moderator_ids: file.moderator_ids.into_iter().map(UserId).collect(),
            supported_extensions,
            retry: RetryPolicy::new(file.max_attempts, Duration::from_millis(file.backoff_base_ms)),
            download_timeout: Duration::from_secs(file.download_timeout_secs),
            model_timeout: Duration::from_secs(file.model_timeout_secs),
            preview_max_chars: file.preview_max_chars,
            tesseract_path: PathBuf::from(file.tesseract_path),
            ocr_language: file.ocr_language,
            sweep_interval: (file.sweep_interval_secs > 0)
                .then(|| Duration::from_secs(file.sweep_interval_secs)),
            log_chat_id: file.log_chat_id.map(ChatId),
            provider_limits: file.provider_limits,
            data_dir,
        })
    }

    pub fn is_moderator_id(&self, user_id: UserId) -> bool {
        self.moderator_ids.contains(&user_id)
    }

    /// Whether an admin title names the moderator role.
    pub fn is_moderator_title(&self, title: &str) -> bool {
        title.trim().eq_ignore_ascii_case(&self.moderator_role)
    }
}

/// Empty, or left at a template value like `YOUR_API_KEY` or `<token>`.
fn is_placeholder(secret: &str) -> bool {
    let secret = secret.trim();
    let lower = secret.to_lowercase();
    secret.is_empty()
        || lower.starts_with("your_")
        || lower.starts_with("your-")
        || lower == "changeme"
        || lower == "placeholder"
        || (secret.starts_with('<') && secret.ends_with('>'))
}
