use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

use crate::audit::DEFAULT_LOG_CAP;
use crate::doc_processor::IngestLimits;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

/// Service configuration.
///
/// Sources, lowest precedence first: built-in defaults, `~/.chat-box/config`,
/// then `CHAT_BOX__*` environment variables. The conventional
/// `OPENAI_API_KEY` and `ANTHROPIC_API_KEY` variables seed the key defaults.
#[derive(Debug, Deserialize, Validate, Clone)]
pub struct Config {
    #[validate(range(min = 1))]
    pub server_port: u16,

    /// Directory holding `chat-box.db`.
    pub data_dir: PathBuf,

    pub log_level: String,

    pub openai_api_key: String,
    pub openai_base_url: String,
    pub claude_api_key: String,
    pub claude_base_url: String,

    pub default_model: String,
    #[validate(range(min = 0.0, max = 1.0))]
    pub default_temperature: f32,

    /// Ceiling on response length, applied to every backend.
    #[validate(range(min = 1, max = 200000))]
    pub max_response_tokens: u32,

    /// Abort a provider stream that runs longer than this. Unset means no limit.
    pub request_timeout_secs: Option<u64>,

    #[validate(range(min = 1))]
    pub audit_log_cap: usize,

    #[validate(range(min = 1))]
    pub max_upload_bytes: u64,
    #[validate(range(min = 1))]
    pub soft_content_cap: usize,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let defaults = IngestLimits::default();

        let settings = config::Config::builder()
            .set_default("server_port", 3000)?
            .set_default("data_dir", format!("{}/.chat-box", home))?
            .set_default("log_level", "info")?
            .set_default(
                "openai_api_key",
                std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            )?
            .set_default("openai_base_url", "https://api.openai.com/v1")?
            .set_default(
                "claude_api_key",
                std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            )?
            .set_default("claude_base_url", "https://api.anthropic.com")?
            .set_default("default_model", "gpt-3.5-turbo")?
            .set_default("default_temperature", 0.7)?
            .set_default("max_response_tokens", crate::llm::DEFAULT_MAX_TOKENS as i64)?
            .set_default("audit_log_cap", DEFAULT_LOG_CAP as i64)?
            .set_default("max_upload_bytes", defaults.max_file_bytes as i64)?
            .set_default("soft_content_cap", defaults.soft_content_cap as i64)?
            .add_source(
                config::File::with_name(&format!("{}/.chat-box/config", home)).required(false),
            )
            // CHAT_BOX__SERVER_PORT, CHAT_BOX__OPENAI_API_KEY, ...
            .add_source(config::Environment::with_prefix("CHAT_BOX").separator("__"))
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn ingest_limits(&self) -> IngestLimits {
        IngestLimits {
            max_file_bytes: self.max_upload_bytes,
            soft_content_cap: self.soft_content_cap,
            ..IngestLimits::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let limits = IngestLimits::default();
        Self {
            server_port: 3000,
            data_dir: PathBuf::from(".chat-box"),
            log_level: "info".to_string(),
            openai_api_key: String::new(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            claude_api_key: String::new(),
            claude_base_url: "https://api.anthropic.com".to_string(),
            default_model: "gpt-3.5-turbo".to_string(),
            default_temperature: 0.7,
            max_response_tokens: crate::llm::DEFAULT_MAX_TOKENS,
            request_timeout_secs: None,
            audit_log_cap: DEFAULT_LOG_CAP,
            max_upload_bytes: limits.max_file_bytes,
            soft_content_cap: limits.soft_content_cap,
        }
    }
}
