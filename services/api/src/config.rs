use parley_core::{ReaperConfig, TurnTimings};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// The upstream realtime engines the service can talk to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

impl Provider {
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAI => "gpt-4o-realtime-preview-2024-10-01",
            Provider::Gemini => gemini_realtime::DEFAULT_MODEL,
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub realtime_model: String,
    pub system_instructions: Option<String>,
    pub idle_window: Duration,
    pub hard_timeout: Duration,
    pub session_ttl: Duration,
    pub reap_interval: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let provider_str =
            std::env::var("REALTIME_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "gemini" => Provider::Gemini,
            other => {
                return Err(ConfigError::InvalidValue(
                    "REALTIME_PROVIDER".to_string(),
                    format!("'{}' is not one of 'openai', 'gemini'", other),
                ));
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let realtime_model = std::env::var("REALTIME_MODEL")
            .unwrap_or_else(|_| provider.default_model().to_string());
        let system_instructions = std::env::var("SYSTEM_INSTRUCTIONS")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let idle_window = Duration::from_millis(parse_u64("IDLE_WINDOW_MS", 800)?);
        let hard_timeout = Duration::from_millis(parse_u64("HARD_TIMEOUT_MS", 15_000)?);
        let session_ttl = Duration::from_secs(parse_u64("SESSION_TTL_SECS", 300)?);
        let reap_interval = Duration::from_secs(parse_u64("REAP_INTERVAL_SECS", 30)?);
        if reap_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "REAP_INTERVAL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            bind_address,
            provider,
            openai_api_key,
            gemini_api_key,
            realtime_model,
            system_instructions,
            idle_window,
            hard_timeout,
            session_ttl,
            reap_interval,
            log_level,
        })
    }

    pub fn turn_timings(&self) -> TurnTimings {
        TurnTimings {
            idle_window: self.idle_window,
            hard_timeout: self.hard_timeout,
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: self.reap_interval,
            ttl: self.session_ttl,
        }
    }
}

fn parse_u64(var: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(var.to_string(), format!("'{}' is not a number", value))),
        Err(_) => Ok(default),
    }
}
