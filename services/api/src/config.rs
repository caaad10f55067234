use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tutor_core::EngineConfig;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub openai_api_key: String,
    pub openai_api_base: String,
    pub chat_model: String,
    /// Completion budget per model call.
    pub max_tokens: u32,
    pub temperature: f32,
    pub log_level: Level,
    /// Directory of `.md` prompt overrides; missing is fine.
    pub prompts_path: PathBuf,
    /// Curriculum document loaded into an empty database at startup.
    pub curriculum_seed_path: Option<PathBuf>,
    /// Seconds between inactivity sweeps.
    pub sweep_interval_seconds: u64,
    pub engine: EngineConfig,
}

/// Reads an optional variable, parsing it when present.
fn parse_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
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

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;
        let openai_api_base = std::env::var("OPENAI_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let max_tokens = parse_var("MODEL_MAX_TOKENS")?.unwrap_or(1000);
        let temperature = parse_var("MODEL_TEMPERATURE")?.unwrap_or(0.7);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));
        let curriculum_seed_path = std::env::var("CURRICULUM_SEED_PATH").ok().map(PathBuf::from);

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            retry_limit_for_yellow: parse_var("RETRY_LIMIT_FOR_YELLOW")?
                .unwrap_or(defaults.retry_limit_for_yellow),
            inactivity_timeout_seconds: parse_var("INACTIVITY_TIMEOUT_SECONDS")?
                .unwrap_or(defaults.inactivity_timeout_seconds),
            model_timeout_seconds: parse_var("MODEL_TIMEOUT_SECONDS")?
                .unwrap_or(defaults.model_timeout_seconds),
            max_model_retries: parse_var("MAX_MODEL_RETRIES")?
                .unwrap_or(defaults.max_model_retries),
            default_language: std::env::var("DEFAULT_LANGUAGE")
                .unwrap_or(defaults.default_language),
            model_retry_backoff_millis: parse_var("MODEL_RETRY_BACKOFF_MILLIS")?
                .unwrap_or(defaults.model_retry_backoff_millis),
            max_note_retries: parse_var("MAX_NOTE_RETRIES")?.unwrap_or(defaults.max_note_retries),
        };
        if engine.model_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "MODEL_TIMEOUT_SECONDS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let sweep_interval_seconds = parse_var("SWEEP_INTERVAL_SECONDS")?.unwrap_or(60);

        Ok(Self {
            bind_address,
            database_url,
            openai_api_key,
            openai_api_base,
            chat_model,
            max_tokens,
            temperature,
            log_level,
            prompts_path,
            curriculum_seed_path,
            sweep_interval_seconds,
            engine,
        })
    }
}
