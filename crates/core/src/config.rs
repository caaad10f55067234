//! Engine configuration.
//!
//! These are the teaching parameters the session engine consumes. Loading them
//! (from the environment, a file, or a dashboard) is the host's job.

use crate::llm_client::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const fn default_retry_limit_for_yellow() -> u32 {
    2
}

const fn default_inactivity_timeout_seconds() -> u64 {
    1800
}

const fn default_model_timeout_seconds() -> u64 {
    30
}

const fn default_max_model_retries() -> u32 {
    3
}

const fn default_model_retry_backoff_millis() -> u64 {
    500
}

const fn default_max_note_retries() -> u32 {
    3
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Assessment attempts a Yellow verdict may loop back for before the
    /// subtopic is completed with a review flag.
    #[serde(default = "default_retry_limit_for_yellow")]
    pub retry_limit_for_yellow: u32,
    #[serde(default = "default_inactivity_timeout_seconds")]
    pub inactivity_timeout_seconds: u64,
    #[serde(default = "default_model_timeout_seconds")]
    pub model_timeout_seconds: u64,
    /// Additional attempts after the first failed model call.
    #[serde(default = "default_max_model_retries")]
    pub max_model_retries: u32,
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default = "default_model_retry_backoff_millis")]
    pub model_retry_backoff_millis: u64,
    #[serde(default = "default_max_note_retries")]
    pub max_note_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_limit_for_yellow: default_retry_limit_for_yellow(),
            inactivity_timeout_seconds: default_inactivity_timeout_seconds(),
            model_timeout_seconds: default_model_timeout_seconds(),
            max_model_retries: default_max_model_retries(),
            default_language: default_language(),
            model_retry_backoff_millis: default_model_retry_backoff_millis(),
            max_note_retries: default_max_note_retries(),
        }
    }
}

impl EngineConfig {
    pub fn inactivity_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inactivity_timeout_seconds as i64)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.model_retry_backoff_millis)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.model_timeout(),
            max_retries: self.max_model_retries,
            backoff: self.retry_backoff(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.retry_limit_for_yellow, 2);
        assert_eq!(config.default_language, "en");
        assert_eq!(config.model_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_camel_case_fields() {
        let json = r#"{
            "retryLimitForYellow": 4,
            "inactivityTimeoutSeconds": 60,
            "modelTimeoutSeconds": 5,
            "maxModelRetries": 1,
            "defaultLanguage": "de"
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.retry_limit_for_yellow, 4);
        assert_eq!(config.inactivity_timeout(), chrono::Duration::seconds(60));
        assert_eq!(config.max_model_retries, 1);
        assert_eq!(config.default_language, "de");
        assert_eq!(config.max_note_retries, 3);
    }
}
