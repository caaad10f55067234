//! Language Model Client
//!
//! The engine treats text completion as an external capability: a prompt goes
//! in, text comes out. [`LanguageModel`] is that seam; [`OpenAICompatibleClient`]
//! implements it for any OpenAI-compatible chat endpoint, and
//! [`complete_with_retry`] adds the bounded timeout and backoff every engine
//! call goes through.

use crate::error::{Result as TutorResult, TutorError};
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// One completion request. Everything the model needs, student text
/// included, is rendered into the instruction block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
}

impl Prompt {
    pub fn system(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
        }
    }
}

/// A text-completion capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: Prompt) -> Result<String>;
}

/// An implementation of `LanguageModel` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o-mini").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            max_tokens: 1000,
            temperature: 0.7,
        }
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl LanguageModel for OpenAICompatibleClient {
    async fn complete(&self, prompt: Prompt) -> Result<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(prompt.system)
                .build()?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .max_completion_tokens(self.max_tokens)
            .temperature(self.temperature)
            .build()?;

        let response = self.client.chat().create(request).await?;

        let answer = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .clone()
            .context("No content in LLM response")?;
        Ok(answer)
    }
}

/// Timeout and retry budget for one logical model call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Attempts after the first one.
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Exponential backoff with up to 25% jitter.
    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff.saturating_mul(2u32.saturating_pow(retry));
        let jitter = base.mul_f64(rand::random::<f64>() * 0.25);
        base + jitter
    }
}

/// Calls the model with a per-attempt timeout, retrying failures and empty
/// replies with backoff. Exhaustion surfaces as `LanguageModelUnavailable`.
pub async fn complete_with_retry(
    model: &dyn LanguageModel,
    prompt: &Prompt,
    policy: &RetryPolicy,
) -> TutorResult<String> {
    let attempts = policy.max_retries + 1;
    let mut last_error = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = policy.delay_for(attempt - 1);
            debug!(attempt, ?delay, "Backing off before retrying model call");
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(policy.timeout, model.complete(prompt.clone())).await {
            Ok(Ok(text)) if !text.trim().is_empty() => return Ok(text),
            Ok(Ok(_)) => last_error = "empty completion".to_string(),
            Ok(Err(e)) => last_error = format!("{e:#}"),
            Err(_) => last_error = format!("timed out after {:?}", policy.timeout),
        }
        warn!(attempt = attempt + 1, of = attempts, error = %last_error, "Model call failed");
    }

    Err(TutorError::LanguageModelUnavailable {
        attempts,
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(5),
            max_retries,
            backoff: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let mut mock = MockLanguageModel::new();
        let calls = AtomicU32::new(0);
        mock.expect_complete().times(3).returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("503 service unavailable"))
            } else {
                Ok("Hello there".to_string())
            }
        });

        let reply = complete_with_retry(&mock, &Prompt::system("hi"), &policy(3))
            .await
            .unwrap();
        assert_eq!(reply, "Hello there");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_unavailable() {
        let mut mock = MockLanguageModel::new();
        mock.expect_complete()
            .times(3)
            .returning(|_| Err(anyhow!("connection refused")));

        let err = complete_with_retry(&mock, &Prompt::system("hi"), &policy(2))
            .await
            .unwrap_err();
        match err {
            TutorError::LanguageModelUnavailable { attempts, message } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_replies_are_retried() {
        let mut mock = MockLanguageModel::new();
        mock.expect_complete()
            .times(2)
            .returning(|_| Ok("   ".to_string()));

        let err = complete_with_retry(&mock, &Prompt::system("hi"), &policy(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::LanguageModelUnavailable { .. }));
    }

    struct SlowModel;

    #[async_trait]
    impl LanguageModel for SlowModel {
        async fn complete(&self, _prompt: Prompt) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_count_as_failures() {
        let err = complete_with_retry(&SlowModel, &Prompt::system("hi"), &policy(1))
            .await
            .unwrap_err();
        match err {
            TutorError::LanguageModelUnavailable { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let p = policy(3);
        let first = p.delay_for(0);
        let third = p.delay_for(2);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
    }
}
