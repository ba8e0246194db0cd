//! Retrying LLM analysis client.
//!
//! ## Attempt loop
//!
//! - Attempt 1 uses the schema-description prompt, every later attempt the strict
//!   template prompt.
//! - Up to `max_retries + 1` attempts, `retry_delay` apart.
//! - Per attempt: generate → parse JSON object → validate.
//! - A provider error coded `insufficient_quota` aborts immediately; everything
//!   else (timeouts included) is retried.
//!
//! Every attempt is recorded as `(prompt, output, error)` and returned on both
//! success and failure.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{Instrument, info, info_span, warn};

use crate::prompt::{build_prompt, build_retry_prompt};
use crate::provider::{LlmProvider, ProviderError};
use crate::result::{AnalysisResult, parse_analysis_json};

const OUTPUT_SNIPPET_CHARS: usize = 200;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    /// Per-call generate timeout
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl LlmClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// One generate-and-validate attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LlmAttempt {
    pub prompt: String,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Successful analysis plus the attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRun {
    pub result: AnalysisResult,
    pub attempts: Vec<LlmAttempt>,
}

/// Analysis failure. Both variants carry the complete ordered attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("LLM analysis failed: provider quota exhausted after {} attempt(s)", .attempts.len())]
    QuotaExhausted { attempts: Vec<LlmAttempt> },

    #[error("LLM analysis failed after {} attempt(s)", .attempts.len())]
    RetriesExhausted { attempts: Vec<LlmAttempt> },
}

impl AnalysisError {
    pub fn attempts(&self) -> &[LlmAttempt] {
        match self {
            AnalysisError::QuotaExhausted { attempts }
            | AnalysisError::RetriesExhausted { attempts } => attempts,
        }
    }

    pub fn into_attempts(self) -> Vec<LlmAttempt> {
        match self {
            AnalysisError::QuotaExhausted { attempts }
            | AnalysisError::RetriesExhausted { attempts } => attempts,
        }
    }

    /// Error of the final attempt, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.attempts().last().and_then(|a| a.error.as_deref())
    }
}

/// LLM analysis client bound to one provider.
///
/// Each `analyze` call opens an `llm_client` span under the caller's current span.
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    config: LlmClientConfig,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("provider", &self.provider.name())
            .field("model", &self.provider.model())
            .field("config", &self.config)
            .finish()
    }
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>, config: LlmClientConfig) -> Self {
        Self { provider, config }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn config(&self) -> &LlmClientConfig {
        &self.config
    }

    /// Analyze `input_text`, retrying on malformed output or provider failures.
    pub async fn analyze(&self, input_text: &str) -> Result<AnalysisRun, AnalysisError> {
        let span = info_span!(
            "llm_client",
            provider = %self.provider.name(),
            model = %self.provider.model()
        );
        self.run_attempts(input_text).instrument(span).await
    }

    async fn run_attempts(&self, input_text: &str) -> Result<AnalysisRun, AnalysisError> {
        let first_prompt = build_prompt(input_text);
        let retry_prompt = build_retry_prompt(input_text);
        let mut attempts: Vec<LlmAttempt> = Vec::new();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 && !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let number = attempt + 1;
            let prompt = if attempt == 0 {
                &first_prompt
            } else {
                &retry_prompt
            };

            info!(attempt = number, "llm attempt");

            let output = match self.generate(prompt).await {
                Ok(output) => output,
                Err(err) => {
                    let error = err.audit_string();
                    warn!(attempt = number, error = %error, "llm attempt failed");
                    attempts.push(LlmAttempt {
                        prompt: prompt.clone(),
                        output: None,
                        error: Some(error),
                    });

                    if err.is_quota_exhausted() {
                        return Err(AnalysisError::QuotaExhausted { attempts });
                    }
                    continue;
                }
            };

            match parse_analysis_json(&output) {
                Ok(result) => {
                    attempts.push(LlmAttempt {
                        prompt: prompt.clone(),
                        output: Some(output),
                        error: None,
                    });
                    info!(attempt = number, "llm attempt succeeded");
                    return Ok(AnalysisRun { result, attempts });
                }
                Err(err) => {
                    let error = err.to_string();
                    warn!(
                        attempt = number,
                        error = %error,
                        output_snippet = %snippet(&output),
                        "llm attempt failed"
                    );
                    attempts.push(LlmAttempt {
                        prompt: prompt.clone(),
                        output: Some(output),
                        error: Some(error),
                    });
                }
            }
        }

        Err(AnalysisError::RetriesExhausted { attempts })
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.provider.generate(prompt, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(timeout)),
        }
    }
}

fn snippet(output: &str) -> String {
    output.chars().take(OUTPUT_SNIPPET_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::result::Sentiment;

    const GOOD: &str = r#"{"tickers":["AAPL"],"sentiment":"positive","confidence":0.9,"reasoning_summary":"Strong product demand."}"#;

    enum Reply {
        Text(&'static str),
        Fail(ProviderError),
        Hang,
    }

    struct FakeProvider {
        replies: Mutex<VecDeque<Reply>>,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn model(&self) -> &str {
            "fake-model"
        }

        async fn generate(&self, prompt: &str, _timeout: Duration) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Text(text)) => Ok(text.to_string()),
                Some(Reply::Fail(err)) => Err(err),
                Some(Reply::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(GOOD.to_string())
                }
                None => Err(ProviderError::new("no scripted reply")),
            }
        }
    }

    fn client(provider: Arc<FakeProvider>, max_retries: u32) -> LlmClient {
        LlmClient::new(
            provider,
            LlmClientConfig::default()
                .with_max_retries(max_retries)
                .with_retry_delay(Duration::ZERO)
                .with_timeout(Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn valid_first_output_succeeds_in_one_attempt() {
        let provider = FakeProvider::new(vec![Reply::Text(GOOD)]);
        let run = client(provider.clone(), 0).analyze("Title: Example").await.unwrap();

        assert_eq!(run.result.tickers, vec!["AAPL"]);
        assert_eq!(run.result.sentiment, Sentiment::Positive);
        assert_eq!(run.attempts.len(), 1);
        assert_eq!(run.attempts[0].prompt, build_prompt("Title: Example"));
        assert_eq!(run.attempts[0].output.as_deref(), Some(GOOD));
        assert_eq!(run.attempts[0].error, None);
    }

    #[tokio::test]
    async fn invalid_json_then_valid_output_takes_two_attempts() {
        let good = r#"{"tickers":[],"sentiment":"neutral","confidence":0.5,"reasoning_summary":"No clear impact."}"#;
        let provider = FakeProvider::new(vec![Reply::Text("not-json"), Reply::Text(good)]);
        let run = client(provider, 1).analyze("Title: Example").await.unwrap();

        assert_eq!(run.result.sentiment, Sentiment::Neutral);
        assert_eq!(run.attempts.len(), 2);
        assert_eq!(run.attempts[0].output.as_deref(), Some("not-json"));
        assert!(run.attempts[0].error.as_deref().unwrap().starts_with("invalid json"));
        assert_eq!(run.attempts[1].prompt, build_retry_prompt("Title: Example"));
        assert_eq!(run.attempts[1].error, None);
    }

    #[tokio::test]
    async fn schema_violation_is_retried() {
        let bad = r#"{"tickers":["AAPL"],"sentiment":"positive","confidence":2,"reasoning_summary":"bad"}"#;
        let good = r#"{"tickers":["AAPL"],"sentiment":"positive","confidence":0.7,"reasoning_summary":"ok"}"#;
        let provider = FakeProvider::new(vec![Reply::Text(bad), Reply::Text(good)]);
        let run = client(provider, 1).analyze("Title: Example").await.unwrap();

        assert!((run.result.confidence - 0.7).abs() < f64::EPSILON);
        assert_eq!(run.attempts.len(), 2);
    }

    #[tokio::test]
    async fn quota_exhaustion_aborts_without_retrying() {
        let provider = FakeProvider::new(vec![
            Reply::Fail(ProviderError::quota_exhausted("out of credits")),
            Reply::Text(GOOD),
        ]);
        let err = client(provider.clone(), 3)
            .analyze("Title: Example")
            .await
            .unwrap_err();

        assert!(matches!(err, AnalysisError::QuotaExhausted { .. }));
        assert_eq!(provider.calls(), 1);
        assert_eq!(
            err.attempts(),
            &[LlmAttempt {
                prompt: build_prompt("Title: Example"),
                output: None,
                error: Some("provider_error:insufficient_quota:out of credits".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn other_provider_errors_are_retried() {
        let provider = FakeProvider::new(vec![
            Reply::Fail(ProviderError::with_code("rate limited", "rate_limit")),
            Reply::Text(GOOD),
        ]);
        let run = client(provider, 1).analyze("x").await.unwrap();

        assert_eq!(run.attempts.len(), 2);
        assert_eq!(
            run.attempts[0].error.as_deref(),
            Some("provider_error:rate_limit:rate limited")
        );
    }

    #[tokio::test]
    async fn exhausting_attempts_returns_verbatim_history() {
        let provider = FakeProvider::new(vec![
            Reply::Text("not-json"),
            Reply::Fail(ProviderError::new("boom")),
            Reply::Text("[]"),
        ]);
        let err = client(provider.clone(), 2).analyze("news").await.unwrap_err();

        assert!(matches!(err, AnalysisError::RetriesExhausted { .. }));
        assert_eq!(provider.calls(), 3);

        let attempts = err.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].prompt, build_prompt("news"));
        assert_eq!(attempts[1].prompt, build_retry_prompt("news"));
        assert_eq!(attempts[2].prompt, build_retry_prompt("news"));
        assert_eq!(attempts[1].output, None);
        assert_eq!(attempts[1].error.as_deref(), Some("provider_error:boom"));
        assert_eq!(attempts[2].output.as_deref(), Some("[]"));
        assert_eq!(err.last_error(), Some("JSON root must be an object"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_times_out_and_is_retried() {
        let provider = FakeProvider::new(vec![Reply::Hang, Reply::Text(GOOD)]);
        let run = client(provider, 1).analyze("x").await.unwrap();

        assert_eq!(run.attempts.len(), 2);
        let error = run.attempts[0].error.as_deref().unwrap();
        assert!(error.starts_with("provider_error:timeout:"));
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_spaced_by_retry_delay() {
        let provider = FakeProvider::new(vec![Reply::Text("nope"), Reply::Text(GOOD)]);
        let client = LlmClient::new(
            provider,
            LlmClientConfig::default()
                .with_max_retries(1)
                .with_retry_delay(Duration::from_secs(2)),
        );

        let started = tokio::time::Instant::now();
        client.analyze("x").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
