use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Instrument, info, info_span, warn};

use newsflow_ai::{AnalysisError, AnalysisResult, LlmAttempt, LlmClient};
use newsflow_core::{NewsEvent, NewsEventId, TraceId};

use crate::news_store::NewsEventStore;

/// Outcome of analysing one news event.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisReport {
    Succeeded {
        result: AnalysisResult,
        attempts: Vec<LlmAttempt>,
    },
    Failed {
        error_message: String,
        attempts: Vec<LlmAttempt>,
    },
    NotFound,
}

impl AnalysisReport {
    pub fn status(&self) -> &'static str {
        match self {
            AnalysisReport::Succeeded { .. } => "succeeded",
            AnalysisReport::Failed { .. } => "failed",
            AnalysisReport::NotFound => "not_found",
        }
    }

    pub fn attempts(&self) -> &[LlmAttempt] {
        match self {
            AnalysisReport::Succeeded { attempts, .. } | AnalysisReport::Failed { attempts, .. } => {
                attempts
            }
            AnalysisReport::NotFound => &[],
        }
    }
}

/// Analysis pipeline invoked by the job worker for `llm_analysis` jobs.
#[async_trait]
pub trait AnalysisRunner: Send + Sync + 'static {
    async fn analyze_news_event(
        &self,
        news_event_id: NewsEventId,
        trace_id: Option<TraceId>,
    ) -> AnalysisReport;
}

/// Build the LLM input text for an event.
pub fn build_input_text(event: &NewsEvent) -> String {
    let mut text = format!("Title: {}\n", event.headline);
    if let Some(summary) = event.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str(&format!("Summary: {summary}\n"));
    }
    text.push_str(&format!("Symbol: {}\n", event.symbol));
    text
}

/// Loads events from the store and analyses them with an [`LlmClient`].
///
/// Each call runs in an `analysis_service` span nested under the caller's span,
/// so a job's `trace_id` reaches every analysis and LLM log line.
pub struct AnalysisService {
    store: Arc<dyn NewsEventStore>,
    client: LlmClient,
}

impl AnalysisService {
    pub fn new(store: Arc<dyn NewsEventStore>, client: LlmClient) -> Self {
        Self { store, client }
    }

    async fn run(&self, news_event_id: NewsEventId) -> AnalysisReport {
        let event = match self.store.get(news_event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                warn!(%news_event_id, "news event not found");
                return AnalysisReport::NotFound;
            }
            Err(e) => {
                warn!(%news_event_id, error = %e, "failed to load news event");
                return AnalysisReport::Failed {
                    error_message: format!("failed to load news event: {e}"),
                    attempts: Vec::new(),
                };
            }
        };

        match self.client.analyze(&build_input_text(&event)).await {
            Ok(run) => {
                info!(
                    %news_event_id,
                    sentiment = %run.result.sentiment,
                    confidence = run.result.confidence,
                    attempts = run.attempts.len(),
                    "analysis succeeded"
                );
                AnalysisReport::Succeeded {
                    result: run.result,
                    attempts: run.attempts,
                }
            }
            Err(err) => {
                let error_message = failure_message(&err);
                warn!(%news_event_id, error = %error_message, "analysis failed");
                AnalysisReport::Failed {
                    error_message,
                    attempts: err.into_attempts(),
                }
            }
        }
    }
}

fn failure_message(err: &AnalysisError) -> String {
    match err.last_error() {
        Some(last) => format!("{err}: {last}"),
        None => err.to_string(),
    }
}

#[async_trait]
impl AnalysisRunner for AnalysisService {
    async fn analyze_news_event(
        &self,
        news_event_id: NewsEventId,
        trace_id: Option<TraceId>,
    ) -> AnalysisReport {
        let span = info_span!(
            "analysis_service",
            provider = %self.client.provider_name(),
            model = %self.client.model(),
            %news_event_id,
            trace_id = trace_id.as_ref().map(tracing::field::display),
        );
        self.run(news_event_id).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::Utc;
    use newsflow_ai::{LlmClientConfig, LlmProvider, ProviderError, Sentiment, build_prompt};
    use newsflow_core::NewsArticle;

    use crate::news_store::InMemoryNewsEventStore;

    struct ScriptedProvider(Mutex<VecDeque<Result<String, ProviderError>>>);

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-1"
        }

        async fn generate(&self, _prompt: &str, _timeout: Duration) -> Result<String, ProviderError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::new("exhausted script")))
        }
    }

    fn client(replies: Vec<Result<String, ProviderError>>) -> LlmClient {
        LlmClient::new(
            Arc::new(ScriptedProvider(Mutex::new(replies.into()))),
            LlmClientConfig::default().with_retry_delay(Duration::ZERO),
        )
    }

    async fn stored_event(store: &InMemoryNewsEventStore) -> NewsEvent {
        let article = NewsArticle::new("finnhub", "Apple beats", "https://example.com/e", Utc::now())
            .with_summary("Record iPhone sales")
            .with_symbols(["AAPL"]);
        let event = NewsEvent::from_article(&article);
        store.insert_if_absent(&event).await.unwrap();
        event
    }

    #[test]
    fn input_text_has_title_summary_and_symbol_lines() {
        let article = NewsArticle::new("p", "Fed holds rates", "u", Utc::now()).with_summary("Pause");
        let event = NewsEvent::from_article(&article);
        assert_eq!(
            build_input_text(&event),
            "Title: Fed holds rates\nSummary: Pause\nSymbol: MARKET\n"
        );

        let bare = NewsEvent::from_article(&NewsArticle::new("p", "Headline", "u", Utc::now()));
        assert_eq!(build_input_text(&bare), "Title: Headline\nSymbol: MARKET\n");
    }

    #[tokio::test]
    async fn successful_analysis_reports_result_and_attempts() {
        let store = Arc::new(InMemoryNewsEventStore::new());
        let event = stored_event(&store).await;
        let service = AnalysisService::new(
            store,
            client(vec![Ok(r#"{"tickers":["aapl"],"sentiment":"positive","confidence":0.9,"reasoning_summary":"Strong sales."}"#.to_string())]),
        );

        let report = service.analyze_news_event(event.id, Some(TraceId::new())).await;
        match &report {
            AnalysisReport::Succeeded { result, attempts } => {
                assert_eq!(result.tickers, vec!["AAPL"]);
                assert_eq!(result.sentiment, Sentiment::Positive);
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].prompt, build_prompt(&build_input_text(&event)));
            }
            other => panic!("unexpected report: {other:?}"),
        }
        assert_eq!(report.status(), "succeeded");
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure_with_history() {
        let store = Arc::new(InMemoryNewsEventStore::new());
        let event = stored_event(&store).await;
        let service = AnalysisService::new(
            store,
            client(vec![Ok("nope".into()), Ok("nope".into()), Ok("nope".into())]),
        );

        let report = service.analyze_news_event(event.id, Some(TraceId::new())).await;
        match report {
            AnalysisReport::Failed {
                error_message,
                attempts,
            } => {
                assert!(error_message.starts_with("LLM analysis failed after 3 attempt(s)"));
                assert!(error_message.contains("invalid json"));
                assert_eq!(attempts.len(), 3);
            }
            other => panic!("unexpected report: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let service = AnalysisService::new(Arc::new(InMemoryNewsEventStore::new()), client(vec![]));
        assert_eq!(
            service.analyze_news_event(NewsEventId::new(), None).await,
            AnalysisReport::NotFound
        );
    }
}
