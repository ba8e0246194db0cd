use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Maximum length of `reasoning_summary`, in characters.
pub const MAX_SUMMARY_CHARS: usize = 280;

/// Market sentiment of a news item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "positive" => Some(Sentiment::Positive),
            "neutral" => Some(Sentiment::Neutral),
            "negative" => Some(Sentiment::Negative),
            _ => None,
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated LLM analysis of one news item.
///
/// Only constructible through [`parse_analysis_json`], so every instance
/// satisfies the schema rules below.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    /// Upper-cased, trimmed, non-empty, deduplicated in first-seen order.
    pub tickers: Vec<String>,
    pub sentiment: Sentiment,
    /// In `[0, 1]` inclusive.
    pub confidence: f64,
    /// Trimmed, non-empty, at most 280 characters.
    pub reasoning_summary: String,
}

/// Raw model output. Closed schema: extra keys are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAnalysis {
    #[serde(default)]
    tickers: Vec<String>,
    sentiment: String,
    confidence: f64,
    reasoning_summary: String,
}

/// Why a model output was rejected. Always retryable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("JSON root must be an object")]
    NotAnObject,

    #[error("schema mismatch: {0}")]
    Schema(String),

    #[error("tickers must be non-empty")]
    EmptyTicker,

    #[error("sentiment must be positive|neutral|negative, got {0:?}")]
    InvalidSentiment(String),

    #[error("confidence must be between 0 and 1, got {0}")]
    ConfidenceOutOfRange(f64),

    #[error("reasoning_summary must be non-empty")]
    EmptySummary,

    #[error("reasoning_summary must be <= 280 chars, got {0}")]
    SummaryTooLong(usize),
}

/// Parse raw model output as a JSON object and validate it.
pub fn parse_analysis_json(text: &str) -> Result<AnalysisResult, ValidationError> {
    let payload: JsonValue =
        serde_json::from_str(text).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;

    if !payload.is_object() {
        return Err(ValidationError::NotAnObject);
    }

    let raw: RawAnalysis =
        serde_json::from_value(payload).map_err(|e| ValidationError::Schema(e.to_string()))?;

    AnalysisResult::validate(raw)
}

impl AnalysisResult {
    fn validate(raw: RawAnalysis) -> Result<Self, ValidationError> {
        let tickers = normalize_tickers(raw.tickers)?;

        let sentiment = Sentiment::parse(&raw.sentiment)
            .ok_or_else(|| ValidationError::InvalidSentiment(raw.sentiment.clone()))?;

        if !(0.0..=1.0).contains(&raw.confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(raw.confidence));
        }

        let reasoning_summary = raw.reasoning_summary.trim();
        if reasoning_summary.is_empty() {
            return Err(ValidationError::EmptySummary);
        }
        let chars = reasoning_summary.chars().count();
        if chars > MAX_SUMMARY_CHARS {
            return Err(ValidationError::SummaryTooLong(chars));
        }

        Ok(Self {
            tickers,
            sentiment,
            confidence: raw.confidence,
            reasoning_summary: reasoning_summary.to_string(),
        })
    }
}

fn normalize_tickers(raw: Vec<String>) -> Result<Vec<String>, ValidationError> {
    let mut tickers: Vec<String> = Vec::with_capacity(raw.len());
    for item in raw {
        let ticker = item.trim().to_uppercase();
        if ticker.is_empty() {
            return Err(ValidationError::EmptyTicker);
        }
        if !tickers.contains(&ticker) {
            tickers.push(ticker);
        }
    }
    Ok(tickers)
}
