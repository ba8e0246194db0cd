//! News records: the transient queue payload and the persisted event row.
//!
//! `NewsArticle` is what a provider pushes onto the ingest queue. `NewsEvent`
//! is the append-only row the storage consumer writes, keyed by URL.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::error::{DomainError, DomainResult};
use crate::id::NewsEventId;

/// Symbol stored when an article carries no ticker symbols.
pub const MARKET_SYMBOL: &str = "MARKET";

const UNKNOWN_PROVIDER: &str = "unknown";

/// Article record as it travels over the ingest queue.
///
/// Wire format: `{provider, title, url, published_at, summary, symbols[], sentiment, source}`.
/// `url` is the cross-provider dedup key and must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    #[serde(default = "unknown_provider")]
    pub provider: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(deserialize_with = "deserialize_published_at")]
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, deserialize_with = "deserialize_symbols")]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

fn unknown_provider() -> String {
    UNKNOWN_PROVIDER.to_string()
}

impl NewsArticle {
    pub fn new(
        provider: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider: provider.into(),
            title: title.into(),
            url: url.into(),
            published_at,
            summary: None,
            symbols: Vec::new(),
            sentiment: None,
            source: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Decode a queue payload.
    ///
    /// Fails on malformed JSON, a bad timestamp, or a missing/blank `url`.
    pub fn from_json(payload: &str) -> DomainResult<Self> {
        let article: NewsArticle = serde_json::from_str(payload)
            .map_err(|e| DomainError::validation(format!("invalid article payload: {e}")))?;

        if article.url.trim().is_empty() {
            return Err(DomainError::validation("article url is missing"));
        }

        Ok(article)
    }

    /// Encode for the queue.
    pub fn to_json(&self) -> DomainResult<String> {
        serde_json::to_string(self)
            .map_err(|e| DomainError::validation(format!("failed to encode article: {e}")))
    }
}

/// Accepts RFC 3339 timestamps and naive ISO-8601 timestamps (read as UTC).
fn deserialize_published_at<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("published_at is not an ISO-8601 timestamp: {raw}"))
    })
}

fn deserialize_symbols<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Persisted news event (append-only, unique by `url`).
///
/// Identity is the composite `(time, id)`. Rows are created once per
/// distinct URL and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsEvent {
    pub time: DateTime<Utc>,
    pub id: NewsEventId,
    pub symbol: String,
    pub source: String,
    pub headline: String,
    pub url: String,
    pub summary: Option<String>,
    pub sentiment_score: Option<f64>,
    pub metadata: JsonValue,
}

impl NewsEvent {
    /// Map a queue article to a new event row.
    ///
    /// - `symbol`: first entry of `symbols`, or [`MARKET_SYMBOL`]
    /// - `source`: the provider name
    /// - `metadata`: provider, original source and the full symbol list
    pub fn from_article(article: &NewsArticle) -> Self {
        let symbol = article
            .symbols
            .first()
            .cloned()
            .unwrap_or_else(|| MARKET_SYMBOL.to_string());

        Self {
            time: article.published_at,
            id: NewsEventId::new(),
            symbol,
            source: article.provider.clone(),
            headline: article.title.clone(),
            url: article.url.clone(),
            summary: article.summary.clone(),
            sentiment_score: None,
            metadata: json!({
                "provider": article.provider,
                "source": article.source,
                "symbols": article.symbols,
            }),
        }
    }
}
