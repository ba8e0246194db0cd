//! Postgres-backed news event store.
//!
//! Expects a `news_events` table:
//!
//! - `time timestamptz`, `id uuid`, composite primary key `(time, id)`
//! - `symbol`, `source`, `headline`, `url` (unique), `summary` as text
//! - `sentiment_score double precision`, `metadata jsonb`
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | PoolClosed / PoolTimedOut / Io / Tls | `Connection` |
//! | ColumnDecode / Decode / ColumnNotFound | `Decode` |
//! | Database / other | `Query` |
//!
//! A URL conflict never reaches the error path: `ON CONFLICT (url) DO NOTHING`
//! returns no row and the insert reports `Duplicate`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use newsflow_core::{NewsEvent, NewsEventId};

use super::{InsertOutcome, NewsEventStore, StoreError};

const SELECT_COLUMNS: &str = "time, id, symbol, source, headline, url, summary, \
     sentiment_score::float8 AS sentiment_score, metadata";

#[derive(Debug, Clone)]
pub struct PostgresNewsEventStore {
    pool: Arc<PgPool>,
}

impl PostgresNewsEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl NewsEventStore for PostgresNewsEventStore {
    #[instrument(skip(self, event), fields(url = %event.url, news_event_id = %event.id), err)]
    async fn insert_if_absent(&self, event: &NewsEvent) -> Result<InsertOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Dropping `tx` on the error path rolls the insert back.
        let inserted = sqlx::query(
            r#"
            INSERT INTO news_events (
                time,
                id,
                symbol,
                source,
                headline,
                url,
                summary,
                sentiment_score,
                metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (url) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event.time)
        .bind(event.id.as_uuid())
        .bind(&event.symbol)
        .bind(&event.source)
        .bind(&event.headline)
        .bind(&event.url)
        .bind(&event.summary)
        .bind(event.sentiment_score)
        .bind(&event.metadata)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_news_event", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        match inserted {
            Some(row) => {
                let id: uuid::Uuid = row
                    .try_get("id")
                    .map_err(|e| StoreError::Decode(format!("failed to read id: {e}")))?;
                Ok(InsertOutcome::Inserted(NewsEventId::from_uuid(id)))
            }
            None => Ok(InsertOutcome::Duplicate),
        }
    }

    #[instrument(skip(self), fields(news_event_id = %id), err)]
    async fn get(&self, id: NewsEventId) -> Result<Option<NewsEvent>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM news_events WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_news_event", e))?;
        decode_row(row)
    }

    #[instrument(skip(self), err)]
    async fn find_by_url(&self, url: &str) -> Result<Option<NewsEvent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM news_events WHERE url = $1 LIMIT 1"
        ))
        .bind(url)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_news_event_by_url", e))?;
        decode_row(row)
    }

    #[instrument(skip(self), err)]
    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM news_events")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_news_events", e))?;
        Ok(count.max(0) as u64)
    }
}

fn decode_row(row: Option<PgRow>) -> Result<Option<NewsEvent>, StoreError> {
    row.map(|row| {
        NewsEventRow::from_row(&row)
            .map(Into::into)
            .map_err(|e| StoreError::Decode(format!("failed to decode news event row: {e}")))
    })
    .transpose()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::Connection(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Connection(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Connection(format!("tls error in {operation}: {e}")),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => StoreError::Query(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        other => StoreError::Query(format!("error in {operation}: {other}")),
    }
}

#[derive(Debug)]
struct NewsEventRow {
    time: DateTime<Utc>,
    id: uuid::Uuid,
    symbol: String,
    source: String,
    headline: String,
    url: String,
    summary: Option<String>,
    sentiment_score: Option<f64>,
    metadata: serde_json::Value,
}

impl<'r> FromRow<'r, PgRow> for NewsEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(NewsEventRow {
            time: row.try_get("time")?,
            id: row.try_get("id")?,
            symbol: row.try_get("symbol")?,
            source: row.try_get("source")?,
            headline: row.try_get("headline")?,
            url: row.try_get("url")?,
            summary: row.try_get("summary")?,
            sentiment_score: row.try_get("sentiment_score")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl From<NewsEventRow> for NewsEvent {
    fn from(row: NewsEventRow) -> Self {
        NewsEvent {
            time: row.time,
            id: NewsEventId::from_uuid(row.id),
            symbol: row.symbol,
            source: row.source,
            headline: row.headline,
            url: row.url,
            summary: row.summary,
            sentiment_score: row.sentiment_score,
            metadata: row.metadata,
        }
    }
}
