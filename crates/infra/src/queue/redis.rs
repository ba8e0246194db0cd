//! Redis list-backed queue (`RPUSH` / `BLPOP`).
//!
//! Pushes and blocking pops use separate multiplexed connections so a pending
//! `BLPOP` never stalls producers sharing this handle. A connection is dropped
//! and re-established after an I/O failure.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use super::{DEFAULT_QUEUE_NAME, NewsQueue, QueueError};

pub struct RedisNewsQueue {
    client: redis::Client,
    name: String,
    push_conn: Mutex<Option<MultiplexedConnection>>,
    pop_conn: Mutex<Option<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisNewsQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisNewsQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RedisNewsQueue {
    /// Create a queue handle. Connections are opened lazily.
    ///
    /// * `redis_url` - e.g. `redis://localhost:6379`
    /// * `name` - list key (default `news_ingest_queue`)
    pub fn new(redis_url: impl AsRef<str>, name: Option<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            name: name.unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
            push_conn: Mutex::new(None),
            pop_conn: Mutex::new(None),
        })
    }

    async fn connection(
        &self,
        slot: &Mutex<Option<MultiplexedConnection>>,
    ) -> Result<MultiplexedConnection, QueueError> {
        let mut slot = slot.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn map_error(
        &self,
        slot: &Mutex<Option<MultiplexedConnection>>,
        err: redis::RedisError,
    ) -> QueueError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            warn!(queue = %self.name, error = %err, "dropping redis connection");
            *slot.lock().await = None;
            QueueError::Connection(err.to_string())
        } else {
            QueueError::Command(err.to_string())
        }
    }
}

#[async_trait]
impl NewsQueue for RedisNewsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, payload), fields(queue = %self.name), err)]
    async fn push_raw(&self, payload: String) -> Result<(), QueueError> {
        let mut conn = self.connection(&self.push_conn).await?;
        let result = redis::cmd("RPUSH")
            .arg(&self.name)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.map_error(&self.push_conn, e).await),
        }
    }

    async fn pop(&self, wait: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.connection(&self.pop_conn).await?;

        // BLPOP treats a zero timeout as "block forever".
        let result = if wait.is_zero() {
            redis::cmd("LPOP")
                .arg(&self.name)
                .query_async::<_, Option<String>>(&mut conn)
                .await
        } else {
            redis::cmd("BLPOP")
                .arg(&self.name)
                .arg(blpop_timeout_secs(wait))
                .query_async::<_, Option<(String, String)>>(&mut conn)
                .await
                .map(|popped| popped.map(|(_key, payload)| payload))
        };

        match result {
            Ok(payload) => Ok(payload),
            Err(e) => Err(self.map_error(&self.pop_conn, e).await),
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection(&self.push_conn).await?;
        let result = redis::cmd("LLEN")
            .arg(&self.name)
            .query_async::<_, usize>(&mut conn)
            .await;

        match result {
            Ok(len) => Ok(len),
            Err(e) => Err(self.map_error(&self.push_conn, e).await),
        }
    }
}

/// Whole-second `BLPOP` timeout. Sub-second waits round up to one second.
fn blpop_timeout_secs(wait: Duration) -> u64 {
    wait.as_secs().max(1)
}
