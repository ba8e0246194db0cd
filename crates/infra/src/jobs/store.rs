//! Job storage: trait plus the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use newsflow_core::{JobUuid, NewsEventId, TraceId};

use super::types::{AnalysisJob, JobId, JobStatus, JobType, RetryPolicy, truncate_error};
use crate::clock::{Clock, SystemClock};

/// `last_error` recorded when a stale lease is reclaimed.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

/// Job store abstraction.
///
/// Claim and outcome updates are separate transactions. Outcome updates only
/// apply while the caller still holds the lease (`status = running` and
/// `locked_by = worker_id`).
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a pending job unless one exists for `(news_event_id, job_type)`.
    /// Returns whether a row was created.
    async fn publish(
        &self,
        news_event_id: NewsEventId,
        trace_id: TraceId,
        job_type: JobType,
    ) -> Result<bool, JobStoreError>;

    /// Atomically claim up to `batch_size` eligible jobs for `worker_id`.
    ///
    /// Eligible: `status in (pending, failed)`, `next_run_at <= now`,
    /// `attempts < max_attempts`, ordered by `(next_run_at, created_at)`.
    /// Rows claimed by another worker are skipped, never waited on.
    async fn claim_batch(
        &self,
        batch_size: usize,
        max_attempts: u32,
        worker_id: &str,
    ) -> Result<Vec<AnalysisJob>, JobStoreError>;

    /// Mark a claimed job done and clear `last_error`.
    async fn mark_done(&self, id: JobId, worker_id: &str) -> Result<AnalysisJob, JobStoreError>;

    /// Record a failure: `attempts += 1`, schedule `next_run_at` by backoff.
    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<AnalysisJob, JobStoreError>;

    /// Release `running` jobs whose lease is older than `lease_timeout`.
    /// Each counts as a failed attempt and is immediately eligible again.
    async fn reclaim_stale(&self, lease_timeout: Duration) -> Result<u64, JobStoreError>;

    /// Get a job by row id.
    async fn get(&self, id: JobId) -> Result<Option<AnalysisJob>, JobStoreError>;

    /// Get the job for an event and type.
    async fn find(
        &self,
        news_event_id: NewsEventId,
        job_type: JobType,
    ) -> Result<Option<AnalysisJob>, JobStoreError>;

    /// Counts per status.
    async fn stats(&self, max_attempts: u32) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("lease lost on job {id}: no longer running under {worker_id}")]
    LeaseLost { id: JobId, worker_id: String },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
    /// Not done and out of attempts; never claimed again.
    pub exhausted: u64,
}

/// In-memory job store for tests/dev.
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<JobId, AnalysisJob>,
    by_key: HashMap<(NewsEventId, JobType), JobId>,
    next_id: i64,
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> JobStoreError {
        JobStoreError::Storage("job store lock poisoned".to_string())
    }

    fn leased<'a>(
        inner: &'a mut Inner,
        id: JobId,
        worker_id: &str,
    ) -> Result<&'a mut AnalysisJob, JobStoreError> {
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.status != JobStatus::Running || job.locked_by.as_deref() != Some(worker_id) {
            return Err(JobStoreError::LeaseLost {
                id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(job)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn publish(
        &self,
        news_event_id: NewsEventId,
        trace_id: TraceId,
        job_type: JobType,
    ) -> Result<bool, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        if inner.by_key.contains_key(&(news_event_id, job_type)) {
            return Ok(false);
        }

        inner.next_id += 1;
        let id = JobId(inner.next_id);
        inner.by_key.insert((news_event_id, job_type), id);
        inner.jobs.insert(
            id,
            AnalysisJob {
                id,
                job_uuid: JobUuid::new(),
                news_event_id,
                job_type: job_type.as_str().to_string(),
                status: JobStatus::Pending,
                attempts: 0,
                next_run_at: now,
                locked_by: None,
                locked_at: None,
                trace_id: Some(trace_id),
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn claim_batch(
        &self,
        batch_size: usize,
        max_attempts: u32,
        worker_id: &str,
    ) -> Result<Vec<AnalysisJob>, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;

        let mut eligible: Vec<&AnalysisJob> = inner
            .jobs
            .values()
            .filter(|j| j.status.is_claimable() && j.next_run_at <= now && j.attempts < max_attempts)
            .collect();
        eligible.sort_by_key(|j| (j.next_run_at, j.created_at, j.id));
        let ids: Vec<JobId> = eligible.iter().take(batch_size).map(|j| j.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Running;
                job.locked_by = Some(worker_id.to_string());
                job.locked_at = Some(now);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_done(&self, id: JobId, worker_id: &str) -> Result<AnalysisJob, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let job = Self::leased(&mut inner, id, worker_id)?;

        job.status = JobStatus::Done;
        job.last_error = None;
        job.locked_by = None;
        job.locked_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<AnalysisJob, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let job = Self::leased(&mut inner, id, worker_id)?;

        job.attempts += 1;
        let backoff = chrono::Duration::from_std(policy.backoff(job.attempts))
            .map_err(|e| JobStoreError::Storage(format!("invalid backoff: {e}")))?;
        job.status = JobStatus::Failed;
        job.next_run_at = now + backoff;
        job.last_error = Some(truncate_error(error));
        job.locked_by = None;
        job.locked_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn reclaim_stale(&self, lease_timeout: Duration) -> Result<u64, JobStoreError> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(lease_timeout)
            .map_err(|e| JobStoreError::Storage(format!("invalid lease timeout: {e}")))?;
        let cutoff = now - lease;

        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let mut reclaimed = 0;
        for job in inner.jobs.values_mut() {
            let stale = job.status == JobStatus::Running
                && job.locked_at.is_some_and(|locked_at| locked_at <= cutoff);
            if stale {
                job.status = JobStatus::Failed;
                job.attempts += 1;
                job.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
                job.next_run_at = now;
                job.locked_by = None;
                job.locked_at = None;
                job.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> Result<Option<AnalysisJob>, JobStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn find(
        &self,
        news_event_id: NewsEventId,
        job_type: JobType,
    ) -> Result<Option<AnalysisJob>, JobStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner
            .by_key
            .get(&(news_event_id, job_type))
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    async fn stats(&self, max_attempts: u32) -> Result<JobStats, JobStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Done => stats.done += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            if job.is_exhausted(max_attempts) {
                stats.exhausted += 1;
            }
        }
        Ok(stats)
    }
}
