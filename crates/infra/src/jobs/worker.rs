//! Lease-claiming job worker.
//!
//! Each poll:
//!
//! 1. Reclaim jobs whose lease (`locked_at`) is older than `lease_timeout`.
//! 2. Claim up to `batch_size` eligible jobs for this worker id.
//! 3. Process each job and record its outcome (`done`, or `failed` with backoff).
//!
//! With nothing to claim the worker sleeps `poll_interval`. Single-pass mode
//! ([`JobWorker::run_once`]) drains currently eligible work and returns.

use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{AnalysisJob, JobType, RetryPolicy};
use crate::ai::{AnalysisReport, AnalysisRunner};
use crate::workers::{ShutdownSignal, WorkerHandle, shutdown_channel};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls that found no work
    pub poll_interval: Duration,
    /// Jobs claimed per poll
    pub batch_size: usize,
    /// Attempts after which a job is never claimed again
    pub max_attempts: u32,
    /// Age of a `running` lease after which the job is reclaimed
    pub lease_timeout: Duration,
    /// Identity stamped into `locked_by`
    pub worker_id: String,
    /// Failure backoff
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            batch_size: 10,
            max_attempts: 3,
            lease_timeout: Duration::from_secs(30 * 60),
            worker_id: default_worker_id(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// `<host>:<pid>`.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}:{}", std::process::id())
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub reclaimed: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Outcomes dropped because the lease was no longer held.
    pub lease_lost: u64,
}

impl WorkerStats {
    fn merge(&mut self, other: WorkerStats) {
        self.reclaimed += other.reclaimed;
        self.claimed += other.claimed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.lease_lost += other.lease_lost;
    }
}

/// Background job worker.
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn AnalysisRunner>,
    config: WorkerConfig,
    span: Span,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<dyn AnalysisRunner>,
        config: WorkerConfig,
    ) -> Self {
        let span = info_span!("job_worker", worker_id = %config.worker_id);
        Self {
            store,
            runner,
            config,
            span,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Process all currently eligible work, then return.
    pub async fn run_once(&self) -> Result<WorkerStats, JobStoreError> {
        async {
            let mut stats = WorkerStats {
                reclaimed: self.reclaim().await?,
                ..Default::default()
            };
            loop {
                let batch = self.poll_batch().await?;
                if batch.claimed == 0 {
                    break;
                }
                stats.merge(batch);
            }
            info!(?stats, "single pass finished");
            Ok::<_, JobStoreError>(stats)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Run until `shutdown` fires. Returns the accumulated statistics.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> WorkerStats {
        async {
            info!("job worker started");
            let mut totals = WorkerStats::default();

            while !shutdown.is_shutdown() {
                match self.reclaim().await {
                    Ok(reclaimed) => totals.reclaimed += reclaimed,
                    Err(e) => error!(error = %e, "failed to reclaim stale jobs"),
                }

                let idle = match self.poll_batch().await {
                    Ok(batch) => {
                        totals.merge(batch);
                        batch.claimed == 0
                    }
                    Err(e) => {
                        error!(error = %e, "failed to claim jobs");
                        true
                    }
                };

                if idle {
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }

            info!(stats = ?totals, "job worker stopped");
            totals
        }
        .instrument(self.span.clone())
        .await
    }

    /// Spawn the continuous loop on the tokio runtime.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle<WorkerStats> {
        let (tx, signal) = shutdown_channel();
        let join = tokio::spawn(async move { self.run(signal).await });
        WorkerHandle::new(tx, join)
    }

    async fn reclaim(&self) -> Result<u64, JobStoreError> {
        let reclaimed = self.store.reclaim_stale(self.config.lease_timeout).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed jobs with expired leases");
        }
        Ok(reclaimed)
    }

    /// Claim one batch and process it sequentially.
    async fn poll_batch(&self) -> Result<WorkerStats, JobStoreError> {
        let jobs = self
            .store
            .claim_batch(
                self.config.batch_size,
                self.config.max_attempts,
                &self.config.worker_id,
            )
            .await?;

        let mut stats = WorkerStats {
            claimed: jobs.len() as u64,
            ..Default::default()
        };
        if !jobs.is_empty() {
            debug!(claimed = jobs.len(), "claimed jobs");
        }

        for job in &jobs {
            let span = info_span!(
                "job",
                job_id = %job.id,
                job_uuid = %job.job_uuid,
                news_event_id = %job.news_event_id,
                trace_id = job.trace_id.as_ref().map(tracing::field::display),
            );
            async {
                let outcome = self.execute(job).await;
                self.record(job, outcome, &mut stats).await;
            }
            .instrument(span)
            .await;
        }
        Ok(stats)
    }

    /// Dispatch by job type. `Err` carries the message stored in `last_error`.
    async fn execute(&self, job: &AnalysisJob) -> Result<(), String> {
        let kind = job.kind().map_err(|e| e.to_string())?;
        match kind {
            JobType::LlmAnalysis => {
                match self
                    .runner
                    .analyze_news_event(job.news_event_id, job.trace_id)
                    .await
                {
                    AnalysisReport::Succeeded { .. } => Ok(()),
                    AnalysisReport::Failed { error_message, .. } => Err(error_message),
                    AnalysisReport::NotFound => {
                        Err(format!("news_event_not_found: {}", job.news_event_id))
                    }
                }
            }
        }
    }

    async fn record(&self, job: &AnalysisJob, outcome: Result<(), String>, stats: &mut WorkerStats) {
        let worker_id = &self.config.worker_id;
        let result = match outcome {
            Ok(()) => self.store.mark_done(job.id, worker_id).await.map(|_| {
                stats.succeeded += 1;
                info!(
                    job_id = %job.id,
                    job_uuid = %job.job_uuid,
                    news_event_id = %job.news_event_id,
                    "job done"
                );
            }),
            Err(message) => self
                .store
                .mark_failed(job.id, worker_id, &message, &self.config.retry_policy)
                .await
                .map(|updated| {
                    stats.failed += 1;
                    error!(
                        job_id = %job.id,
                        job_uuid = %job.job_uuid,
                        news_event_id = %job.news_event_id,
                        attempts = updated.attempts,
                        next_run_at = %updated.next_run_at,
                        exhausted = updated.is_exhausted(self.config.max_attempts),
                        error = %message,
                        "job failed"
                    );
                }),
        };

        match result {
            Ok(()) => {}
            Err(JobStoreError::LeaseLost { .. }) => {
                stats.lease_lost += 1;
                warn!(job_id = %job.id, "lease lost before outcome was recorded");
            }
            Err(e) => error!(job_id = %job.id, error = %e, "failed to record job outcome"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use newsflow_ai::{AnalysisResult, parse_analysis_json};
    use newsflow_core::{NewsEventId, TraceId};

    use crate::clock::{Clock, ManualClock};
    use crate::jobs::{InMemoryJobStore, JobStatus};

    struct ScriptedRunner {
        reports: Mutex<VecDeque<AnalysisReport>>,
        calls: Mutex<Vec<(NewsEventId, Option<TraceId>)>>,
    }

    impl ScriptedRunner {
        fn new(reports: Vec<AnalysisReport>) -> Arc<Self> {
            Arc::new(Self {
                reports: Mutex::new(reports.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AnalysisRunner for ScriptedRunner {
        async fn analyze_news_event(
            &self,
            news_event_id: NewsEventId,
            trace_id: Option<TraceId>,
        ) -> AnalysisReport {
            self.calls.lock().unwrap().push((news_event_id, trace_id));
            self.reports
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(AnalysisReport::NotFound)
        }
    }

    fn ok_result() -> AnalysisResult {
        parse_analysis_json(
            r#"{"tickers":["AAPL"],"sentiment":"positive","confidence":0.9,"reasoning_summary":"ok"}"#,
        )
        .unwrap()
    }

    fn succeeded() -> AnalysisReport {
        AnalysisReport::Succeeded {
            result: ok_result(),
            attempts: Vec::new(),
        }
    }

    fn failed(message: &str) -> AnalysisReport {
        AnalysisReport::Failed {
            error_message: message.to_string(),
            attempts: Vec::new(),
        }
    }

    fn setup(
        reports: Vec<AnalysisReport>,
    ) -> (Arc<InMemoryJobStore>, ManualClock, JobWorker) {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryJobStore::with_clock(Arc::new(clock.clone())));
        let worker = JobWorker::new(
            store.clone(),
            ScriptedRunner::new(reports),
            WorkerConfig::default()
                .with_worker_id("test-worker")
                .with_poll_interval(Duration::from_millis(50)),
        );
        (store, clock, worker)
    }

    #[tokio::test]
    async fn successful_analysis_marks_job_done() {
        let (store, _, worker) = setup(vec![succeeded()]);
        let event = NewsEventId::new();
        store.publish(event, TraceId::new(), JobType::LlmAnalysis).await.unwrap();

        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.succeeded, 1);

        let job = store.find(event, JobType::LlmAnalysis).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.last_error, None);
    }

    #[tokio::test]
    async fn failed_analysis_records_error_and_backoff() {
        let (store, clock, worker) = setup(vec![failed("LLM analysis failed after 3 attempt(s)")]);
        let event = NewsEventId::new();
        store.publish(event, TraceId::new(), JobType::LlmAnalysis).await.unwrap();

        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.failed, 1);

        let job = store.find(event, JobType::LlmAnalysis).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.next_run_at, clock.now() + chrono::Duration::seconds(20));
        assert_eq!(
            job.last_error.as_deref(),
            Some("LLM analysis failed after 3 attempt(s)")
        );
    }

    #[tokio::test]
    async fn missing_event_fails_the_job() {
        let (store, _, worker) = setup(vec![AnalysisReport::NotFound]);
        let event = NewsEventId::new();
        store.publish(event, TraceId::new(), JobType::LlmAnalysis).await.unwrap();

        worker.run_once().await.unwrap();
        let job = store.find(event, JobType::LlmAnalysis).await.unwrap().unwrap();
        assert_eq!(
            job.last_error,
            Some(format!("news_event_not_found: {event}"))
        );
    }

    #[tokio::test]
    async fn unknown_job_type_is_a_declared_error() {
        let (_, _, worker) = setup(vec![]);
        let mut job = AnalysisJob {
            id: crate::jobs::JobId(7),
            job_uuid: newsflow_core::JobUuid::new(),
            news_event_id: NewsEventId::new(),
            job_type: "summarize".to_string(),
            status: JobStatus::Running,
            attempts: 0,
            next_run_at: chrono::Utc::now(),
            locked_by: Some("test-worker".to_string()),
            locked_at: Some(chrono::Utc::now()),
            trace_id: None,
            last_error: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        assert_eq!(
            worker.execute(&job).await,
            Err("unknown job_type: summarize".to_string())
        );

        job.job_type = "llm_analysis".to_string();
        assert!(worker.execute(&job).await.is_err());
    }

    #[tokio::test]
    async fn job_failing_three_times_is_never_claimed_again() {
        let (store, clock, worker) = setup(vec![failed("a"), failed("b"), failed("c"), succeeded()]);
        let event = NewsEventId::new();
        store.publish(event, TraceId::new(), JobType::LlmAnalysis).await.unwrap();

        for _ in 0..3 {
            assert_eq!(worker.run_once().await.unwrap().failed, 1);
            clock.advance(chrono::Duration::seconds(301));
        }

        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.claimed, 0);

        let job = store.find(event, JobType::LlmAnalysis).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("c"));
        assert_eq!(store.stats(3).await.unwrap().exhausted, 1);
    }

    #[tokio::test]
    async fn analysis_runs_under_the_published_trace_id() {
        let store = InMemoryJobStore::arc();
        let runner = ScriptedRunner::new(vec![succeeded()]);
        let worker = JobWorker::new(
            store.clone(),
            runner.clone(),
            WorkerConfig::default().with_worker_id("w"),
        );
        let event = NewsEventId::new();
        let trace_id = TraceId::new();
        store.publish(event, trace_id, JobType::LlmAnalysis).await.unwrap();

        worker.run_once().await.unwrap();
        assert_eq!(*runner.calls.lock().unwrap(), vec![(event, Some(trace_id))]);
    }

    #[tokio::test]
    async fn single_pass_drains_more_than_one_batch() {
        let reports = (0..5).map(|_| succeeded()).collect();
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryJobStore::with_clock(Arc::new(clock)));
        let worker = JobWorker::new(
            store.clone(),
            ScriptedRunner::new(reports),
            WorkerConfig::default().with_worker_id("w").with_batch_size(2),
        );
        for _ in 0..5 {
            store.publish(NewsEventId::new(), TraceId::new(), JobType::LlmAnalysis).await.unwrap();
        }

        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.claimed, 5);
        assert_eq!(stats.succeeded, 5);
        assert_eq!(store.stats(3).await.unwrap().done, 5);
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed_before_claiming() {
        let (store, clock, worker) = setup(vec![succeeded()]);
        let event = NewsEventId::new();
        store.publish(event, TraceId::new(), JobType::LlmAnalysis).await.unwrap();
        store.claim_batch(1, 3, "crashed-worker").await.unwrap();

        clock.advance(chrono::Duration::minutes(31));
        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.succeeded, 1);

        let job = store.find(event, JobType::LlmAnalysis).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_mode_picks_up_new_work_and_stops_on_shutdown() {
        let (store, _, worker) = setup(vec![succeeded(), succeeded()]);
        let handle = Arc::new(worker).spawn();

        store.publish(NewsEventId::new(), TraceId::new(), JobType::LlmAnalysis).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        store.publish(NewsEventId::new(), TraceId::new(), JobType::LlmAnalysis).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.succeeded, 2);
        assert_eq!(store.stats(3).await.unwrap().done, 2);
    }
}
