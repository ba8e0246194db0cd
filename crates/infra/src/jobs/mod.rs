//! Analysis job system: publish, lease-based claim, retry with backoff.
//!
//! ## Lifecycle
//!
//! `pending → running (claim) → done`, or `→ failed` with `attempts += 1` and
//! `next_run_at = now + backoff`. Failed jobs are claimable again once their
//! backoff elapses, until `attempts` reaches the cap.
//!
//! ## Components
//!
//! - `JobStore`: persistence and the claim primitive (in-memory or Postgres)
//! - `JobPublisher`: idempotent job creation per `(event, job_type)`
//! - `JobWorker`: claim/process/record loop with stale-lease reclaim

pub mod postgres;
pub mod publisher;
pub mod store;
pub mod types;
pub mod worker;

pub use postgres::PostgresJobStore;
pub use publisher::JobPublisher;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, LEASE_EXPIRED_ERROR};
pub use types::{
    AnalysisJob, JobError, JobId, JobStatus, JobType, MAX_LAST_ERROR_CHARS, RetryPolicy,
    truncate_error,
};
pub use worker::{JobWorker, WorkerConfig, WorkerStats, default_worker_id};
