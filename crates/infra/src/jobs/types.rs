//! Core job types and policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use newsflow_core::{JobUuid, NewsEventId, TraceId};

/// Maximum stored length of `last_error`, in characters.
pub const MAX_LAST_ERROR_CHARS: usize = 500;

/// Storage row id of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job processing error surfaced by dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("unknown job_type: {0}")]
    UnknownJobType(String),
}

/// Known job types. Dispatch matches exhaustively over these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// LLM analysis of one news event.
    LlmAnalysis,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::LlmAnalysis => "llm_analysis",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm_analysis" => Ok(JobType::LlmAnalysis),
            other => Err(JobError::UnknownJobType(other.to_string())),
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Published, waiting to be claimed
    Pending,
    /// Claimed by a worker (lease held)
    Running,
    /// Completed successfully
    Done,
    /// Failed; retried after backoff until the attempt cap
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Whether a row in this status may be claimed (subject to schedule and attempts).
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job backoff policy: `min(2^attempts * base, cap)`, where `attempts` is the
/// count after the failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before a job with `attempts` recorded failures becomes eligible again.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts >= u32::BITS {
            return self.max_delay;
        }
        self.base_delay
            .saturating_mul(1u32 << attempts)
            .min(self.max_delay)
    }
}

/// An analysis job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: JobId,
    pub job_uuid: JobUuid,
    pub news_event_id: NewsEventId,
    /// Raw stored type. Parsed at dispatch so unknown values surface as errors.
    pub job_type: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub trace_id: Option<TraceId>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisJob {
    pub fn kind(&self) -> Result<JobType, JobError> {
        self.job_type.parse()
    }

    /// Whether the job has used up its attempts and is never claimed again.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.status != JobStatus::Done && self.attempts >= max_attempts
    }
}

/// Truncate an error message to [`MAX_LAST_ERROR_CHARS`] characters.
pub fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_LAST_ERROR_CHARS).collect()
}
