//! Job domain types for render work items.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::recipe::Recipe;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a free render slot.
    #[default]
    Queued,
    /// Being executed by the renderer.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }

    /// Get a simple status string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Rejected state machine transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A job represents one admitted unit of render work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// The recipe this job renders. Never changes after admission.
    pub recipe: Recipe,
    pub status: JobStatus,
    /// Percentage complete, never decreases.
    pub progress: u8,
    /// Estimated seconds remaining.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    /// Diagnostic, present only when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Finished artifact, present only when completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(recipe: Recipe) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            recipe,
            status: JobStatus::Queued,
            progress: 0,
            eta_secs: None,
            error: None,
            output_path: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    fn transition(&mut self, to: JobStatus) -> Result<DateTime<Utc>, TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.finished_at = Some(now);
            self.eta_secs = None;
        }
        Ok(now)
    }

    pub fn mark_running(&mut self) -> Result<(), TransitionError> {
        let now = self.transition(JobStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn mark_completed(&mut self, output_path: PathBuf) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100;
        self.output_path = Some(output_path);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Cancelled)?;
        Ok(())
    }

    /// Record renderer progress.
    ///
    /// Only running jobs accept progress, and a lower percentage than the one
    /// already recorded is ignored. Returns whether anything changed.
    pub fn record_progress(&mut self, percent: u8, eta_secs: Option<u64>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        let percent = percent.min(100);
        if percent < self.progress || (percent == self.progress && eta_secs == self.eta_secs) {
            return false;
        }
        self.progress = percent;
        self.eta_secs = eta_secs;
        self.updated_at = Utc::now();
        true
    }

    /// Wall-clock run time for finished jobs, in milliseconds.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        u64::try_from((finished - started).num_milliseconds()).ok()
    }
}
