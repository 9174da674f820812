//! Event types for live job updates.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, OutputFormat};

/// Events emitted by the render queue.
///
/// Polling a job is the source of truth; events only let subscribers avoid
/// polling in a tight loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A new job was admitted.
    JobEnqueued {
        job_id: JobId,
        format: OutputFormat,
        timestamp: DateTime<Utc>,
    },
    /// A job was given a render slot.
    JobStarted {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// Progress update from the renderer.
    JobProgress {
        job_id: JobId,
        progress: u8,
        eta_secs: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: JobId,
        output_path: PathBuf,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job failed.
    JobFailed {
        job_id: JobId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A job was cancelled.
    JobCancelled {
        job_id: JobId,
        /// Whether the job had started rendering.
        was_running: bool,
        timestamp: DateTime<Utc>,
    },
    /// A finished job was dropped by the retention policy.
    JobEvicted {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobEnqueued { timestamp, .. }
            | JobEvent::JobStarted { timestamp, .. }
            | JobEvent::JobProgress { timestamp, .. }
            | JobEvent::JobCompleted { timestamp, .. }
            | JobEvent::JobFailed { timestamp, .. }
            | JobEvent::JobCancelled { timestamp, .. }
            | JobEvent::JobEvicted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event.
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::JobEnqueued { job_id, .. }
            | JobEvent::JobStarted { job_id, .. }
            | JobEvent::JobProgress { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobFailed { job_id, .. }
            | JobEvent::JobCancelled { job_id, .. }
            | JobEvent::JobEvicted { job_id, .. } => *job_id,
        }
    }

    /// Whether the event ends the job's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::JobCompleted { .. } | JobEvent::JobFailed { .. } | JobEvent::JobCancelled { .. }
        )
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobEnqueued { job_id, format, .. } => {
                format!("Job {} enqueued ({})", job_id, format)
            }
            JobEvent::JobStarted { job_id, .. } => format!("Job {} started", job_id),
            JobEvent::JobProgress {
                job_id,
                progress,
                eta_secs,
                ..
            } => match eta_secs {
                Some(eta) => format!("Job {} at {}% (~{}s left)", job_id, progress, eta),
                None => format!("Job {} at {}%", job_id, progress),
            },
            JobEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            JobEvent::JobFailed { job_id, error, .. } => {
                format!("Job {} failed: {}", job_id, error)
            }
            JobEvent::JobCancelled {
                job_id,
                was_running,
                ..
            } => {
                let when = if *was_running { "while running" } else { "before start" };
                format!("Job {} cancelled {}", job_id, when)
            }
            JobEvent::JobEvicted { job_id, .. } => format!("Job {} evicted", job_id),
        }
    }
}
