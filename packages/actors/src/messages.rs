//! Message types for actor communication.

use std::path::PathBuf;

use ractor::RpcReplyPort;
use render_core::{Job, JobId, JobStatus, QueueStats, RecipeDef, Validation};

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Validate a recipe and admit it as a queued job.
    Enqueue {
        recipe: Box<RecipeDef>,
        reply: RpcReplyPort<Result<JobId, Validation>>,
    },

    /// Get a job snapshot by ID.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<Job>>,
    },

    /// Cancel a job. Replies whether the request took effect.
    Cancel {
        job_id: JobId,
        reply: RpcReplyPort<bool>,
    },

    GetStats { reply: RpcReplyPort<QueueStats> },

    /// List jobs in arrival order.
    ListJobs {
        status_filter: Option<JobStatus>,
        limit: usize,
        reply: RpcReplyPort<Vec<Job>>,
    },

    /// Progress pushed by a render task.
    Progress {
        job_id: JobId,
        percent: u8,
        eta_secs: Option<u64>,
    },

    /// A render task returned.
    RenderFinished {
        job_id: JobId,
        outcome: RenderOutcome,
    },

    /// Periodic tick for housekeeping.
    Tick,

    /// Cancel running renders and stop the actor.
    Shutdown,
}

/// How a single render ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The artifact was promoted to this path.
    Completed(PathBuf),
    /// Concise diagnostic for the job record.
    Failed(String),
    Cancelled,
}

/// The queue actor is gone or did not answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("render queue is unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// The recipe was rejected; no job was created.
    #[error("invalid recipe: {0}")]
    Invalid(Validation),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
