//! Queue-level types: statistics and retention.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Point-in-time counts of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Configured concurrency ceiling.
    pub capacity: u64,
}

impl QueueStats {
    /// Count one job in its status bucket.
    pub fn tally(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Jobs still waiting or executing.
    pub fn active(&self) -> u64 {
        self.queued + self.running
    }

    /// Jobs in a terminal state.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }

    pub fn free_slots(&self) -> u64 {
        self.capacity.saturating_sub(self.running)
    }
}

/// How long terminal jobs stay queryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Terminal jobs older than this are evicted.
    pub max_age: Duration,
    /// Upper bound on retained terminal jobs; the oldest go first.
    pub max_finished_jobs: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(60 * 60),
            max_finished_jobs: 1000,
        }
    }
}
