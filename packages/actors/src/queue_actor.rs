//! Queue actor owning every render job.
//!
//! All job state lives here and is only touched from the actor's message
//! handler, so slot accounting and promotion of the next queued job happen in
//! one step. Renders run in their own tasks and report back by message.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use render_core::{Job, JobEvent, JobId, JobStatus, QueueStats, RetentionPolicy};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::messages::{QueueMessage, RenderOutcome};
use crate::renderer::Renderer;

/// Arguments for spawning a [`QueueActor`].
pub struct QueueActorArgs {
    pub max_concurrent: usize,
    pub retention: RetentionPolicy,
    pub housekeeping_interval: Duration,
    pub renderer: Arc<Renderer>,
    pub event_tx: broadcast::Sender<JobEvent>,
}

/// Bookkeeping for a job that holds a render slot.
struct RunningJob {
    cancel: CancellationToken,
    /// Set once a cancel was accepted; the job stays running until the
    /// render task acknowledges.
    cancel_requested: bool,
}

/// State for the queue actor.
pub struct QueueActorState {
    max_concurrent: usize,
    retention: RetentionPolicy,
    renderer: Arc<Renderer>,
    /// All known jobs by ID.
    jobs: HashMap<JobId, Job>,
    /// Job IDs in admission order, for listing.
    arrivals: Vec<JobId>,
    /// Queued jobs, head first.
    pending: VecDeque<JobId>,
    running: HashMap<JobId, RunningJob>,
    event_tx: broadcast::Sender<JobEvent>,
}

impl QueueActorState {
    fn new(args: QueueActorArgs) -> Self {
        Self {
            max_concurrent: args.max_concurrent,
            retention: args.retention,
            renderer: args.renderer,
            jobs: HashMap::new(),
            arrivals: Vec::new(),
            pending: VecDeque::new(),
            running: HashMap::new(),
            event_tx: args.event_tx,
        }
    }

    /// Broadcast an event. Having no subscribers is fine.
    fn broadcast(&self, event: JobEvent) {
        tracing::debug!("{}", event.description());
        let _ = self.event_tx.send(event);
    }

    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            capacity: self.max_concurrent as u64,
            ..Default::default()
        };
        for job in self.jobs.values() {
            stats.tally(job.status);
        }
        stats
    }

    /// Fill free slots from the head of the queue.
    fn promote(&mut self, myself: &ActorRef<QueueMessage>) {
        while self.running.len() < self.max_concurrent {
            let Some(job_id) = self.pending.pop_front() else {
                break;
            };
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if let Err(e) = job.mark_running() {
                tracing::warn!("Skipping queued job: {}", e);
                continue;
            }

            let recipe = job.recipe.clone();
            let cancel = CancellationToken::new();
            self.running.insert(
                job_id,
                RunningJob {
                    cancel: cancel.clone(),
                    cancel_requested: false,
                },
            );

            tracing::info!(
                "Starting job {} ({} running, {} queued)",
                job_id,
                self.running.len(),
                self.pending.len()
            );
            self.broadcast(JobEvent::JobStarted {
                job_id,
                timestamp: Utc::now(),
            });

            spawn_render(myself.clone(), self.renderer.clone(), job_id, recipe, cancel);
        }
    }

    async fn finish(&mut self, job_id: JobId, outcome: RenderOutcome) {
        let Some(run) = self.running.remove(&job_id) else {
            tracing::warn!("Ignoring result for job {} which is not running", job_id);
            return;
        };
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let now = Utc::now();

        let event = match outcome {
            RenderOutcome::Completed(path) if run.cancel_requested => {
                // The render beat the cancel; the cancel still wins.
                if let Err(e) = self.renderer.store().remove(&path).await {
                    tracing::warn!("Failed to remove artifact of cancelled job {}: {}", job_id, e);
                }
                job.mark_cancelled().ok().map(|_| JobEvent::JobCancelled {
                    job_id,
                    was_running: true,
                    timestamp: now,
                })
            }
            RenderOutcome::Completed(path) => {
                job.mark_completed(path.clone()).ok().map(|_| JobEvent::JobCompleted {
                    job_id,
                    output_path: path,
                    duration_ms: job.duration_ms().unwrap_or(0),
                    timestamp: now,
                })
            }
            RenderOutcome::Failed(_) | RenderOutcome::Cancelled if run.cancel_requested => {
                job.mark_cancelled().ok().map(|_| JobEvent::JobCancelled {
                    job_id,
                    was_running: true,
                    timestamp: now,
                })
            }
            RenderOutcome::Failed(error) => {
                job.mark_failed(error.clone()).ok().map(|_| JobEvent::JobFailed {
                    job_id,
                    error,
                    timestamp: now,
                })
            }
            RenderOutcome::Cancelled => job.mark_cancelled().ok().map(|_| JobEvent::JobCancelled {
                job_id,
                was_running: true,
                timestamp: now,
            }),
        };

        match event {
            Some(event) => {
                tracing::info!("{}", event.description());
                let _ = self.event_tx.send(event);
            }
            None => tracing::warn!("Job {} was already {}", job_id, job.status),
        }
    }

    fn cancel(&mut self, job_id: JobId) -> bool {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };

        match job.status {
            JobStatus::Queued => {
                self.pending.retain(|id| *id != job_id);
                if job.mark_cancelled().is_err() {
                    return false;
                }
                let event = JobEvent::JobCancelled {
                    job_id,
                    was_running: false,
                    timestamp: Utc::now(),
                };
                tracing::info!("{}", event.description());
                let _ = self.event_tx.send(event);
                true
            }
            JobStatus::Running => match self.running.get_mut(&job_id) {
                Some(run) if !run.cancel_requested => {
                    tracing::info!("Cancelling running job {}", job_id);
                    run.cancel_requested = true;
                    run.cancel.cancel();
                    true
                }
                _ => false,
            },
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }

    /// Apply the retention policy. Returns how many jobs were dropped.
    fn evict_finished(&mut self) -> usize {
        let mut finished: Vec<(chrono::DateTime<Utc>, JobId)> = self
            .jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .map(|j| (j.finished_at.unwrap_or(j.updated_at), j.id))
            .collect();
        finished.sort();

        let cutoff = chrono::TimeDelta::from_std(self.retention.max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let over_cap = finished
            .len()
            .saturating_sub(self.retention.max_finished_jobs);

        let evicted: Vec<JobId> = finished
            .iter()
            .enumerate()
            .filter(|(i, (finished_at, _))| *i < over_cap || cutoff.is_some_and(|c| *finished_at < c))
            .map(|(_, (_, id))| *id)
            .collect();

        if evicted.is_empty() {
            return 0;
        }
        for job_id in &evicted {
            self.jobs.remove(job_id);
            self.broadcast(JobEvent::JobEvicted {
                job_id: *job_id,
                timestamp: Utc::now(),
            });
        }
        self.arrivals.retain(|id| self.jobs.contains_key(id));
        tracing::info!("Evicted {} finished jobs", evicted.len());
        evicted.len()
    }
}

/// Run a render in its own task and report the outcome to the queue.
fn spawn_render(
    queue: ActorRef<QueueMessage>,
    renderer: Arc<Renderer>,
    job_id: JobId,
    recipe: render_core::Recipe,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let progress_queue = queue.clone();
        let render = tokio::spawn(async move {
            let sink = move |percent: u8, eta_secs: Option<u64>| {
                let _ = progress_queue.send_message(QueueMessage::Progress {
                    job_id,
                    percent,
                    eta_secs,
                });
            };
            renderer.execute(job_id, &recipe, cancel, &sink).await
        });

        let outcome = match render.await {
            Ok(outcome) => outcome,
            Err(e) => RenderOutcome::Failed(format!("renderer task aborted: {e}")),
        };
        if queue
            .send_message(QueueMessage::RenderFinished { job_id, outcome })
            .is_err()
        {
            tracing::warn!("Queue stopped before job {} finished", job_id);
        }
    });
}

/// Queue actor that schedules render jobs.
pub struct QueueActor;

impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = QueueActorState;
    type Arguments = QueueActorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        if args.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".into());
        }
        tracing::info!(
            "Starting render queue (max {} concurrent, output in {})",
            args.max_concurrent,
            args.renderer.store().root().display()
        );

        // Start periodic tick
        let interval_len = args.housekeeping_interval.max(Duration::from_millis(10));
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_len);
            interval.tick().await;
            loop {
                interval.tick().await;
                if myself_clone.send_message(QueueMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(QueueActorState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Enqueue { recipe, reply } => {
                let recipe = match (*recipe).into_recipe() {
                    Ok(recipe) => recipe,
                    Err(validation) => {
                        tracing::info!(
                            "Rejected recipe with {} error(s)",
                            validation.errors.len()
                        );
                        let _ = reply.send(Err(validation));
                        return Ok(());
                    }
                };

                let job = Job::new(recipe);
                let job_id = job.id;
                let format = job.recipe.format;
                state.jobs.insert(job_id, job);
                state.arrivals.push(job_id);
                state.pending.push_back(job_id);

                state.broadcast(JobEvent::JobEnqueued {
                    job_id,
                    format,
                    timestamp: Utc::now(),
                });
                let _ = reply.send(Ok(job_id));

                state.promote(&myself);
            }

            QueueMessage::GetJob { job_id, reply } => {
                let _ = reply.send(state.jobs.get(&job_id).cloned());
            }

            QueueMessage::Cancel { job_id, reply } => {
                let _ = reply.send(state.cancel(job_id));
            }

            QueueMessage::GetStats { reply } => {
                let _ = reply.send(state.stats());
            }

            QueueMessage::ListJobs {
                status_filter,
                limit,
                reply,
            } => {
                let jobs: Vec<Job> = state
                    .arrivals
                    .iter()
                    .filter_map(|id| state.jobs.get(id))
                    .filter(|j| status_filter.is_none_or(|s| j.status == s))
                    .take(limit)
                    .cloned()
                    .collect();
                let _ = reply.send(jobs);
            }

            QueueMessage::Progress {
                job_id,
                percent,
                eta_secs,
            } => {
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    return Ok(());
                };
                if job.record_progress(percent, eta_secs) {
                    let event = JobEvent::JobProgress {
                        job_id,
                        progress: job.progress,
                        eta_secs: job.eta_secs,
                        timestamp: Utc::now(),
                    };
                    state.broadcast(event);
                }
            }

            QueueMessage::RenderFinished { job_id, outcome } => {
                state.finish(job_id, outcome).await;
                state.promote(&myself);
            }

            QueueMessage::Tick => {
                state.evict_finished();
            }

            QueueMessage::Shutdown => {
                tracing::info!(
                    "Shutting down render queue ({} running, {} queued)",
                    state.running.len(),
                    state.pending.len()
                );
                for run in state.running.values() {
                    run.cancel.cancel();
                }
                myself.stop(None);
                return Ok(());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use render_core::{Effects, FormatOptions, OutputFormat, Recipe, SourceKind, Step};
    use storage::{ArtifactStore, ArtifactStoreConfig};
    use transcoder::{ProgressFn, SegmentRequest, Transcode, TranscodeFuture, TranscodeRequest};

    use super::*;

    struct NoopTranscoder;

    impl Transcode for NoopTranscoder {
        fn transcode<'a>(
            &'a self,
            _request: &'a TranscodeRequest,
            _cancel: &'a CancellationToken,
            _progress: &'a ProgressFn<'a>,
        ) -> TranscodeFuture<'a> {
            Box::pin(async { Ok(()) })
        }

        fn segment<'a>(
            &'a self,
            _request: &'a SegmentRequest,
            _cancel: &'a CancellationToken,
            _progress: &'a ProgressFn<'a>,
        ) -> TranscodeFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    fn state(dir: &std::path::Path, retention: RetentionPolicy) -> QueueActorState {
        let store = ArtifactStore::new(ArtifactStoreConfig::new(dir)).unwrap();
        let (event_tx, _) = broadcast::channel(16);
        QueueActorState::new(QueueActorArgs {
            max_concurrent: 1,
            retention,
            housekeeping_interval: Duration::from_secs(30),
            renderer: Arc::new(Renderer::new(store, Arc::new(NoopTranscoder))),
            event_tx,
        })
    }

    fn recipe() -> Recipe {
        Recipe {
            width: 320,
            height: 240,
            fps: 25,
            format: OutputFormat::Gif,
            steps: vec![Step {
                source: PathBuf::from("/in/a.png"),
                kind: SourceKind::Image,
                duration_secs: 1.0,
                trim_start_secs: None,
            }],
            audio: None,
            effects: Effects::default(),
            options: FormatOptions::default(),
        }
    }

    fn finished_job(age_secs: i64) -> Job {
        let mut job = Job::new(recipe());
        job.mark_running().unwrap();
        job.mark_failed("boom").unwrap();
        job.finished_at = Some(Utc::now() - chrono::TimeDelta::seconds(age_secs));
        job
    }

    fn insert(state: &mut QueueActorState, job: Job) -> JobId {
        let id = job.id;
        state.arrivals.push(id);
        state.jobs.insert(id, job);
        id
    }

    #[tokio::test]
    async fn evicts_jobs_past_their_retention_age() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state(dir.path(), RetentionPolicy::default());
        let old = insert(&mut state, finished_job(2 * 60 * 60));
        let fresh = insert(&mut state, finished_job(5));

        assert_eq!(state.evict_finished(), 1);
        assert!(!state.jobs.contains_key(&old));
        assert!(state.jobs.contains_key(&fresh));
        assert_eq!(state.arrivals, vec![fresh]);
    }

    #[tokio::test]
    async fn caps_finished_jobs_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state(
            dir.path(),
            RetentionPolicy {
                max_age: Duration::from_secs(3600),
                max_finished_jobs: 2,
            },
        );
        let oldest = insert(&mut state, finished_job(30));
        let middle = insert(&mut state, finished_job(20));
        let newest = insert(&mut state, finished_job(10));
        let queued = Job::new(state.jobs[&newest].recipe.clone());
        let queued = insert(&mut state, queued);

        assert_eq!(state.evict_finished(), 1);
        assert!(!state.jobs.contains_key(&oldest));
        for id in [middle, newest, queued] {
            assert!(state.jobs.contains_key(&id));
        }
        assert_eq!(state.evict_finished(), 0);
    }

    #[tokio::test]
    async fn cancel_of_unknown_or_finished_job_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state(dir.path(), RetentionPolicy::default());
        let done = insert(&mut state, finished_job(1));

        assert!(!state.cancel(JobId::new()));
        assert!(!state.cancel(done));
        assert_eq!(state.stats().failed, 1);
    }

    #[tokio::test]
    async fn zero_ceiling_refuses_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(ArtifactStoreConfig::new(dir.path())).unwrap();
        let (event_tx, _) = broadcast::channel(16);
        let args = QueueActorArgs {
            max_concurrent: 0,
            retention: RetentionPolicy::default(),
            housekeeping_interval: Duration::from_secs(30),
            renderer: Arc::new(Renderer::new(store, Arc::new(NoopTranscoder))),
            event_tx,
        };

        assert!(Actor::spawn(None, QueueActor, args).await.is_err());
    }

    fn running_job_with_accepted_cancel(state: &mut QueueActorState) -> JobId {
        let mut job = Job::new(recipe());
        job.mark_running().unwrap();
        let id = insert(state, job);
        state.running.insert(
            id,
            RunningJob {
                cancel: CancellationToken::new(),
                cancel_requested: false,
            },
        );
        assert!(state.cancel(id));
        id
    }

    #[tokio::test]
    async fn completion_after_accepted_cancel_ends_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state(dir.path(), RetentionPolicy::default());
        let id = running_job_with_accepted_cancel(&mut state);
        let artifact = state.renderer.store().output_path(id, OutputFormat::Gif);
        std::fs::write(&artifact, b"GIF89a").unwrap();

        state.finish(id, RenderOutcome::Completed(artifact.clone())).await;

        let job = &state.jobs[&id];
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.output_path, None);
        assert_eq!(job.error, None);
        assert!(!artifact.exists());
        assert!(state.running.is_empty());
    }

    #[tokio::test]
    async fn failure_after_accepted_cancel_ends_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state(dir.path(), RetentionPolicy::default());
        let id = running_job_with_accepted_cancel(&mut state);

        state
            .finish(id, RenderOutcome::Failed("transcoder exited with status 1: x".into()))
            .await;

        let job = &state.jobs[&id];
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error, None);
        assert_eq!(state.stats().failed, 0);
    }
}
