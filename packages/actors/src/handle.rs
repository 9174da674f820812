//! Client handle for the render queue.

use std::sync::Arc;

use ractor::{Actor, ActorRef};
use render_core::{Job, JobEvent, JobId, JobStatus, QueueStats, RecipeDef};
use storage::{ArtifactStore, StorageError};
use tokio::sync::broadcast;
use transcoder::Transcode;

use crate::config::{ConfigError, RenderConfig};
use crate::messages::{EnqueueError, QueueError, QueueMessage};
use crate::queue_actor::{QueueActor, QueueActorArgs};
use crate::renderer::Renderer;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to spawn render queue: {0}")]
    Spawn(#[from] ractor::SpawnErr),
}

/// Cheap, cloneable handle to a running render queue.
///
/// Every call is a message to the queue actor; none of them wait on
/// rendering.
#[derive(Clone)]
pub struct RenderQueue {
    actor: ActorRef<QueueMessage>,
    event_tx: broadcast::Sender<JobEvent>,
    store: ArtifactStore,
}

impl RenderQueue {
    /// Open the artifact store and spawn the queue actor.
    pub async fn start(
        config: RenderConfig,
        transcoder: Arc<dyn Transcode>,
    ) -> Result<Self, StartError> {
        config.validate()?;
        let store = ArtifactStore::new(config.storage.clone())?;
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let args = QueueActorArgs {
            max_concurrent: config.max_concurrent,
            retention: config.retention,
            housekeeping_interval: config.housekeeping_interval,
            renderer: Arc::new(Renderer::new(store.clone(), transcoder)),
            event_tx: event_tx.clone(),
        };
        let (actor, _handle) = Actor::spawn(None, QueueActor, args).await?;

        Ok(Self {
            actor,
            event_tx,
            store,
        })
    }

    /// Artifact store the queue renders into.
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Validate and admit a recipe. Invalid recipes create no job.
    pub async fn enqueue(&self, recipe: RecipeDef) -> Result<JobId, EnqueueError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(QueueMessage::Enqueue {
                recipe: Box::new(recipe),
                reply: tx.into(),
            })
            .map_err(|_| QueueError::Unavailable)?;

        rx.await
            .map_err(|_| QueueError::Unavailable)?
            .map_err(EnqueueError::Invalid)
    }

    /// Snapshot of a job; `None` for unknown or evicted IDs.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(QueueMessage::GetJob {
                job_id,
                reply: tx.into(),
            })
            .map_err(|_| QueueError::Unavailable)?;

        rx.await.map_err(|_| QueueError::Unavailable)
    }

    /// Request cancellation.
    ///
    /// Returns `true` when the request took effect: a queued job is cancelled
    /// at once, a running one is signalled and becomes `cancelled` once its
    /// render has stopped. Unknown, finished or already-signalled jobs give
    /// `false`.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(QueueMessage::Cancel {
                job_id,
                reply: tx.into(),
            })
            .map_err(|_| QueueError::Unavailable)?;

        rx.await.map_err(|_| QueueError::Unavailable)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(QueueMessage::GetStats { reply: tx.into() })
            .map_err(|_| QueueError::Unavailable)?;

        rx.await.map_err(|_| QueueError::Unavailable)
    }

    /// Jobs in admission order, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status_filter: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(QueueMessage::ListJobs {
                status_filter,
                limit,
                reply: tx.into(),
            })
            .map_err(|_| QueueError::Unavailable)?;

        rx.await.map_err(|_| QueueError::Unavailable)
    }

    /// Live job events. Slow receivers may observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    /// Cancel running renders and stop the queue.
    pub fn shutdown(&self) {
        let _ = self.actor.send_message(QueueMessage::Shutdown);
    }
}
