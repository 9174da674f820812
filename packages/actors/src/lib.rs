//! Actor system for the render queue.
//!
//! # Architecture
//!
//! - `QueueActor` - Owns every job, enforces the concurrency ceiling and
//!   promotes queued jobs in arrival order
//! - `Renderer` - Executes one job in its own task and reports back
//! - `RenderQueue` - Client handle used by callers
//!
//! # Usage
//!
//! ```ignore
//! use actors::{RenderConfig, RenderQueue};
//!
//! let queue = RenderQueue::start(RenderConfig::from_env()?, transcoder).await?;
//! let job_id = queue.enqueue(recipe).await?;
//! let job = queue.get_job(job_id).await?;
//! ```

mod config;
mod handle;
mod messages;
mod queue_actor;
mod renderer;

pub use config::{ConfigError, RenderConfig};
pub use handle::{RenderQueue, StartError};
pub use messages::{EnqueueError, QueueError, QueueMessage, RenderOutcome};
pub use queue_actor::{QueueActor, QueueActorArgs};
pub use renderer::{ProgressSink, Renderer};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
