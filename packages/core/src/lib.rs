//! Core domain types for the render job pipeline.
//!
//! This crate contains shared types used across all packages:
//! - Recipe, RecipeDef and the recipe validator
//! - Job and JobStatus for render work items
//! - Output formats and per-format options
//! - Queue statistics, retention and events

mod events;
mod format;
mod job;
mod queue;
mod recipe;
mod validate;

pub use events::JobEvent;
pub use format::{
    AUDIO_EXTENSIONS, FormatOptions, IMAGE_EXTENSIONS, OutputFormat, Quality, SourceKind,
    UnsupportedFormat, VIDEO_EXTENSIONS,
};
pub use job::{Job, JobId, JobStatus, TransitionError};
pub use queue::{QueueStats, RetentionPolicy};
pub use recipe::{AudioDef, AudioTrack, Effects, EffectsDef, Recipe, RecipeDef, Step, StepDef};
pub use validate::{Validation, validate};
