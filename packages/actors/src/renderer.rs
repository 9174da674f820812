//! Executes one admitted recipe from staging to a promoted artifact.
//!
//! Each job gets a scratch directory in the artifact store. Step sources are
//! staged there under predictable names and each one is encoded into a
//! segment with the recipe's canvas and frame rate. A concat manifest joins
//! the segments into a single timeline, and the transcoder turns that manifest
//! into the requested format. Audio-only outputs skip the segments and are cut
//! from the staged track. Only a finished file is moved into the store, so a
//! failed or cancelled job never leaves an artifact behind.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use render_core::{JobId, Recipe};
use storage::{ArtifactStore, StorageError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transcoder::{
    AudioInput, CONCAT_EXTENSION, SEGMENT_EXTENSION, SegmentRequest, Transcode, TranscodeError,
    TranscodeRequest, VideoFilter,
};

use crate::messages::RenderOutcome;

/// Receives `(percent, eta_secs)` whenever the percentage increases.
pub type ProgressSink<'a> = dyn Fn(u8, Option<u64>) + Send + Sync + 'a;

/// Share of the progress bar spent on staging inputs.
const STAGING_SHARE: f64 = 10.0;
/// Segment encoding ends here.
const SEGMENTS_END: f64 = 60.0;
/// Transcoding ends here; the last percent is reserved for promotion.
const TRANSCODE_END: f64 = 99.0;

/// Reported instead of the spawn error, which names the binary's location.
const SPAWN_FAILURE: &str = "transcoder could not be started";

const MANIFEST_NAME: &str = "scene";

#[derive(Debug, thiserror::Error)]
enum RenderError {
    #[error("step {step} source is missing: {name}")]
    MissingSource { step: usize, name: String },

    #[error("step {step} source is not a file: {name}")]
    NotAFile { step: usize, name: String },

    #[error("audio source is missing: {name}")]
    MissingAudio { name: String },

    #[error("{format} output needs an audio track")]
    NoAudio { format: render_core::OutputFormat },

    #[error("could not stage {name}: {source}")]
    Stage {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write the scene manifest: {0}")]
    Manifest(std::io::Error),

    #[error("{0}")]
    Transcode(String),

    #[error("step {step}: {reason}")]
    Segment { step: usize, reason: String },

    #[error("could not store the output: {0}")]
    Store(#[from] StorageError),

    #[error("cancelled")]
    Cancelled,
}

/// Runs render jobs against an artifact store and a transcoder.
#[derive(Clone)]
pub struct Renderer {
    store: ArtifactStore,
    transcoder: Arc<dyn Transcode>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Renderer {
    pub fn new(store: ArtifactStore, transcoder: Arc<dyn Transcode>) -> Self {
        Self { store, transcoder }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Render one job. Never panics on bad input; every problem becomes a
    /// [`RenderOutcome::Failed`] with a short diagnostic.
    pub async fn execute(
        &self,
        job_id: JobId,
        recipe: &Recipe,
        cancel: CancellationToken,
        progress: &ProgressSink<'_>,
    ) -> RenderOutcome {
        let started = Instant::now();
        let tracker = ProgressTracker::new(progress);

        let outcome = match self.store.prepare_work_dir(job_id).await {
            Ok(work_dir) => {
                let result = self
                    .run_pipeline(job_id, recipe, &work_dir, &cancel, &tracker)
                    .await;
                self.store.discard_work_dir(job_id).await;
                match result {
                    Ok(output) => RenderOutcome::Completed(output),
                    Err(RenderError::Cancelled) => RenderOutcome::Cancelled,
                    Err(e) => RenderOutcome::Failed(scrub_paths(
                        &e.to_string(),
                        &[work_dir.as_path(), self.store.root()],
                    )),
                }
            }
            Err(e) => RenderOutcome::Failed(format!("could not prepare a work directory: {e}")),
        };

        match &outcome {
            RenderOutcome::Completed(path) => info!(
                "Rendered job {} to {} in {:?}",
                job_id,
                path.display(),
                started.elapsed()
            ),
            RenderOutcome::Failed(reason) => warn!("Render of job {} failed: {}", job_id, reason),
            RenderOutcome::Cancelled => info!("Render of job {} cancelled", job_id),
        }
        outcome
    }

    async fn run_pipeline(
        &self,
        job_id: JobId,
        recipe: &Recipe,
        work_dir: &Path,
        cancel: &CancellationToken,
        tracker: &ProgressTracker<'_>,
    ) -> Result<PathBuf, RenderError> {
        let (staged, audio) = stage_inputs(recipe, work_dir, cancel, tracker).await?;

        let output = work_dir.join(format!("output.{}", recipe.format.extension()));
        let (input, audio, progress_from) = if recipe.format.is_audio_only() {
            let audio = audio.ok_or(RenderError::NoAudio {
                format: recipe.format,
            })?;
            (audio.path.clone(), Some(audio), STAGING_SHARE)
        } else {
            let manifest = self
                .encode_segments(job_id, recipe, work_dir, &staged, cancel, tracker)
                .await?;
            (manifest, audio, SEGMENTS_END)
        };

        checkpoint(cancel)?;
        let request = TranscodeRequest {
            audio,
            filters: fade_filters(recipe),
            duration_secs: Some(recipe.total_duration_secs()),
            ..TranscodeRequest::new(&input, &output, recipe.format).with_options(recipe.options.clone())
        };

        let on_fraction = |fraction: f64| {
            tracker.report(progress_from + fraction.clamp(0.0, 1.0) * (TRANSCODE_END - progress_from));
        };
        self.transcoder
            .transcode(&request, cancel, &on_fraction)
            .await
            .map_err(|e| match transcode_failure(job_id, e) {
                Some(reason) => RenderError::Transcode(reason),
                None => RenderError::Cancelled,
            })?;

        checkpoint(cancel)?;
        let dest = self.store.output_path(job_id, recipe.format);
        self.store.promote(&output, &dest).await?;
        tracker.report(100.0);
        Ok(dest)
    }

    /// Encode every staged step into a uniform segment and write the manifest
    /// that joins them.
    async fn encode_segments(
        &self,
        job_id: JobId,
        recipe: &Recipe,
        work_dir: &Path,
        staged: &[PathBuf],
        cancel: &CancellationToken,
        tracker: &ProgressTracker<'_>,
    ) -> Result<PathBuf, RenderError> {
        let total = recipe.total_duration_secs().max(f64::EPSILON);
        let mut done_secs = 0.0;
        let mut segments = Vec::with_capacity(staged.len());

        for (i, (step, source)) in recipe.steps.iter().zip(staged).enumerate() {
            checkpoint(cancel)?;
            let name = format!("segment-{i:03}.{SEGMENT_EXTENSION}");
            let request = SegmentRequest {
                source: source.clone(),
                kind: step.kind,
                output: work_dir.join(&name),
                width: recipe.width,
                height: recipe.height,
                fps: recipe.fps,
                start_secs: step.trim_start_secs.unwrap_or(0.0),
                duration_secs: step.duration_secs,
            };

            let on_fraction = |fraction: f64| {
                let secs = done_secs + fraction.clamp(0.0, 1.0) * step.duration_secs;
                tracker.report(STAGING_SHARE + secs / total * (SEGMENTS_END - STAGING_SHARE));
            };
            self.transcoder
                .segment(&request, cancel, &on_fraction)
                .await
                .map_err(|e| {
                    let spawn = matches!(e, TranscodeError::Spawn { .. });
                    match transcode_failure(job_id, e) {
                        None => RenderError::Cancelled,
                        Some(reason) if spawn => RenderError::Transcode(reason),
                        Some(reason) => RenderError::Segment { step: i + 1, reason },
                    }
                })?;

            done_secs += step.duration_secs;
            segments.push(name);
        }

        let manifest = work_dir.join(format!("{MANIFEST_NAME}.{CONCAT_EXTENSION}"));
        tokio::fs::write(&manifest, concat_manifest(&segments))
            .await
            .map_err(RenderError::Manifest)?;
        debug!("Wrote scene manifest for job {} ({} segments)", job_id, segments.len());
        Ok(manifest)
    }
}

/// Copy step sources and the audio track into the work directory.
async fn stage_inputs(
    recipe: &Recipe,
    work_dir: &Path,
    cancel: &CancellationToken,
    tracker: &ProgressTracker<'_>,
) -> Result<(Vec<PathBuf>, Option<AudioInput>), RenderError> {
    let total_inputs = recipe.steps.len() + usize::from(recipe.audio.is_some());

    let mut staged = Vec::with_capacity(recipe.steps.len());
    for (i, step) in recipe.steps.iter().enumerate() {
        checkpoint(cancel)?;
        let number = i + 1;
        let name = file_label(&step.source);
        match tokio::fs::metadata(&step.source).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(RenderError::NotAFile { step: number, name }),
            Err(_) => return Err(RenderError::MissingSource { step: number, name }),
        }

        let dest = work_dir.join(format!("step-{:03}.{}", i, extension_of(&step.source)));
        stage(&step.source, &dest).await?;
        staged.push(dest);
        tracker.report(STAGING_SHARE * (i + 1) as f64 / total_inputs as f64);
    }

    let audio = match &recipe.audio {
        Some(track) => {
            checkpoint(cancel)?;
            if !tokio::fs::try_exists(&track.source).await.unwrap_or(false) {
                return Err(RenderError::MissingAudio {
                    name: file_label(&track.source),
                });
            }
            let staged_audio = work_dir.join(format!("audio.{}", extension_of(&track.source)));
            stage(&track.source, &staged_audio).await?;
            tracker.report(STAGING_SHARE);
            Some(AudioInput {
                path: staged_audio,
                volume: track.volume,
            })
        }
        None => None,
    };

    Ok((staged, audio))
}

/// Short diagnostic for a transcoder error, or `None` when it was cancelled.
fn transcode_failure(job_id: JobId, err: TranscodeError) -> Option<String> {
    match err {
        TranscodeError::Cancelled => None,
        TranscodeError::Failed { code, diagnostic } => {
            let last_line = diagnostic
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("no diagnostic output");
            let status = match code {
                Some(code) => format!("status {code}"),
                None => "a signal".to_string(),
            };
            Some(format!("transcoder exited with {status}: {last_line}"))
        }
        spawn @ TranscodeError::Spawn { .. } => {
            warn!("Job {}: {}", job_id, spawn);
            Some(SPAWN_FAILURE.to_string())
        }
        other => Some(other.to_string()),
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), RenderError> {
    if cancel.is_cancelled() {
        Err(RenderError::Cancelled)
    } else {
        Ok(())
    }
}

/// Place a source in the work directory, linking when the filesystem allows.
async fn stage(source: &Path, dest: &Path) -> Result<(), RenderError> {
    if tokio::fs::hard_link(source, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(source, dest)
        .await
        .map(|_| ())
        .map_err(|source_err| RenderError::Stage {
            name: file_label(source),
            source: source_err,
        })
}

/// Concat demuxer script over the encoded segments. Every segment already has
/// its final length, so no timing directives are needed.
fn concat_manifest(segments: &[String]) -> String {
    let mut out = String::from("ffconcat version 1.0\n");
    for name in segments {
        let _ = writeln!(out, "file '{}'", name);
    }
    out
}

/// Fades over the whole timeline. Canvas and frame rate are fixed by the
/// segments.
fn fade_filters(recipe: &Recipe) -> Vec<VideoFilter> {
    let mut filters = Vec::new();
    let total = recipe.total_duration_secs();
    if let Some(d) = recipe.effects.fade_in_secs.filter(|d| *d > 0.0) {
        filters.push(VideoFilter::FadeIn { duration_secs: d });
    }
    if let Some(d) = recipe.effects.fade_out_secs.filter(|d| *d > 0.0) {
        filters.push(VideoFilter::FadeOut {
            start_secs: (total - d).max(0.0),
            duration_secs: d,
        });
    }
    filters
}

/// Turns raw percentages into monotonic, de-duplicated reports with an ETA.
struct ProgressTracker<'a> {
    sink: &'a ProgressSink<'a>,
    started: Instant,
    last: AtomicU8,
}

impl<'a> ProgressTracker<'a> {
    fn new(sink: &'a ProgressSink<'a>) -> Self {
        Self {
            sink,
            started: Instant::now(),
            last: AtomicU8::new(0),
        }
    }

    fn report(&self, percent: f64) {
        let percent = percent.clamp(0.0, 100.0).floor() as u8;
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        if percent <= previous {
            return;
        }
        (self.sink)(percent, eta_secs(self.started.elapsed().as_secs_f64(), percent));
    }
}

/// Linear extrapolation from elapsed time. `None` until something is done.
fn eta_secs(elapsed_secs: f64, percent: u8) -> Option<u64> {
    if percent == 0 {
        return None;
    }
    let p = f64::from(percent);
    Some((elapsed_secs * (100.0 - p) / p).round() as u64)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<unnamed>".to_string())
}

/// Strip internal directories from a diagnostic so only file names remain.
fn scrub_paths(message: &str, dirs: &[&Path]) -> String {
    dirs.iter().fold(message.to_string(), |acc, dir| {
        let prefix = format!("{}{}", dir.display(), std::path::MAIN_SEPARATOR);
        acc.replace(&prefix, "")
    })
}
