//! Transcoder adapter around the external ffmpeg executable.
//!
//! The adapter takes an input artifact, a target [`OutputFormat`] and
//! per-format [`FormatOptions`], and materializes an output file. Each
//! format has a fixed invocation profile (see [`profile`]); unsupported
//! formats and bad inputs are rejected before any process is spawned.
//!
//! The [`Transcode`] trait is the seam the renderer depends on, so tests can
//! substitute a fake transcoder.

mod error;
pub mod profile;
mod progress;
mod runner;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use render_core::{FormatOptions, OutputFormat, SourceKind};
use tokio_util::sync::CancellationToken;

pub use error::TranscodeError;
pub use profile::{CONCAT_EXTENSION, FormatDefaults, ResolvedOptions, SEGMENT_EXTENSION, VideoFilter};
pub use progress::ProgressParser;
pub use runner::{FfmpegTranscoder, TranscoderConfig};

/// Callback receiving the completed fraction (0.0..=1.0).
pub type ProgressFn<'a> = dyn Fn(f64) + Send + Sync + 'a;

/// Future type for transcode calls.
pub type TranscodeFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TranscodeError>> + Send + 'a>>;

/// A separate audio input muxed into the output.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioInput {
    pub path: PathBuf,
    /// Linear gain, 1.0 leaves the level unchanged.
    pub volume: Option<f64>,
}

/// Everything needed for one transcode invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: OutputFormat,
    pub options: FormatOptions,
    pub audio: Option<AudioInput>,
    /// Applied before the format's own filter chain. Fades also apply to
    /// the audio stream.
    pub filters: Vec<VideoFilter>,
    /// Output length. When set the output is cut to it, a shorter audio
    /// track is padded with silence, and it is the progress reference.
    pub duration_secs: Option<f64>,
}

impl TranscodeRequest {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            format,
            options: FormatOptions::default(),
            audio: None,
            filters: Vec::new(),
            duration_secs: None,
        }
    }

    pub fn with_options(mut self, options: FormatOptions) -> Self {
        self.options = options;
        self
    }
}

/// Normalize one source into an intermediate segment.
///
/// Every segment of a render shares codec, canvas, frame rate and pixel
/// format, so segments can be joined by the concat demuxer whatever the
/// sources were. Segments carry no audio.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRequest {
    pub source: PathBuf,
    pub kind: SourceKind,
    /// Must use [`SEGMENT_EXTENSION`].
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Seek into a video source; ignored for images.
    pub start_secs: f64,
    /// Exact segment length. Short video is held on its last frame.
    pub duration_secs: f64,
}

/// Anything that can run transcodes.
///
/// Implementations must delete partial output on failure or cancellation,
/// and must only return after any external process has exited.
pub trait Transcode: Send + Sync + 'static {
    /// Produce `request.output` in the requested format.
    fn transcode<'a>(
        &'a self,
        request: &'a TranscodeRequest,
        cancel: &'a CancellationToken,
        progress: &'a ProgressFn<'a>,
    ) -> TranscodeFuture<'a>;

    /// Produce one intermediate segment.
    fn segment<'a>(
        &'a self,
        request: &'a SegmentRequest,
        cancel: &'a CancellationToken,
        progress: &'a ProgressFn<'a>,
    ) -> TranscodeFuture<'a>;
}

/// Standalone conversion of an existing file.
///
/// The format name is checked first, so an unsupported format fails with the
/// list of supported ones and nothing is spawned. The output lands in
/// `output_dir` as `<input stem>-<ulid>.<ext>`, unique per call.
pub async fn convert(
    transcoder: &dyn Transcode,
    input: &Path,
    output_dir: &Path,
    format: &str,
    options: FormatOptions,
    cancel: &CancellationToken,
    progress: &ProgressFn<'_>,
) -> Result<PathBuf, TranscodeError> {
    let format: OutputFormat = format.parse()?;

    let problems = options.check();
    if !problems.is_empty() {
        return Err(TranscodeError::InvalidOptions(problems));
    }

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TranscodeError::InvalidInput("input has no file name".to_string()))?;

    let output = output_dir.join(format!(
        "{}-{}.{}",
        stem,
        ulid::Ulid::new().to_string().to_ascii_lowercase(),
        format.extension()
    ));

    let request = TranscodeRequest::new(input, &output, format).with_options(options);
    tracing::info!(
        "Converting {} to {}",
        runner::file_label(input),
        format
    );
    transcoder.transcode(&request, cancel, progress).await?;
    Ok(output)
}
