//! Process runner for the ffmpeg executable.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use render_core::Quality;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TranscodeError;
use crate::profile::{FormatDefaults, SEGMENT_EXTENSION, build_args, build_segment_args};
use crate::progress::ProgressParser;
use crate::{ProgressFn, SegmentRequest, Transcode, TranscodeFuture, TranscodeRequest};

/// Keep at most this much of the diagnostic stream.
const MAX_DIAGNOSTIC_BYTES: usize = 16 * 1024;

/// Transcoder settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscoderConfig {
    /// Executable to run; looked up on `PATH` when not absolute.
    pub binary: PathBuf,
    pub defaults: FormatDefaults,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            defaults: FormatDefaults::default(),
        }
    }
}

impl TranscoderConfig {
    /// Build a config from environment variables.
    ///
    /// - `FFMPEG_BIN` (default: `ffmpeg`)
    /// - `TRANSCODE_DEFAULT_QUALITY` (`low`/`medium`/`high`, default: `medium`)
    /// - `TRANSCODE_LOOP_FPS` (default: 15)
    /// - `TRANSCODE_LOOP_WIDTH` (default: 480)
    /// - `TRANSCODE_AUDIO_BITRATE_KBPS` (default: 128)
    pub fn from_env() -> Result<Self, TranscodeError> {
        let mut cfg = Self::default();

        if let Some(bin) = env_value("FFMPEG_BIN") {
            cfg.binary = PathBuf::from(bin);
        }
        if let Some(q) = env_value("TRANSCODE_DEFAULT_QUALITY") {
            cfg.defaults.quality = q
                .parse::<Quality>()
                .map_err(|e| TranscodeError::InvalidConfig(format!("TRANSCODE_DEFAULT_QUALITY: {e}")))?;
        }
        if let Some(fps) = parse_u32_env("TRANSCODE_LOOP_FPS")? {
            cfg.defaults.loop_fps = fps;
        }
        if let Some(width) = parse_u32_env("TRANSCODE_LOOP_WIDTH")? {
            cfg.defaults.loop_width = width;
        }
        if let Some(kbps) = parse_u32_env("TRANSCODE_AUDIO_BITRATE_KBPS")? {
            cfg.defaults.audio_bitrate_kbps = kbps;
        }

        // Defaults go through the same range checks as per-request options.
        let as_options = render_core::FormatOptions {
            quality: None,
            fps: Some(cfg.defaults.loop_fps),
            width: Some(cfg.defaults.loop_width),
            loop_count: None,
            audio_bitrate_kbps: Some(cfg.defaults.audio_bitrate_kbps),
        };
        let problems = as_options.check();
        if !problems.is_empty() {
            return Err(TranscodeError::InvalidConfig(problems.join("; ")));
        }

        Ok(cfg)
    }
}

fn env_value(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().and_then(|v| {
        let trimmed = v.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_u32_env(var_name: &str) -> Result<Option<u32>, TranscodeError> {
    match env_value(var_name) {
        None => Ok(None),
        Some(v) => v.parse::<u32>().map(Some).map_err(|_| {
            TranscodeError::InvalidConfig(format!("invalid number for {var_name}={v}"))
        }),
    }
}

/// Runs ffmpeg as a child process, one process per request.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTranscoder {
    config: TranscoderConfig,
}

enum Exit {
    Finished(std::io::Result<ExitStatus>),
    Cancelled,
}

impl FfmpegTranscoder {
    pub fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    /// Whether the configured binary can be started at all.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.config.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Transcode one request.
    pub async fn run(
        &self,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
        progress: &ProgressFn<'_>,
    ) -> Result<(), TranscodeError> {
        check_input(&request.input).await?;
        check_output(&request.input, &request.output, request.format.extension()).await?;
        if let Some(audio) = &request.audio
            && !tokio::fs::try_exists(&audio.path).await.unwrap_or(false)
        {
            return Err(TranscodeError::InvalidInput(format!(
                "{} does not exist",
                file_label(&audio.path)
            )));
        }
        let args = build_args(request, &self.config.defaults)?;
        self.execute(args, &request.output, request.duration_secs, cancel, progress)
            .await
    }

    /// Encode one intermediate segment.
    pub async fn run_segment(
        &self,
        request: &SegmentRequest,
        cancel: &CancellationToken,
        progress: &ProgressFn<'_>,
    ) -> Result<(), TranscodeError> {
        check_input(&request.source).await?;
        check_output(&request.source, &request.output, SEGMENT_EXTENSION).await?;
        let args = build_segment_args(request)?;
        self.execute(
            args,
            &request.output,
            Some(request.duration_secs),
            cancel,
            progress,
        )
        .await
    }

    async fn execute(
        &self,
        args: Vec<OsString>,
        output: &Path,
        expected_duration_secs: Option<f64>,
        cancel: &CancellationToken,
        progress: &ProgressFn<'_>,
    ) -> Result<(), TranscodeError> {
        if cancel.is_cancelled() {
            return Err(TranscodeError::Cancelled);
        }

        debug!(
            "Running {} {}",
            self.config.binary.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                binary: self.config.binary.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut parser = ProgressParser::new(expected_duration_secs);
        let read_progress = async {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(fraction) = parser.feed(&line) {
                    progress(fraction);
                }
            }
        };

        let (exit, diagnostic, ()) = tokio::join!(
            wait_or_kill(&mut child, cancel),
            read_diagnostic(stderr),
            read_progress
        );

        match exit {
            Exit::Cancelled => {
                remove_partial(output).await;
                info!("Transcode of {} cancelled", file_label(output));
                Err(TranscodeError::Cancelled)
            }
            Exit::Finished(Err(e)) => {
                remove_partial(output).await;
                Err(TranscodeError::Io(e))
            }
            Exit::Finished(Ok(status)) if !status.success() => {
                remove_partial(output).await;
                let diagnostic = if diagnostic.trim().is_empty() {
                    "no diagnostic output".to_string()
                } else {
                    diagnostic.trim_end().to_string()
                };
                warn!(
                    "Transcoder exited with {:?} for {}",
                    status.code(),
                    file_label(output)
                );
                Err(TranscodeError::Failed {
                    code: status.code(),
                    diagnostic,
                })
            }
            Exit::Finished(Ok(_)) => {
                let len = tokio::fs::metadata(output)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                if len == 0 {
                    remove_partial(output).await;
                    return Err(TranscodeError::EmptyOutput);
                }
                progress(1.0);
                debug!("Wrote {} ({} bytes)", file_label(output), len);
                Ok(())
            }
        }
    }
}

impl Transcode for FfmpegTranscoder {
    fn transcode<'a>(
        &'a self,
        request: &'a TranscodeRequest,
        cancel: &'a CancellationToken,
        progress: &'a ProgressFn<'a>,
    ) -> TranscodeFuture<'a> {
        Box::pin(self.run(request, cancel, progress))
    }

    fn segment<'a>(
        &'a self,
        request: &'a SegmentRequest,
        cancel: &'a CancellationToken,
        progress: &'a ProgressFn<'a>,
    ) -> TranscodeFuture<'a> {
        Box::pin(self.run_segment(request, cancel, progress))
    }
}

/// Wait for the child, killing it if cancellation fires first. Returns only
/// after the process is gone.
async fn wait_or_kill(child: &mut Child, cancel: &CancellationToken) -> Exit {
    tokio::select! {
        status = child.wait() => Exit::Finished(status),
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill transcoder: {}", e);
            }
            Exit::Cancelled
        }
    }
}

async fn read_diagnostic<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = stream.read_to_end(&mut buf).await {
        debug!("Failed reading transcoder diagnostics: {}", e);
    }
    if buf.len() > MAX_DIAGNOSTIC_BYTES {
        buf.drain(..buf.len() - MAX_DIAGNOSTIC_BYTES);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn check_input(input: &Path) -> Result<(), TranscodeError> {
    match tokio::fs::metadata(input).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(TranscodeError::InvalidInput(format!(
            "{} is not a file",
            file_label(input)
        ))),
        Err(_) => Err(TranscodeError::InvalidInput(format!(
            "{} does not exist",
            file_label(input)
        ))),
    }
}

/// Output must differ from the input and carry the expected extension. Its
/// parent directory is created.
async fn check_output(input: &Path, output: &Path, extension: &str) -> Result<(), TranscodeError> {
    if output == input {
        return Err(TranscodeError::InvalidInput(
            "output must differ from input".to_string(),
        ));
    }

    let ext_matches = output
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension));
    if !ext_matches {
        return Err(TranscodeError::InvalidInput(format!(
            "output must use the .{extension} extension"
        )));
    }

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    Ok(())
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", file_label(path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", file_label(path), e),
    }
}

/// File name only, so diagnostics do not leak directory layout.
pub(crate) fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<unnamed>".to_string())
}
