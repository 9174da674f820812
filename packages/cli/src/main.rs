use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use actors::{EnqueueError, RenderConfig, RenderQueue};
use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use render_core::{FormatOptions, JobStatus, OutputFormat, Quality, RecipeDef, Validation};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use transcoder::{FfmpegTranscoder, TranscodeError};

#[derive(Parser, Debug)]
#[command(name = "renderq", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a recipe through the job queue (requires `ffmpeg`).
    Render(RenderArgs),
    /// Convert an existing media file to another format.
    Convert(ConvertArgs),
    /// List supported output formats.
    Formats,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Recipe JSON.
    recipe: PathBuf,

    /// Print every job event as a JSON line on stdout.
    #[arg(long, default_value_t = false)]
    events: bool,
}

#[derive(Parser, Debug)]
struct ConvertArgs {
    /// Input media file.
    input: PathBuf,

    /// Target format (mp4, webm, gif, webp, mp3).
    #[arg(long)]
    format: String,

    /// low, medium or high.
    #[arg(long)]
    quality: Option<Quality>,

    /// Frame rate for gif/webp.
    #[arg(long)]
    fps: Option<u32>,

    /// Width for gif/webp.
    #[arg(long)]
    width: Option<u32>,

    /// Loop count for gif/webp, 0 loops forever.
    #[arg(long)]
    loop_count: Option<u32>,

    /// Audio bitrate in kbps.
    #[arg(long)]
    audio_bitrate: Option<u32>,

    /// Output directory (default: `RENDER_OUTPUT_DIR`).
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Render(args) => cmd_render(args).await,
        Command::Convert(args) => cmd_convert(args).await,
        Command::Formats => {
            cmd_formats();
            Ok(())
        }
    }
}

fn invalid_recipe(validation: Validation) -> anyhow::Error {
    anyhow::anyhow!("invalid recipe:\n  {}", validation.errors.join("\n  "))
}

async fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let json = tokio::fs::read_to_string(&args.recipe)
        .await
        .with_context(|| format!("read recipe '{}'", args.recipe.display()))?;
    let recipe = RecipeDef::from_json(&json).map_err(invalid_recipe)?;
    let validation = render_core::validate(&recipe);
    if !validation.valid {
        return Err(invalid_recipe(validation));
    }

    let config = RenderConfig::from_env()?;
    let ffmpeg = FfmpegTranscoder::new(config.transcoder.clone());
    if !ffmpeg.is_available().await {
        tracing::warn!(
            "{} could not be started; the render will fail",
            config.transcoder.binary.display()
        );
    }

    let queue = RenderQueue::start(config, Arc::new(ffmpeg)).await?;
    let mut events = queue.subscribe();
    let job_id = match queue.enqueue(recipe).await {
        Ok(job_id) => job_id,
        Err(EnqueueError::Invalid(validation)) => {
            queue.shutdown();
            return Err(invalid_recipe(validation));
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!("Submitted job {}", job_id);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            res = &mut ctrl_c, if !interrupted => {
                res.context("listen for ctrl-c")?;
                interrupted = true;
                tracing::warn!("Interrupted, cancelling job {}", job_id);
                queue.cancel(job_id).await?;
            }
            event = events.recv() => match event {
                Ok(event) if event.job_id() == job_id => {
                    if args.events {
                        println!("{}", serde_json::to_string(&event)?);
                    } else {
                        eprintln!("{}", event.description());
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} events", skipped);
                    let finished = queue
                        .get_job(job_id)
                        .await?
                        .is_none_or(|job| job.status.is_terminal());
                    if finished {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    let job = queue
        .get_job(job_id)
        .await?
        .with_context(|| format!("job {job_id} is no longer known"))?;
    queue.shutdown();
    println!("{}", serde_json::to_string_pretty(&job)?);

    match job.status {
        JobStatus::Completed => Ok(()),
        JobStatus::Failed => bail!(
            "render failed: {}",
            job.error.as_deref().unwrap_or("unknown error")
        ),
        JobStatus::Cancelled => bail!("render cancelled"),
        other => bail!("render ended while {other}"),
    }
}

async fn cmd_convert(args: ConvertArgs) -> anyhow::Result<()> {
    // Fail on the format before touching the environment or filesystem.
    let format: OutputFormat = args.format.parse()?;

    let config = RenderConfig::from_env()?;
    let out_dir = args
        .out_dir
        .unwrap_or_else(|| config.storage.output_dir.clone());
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("create output dir '{}'", out_dir.display()))?;

    let options = FormatOptions {
        quality: args.quality,
        fps: args.fps,
        width: args.width,
        loop_count: args.loop_count,
        audio_bitrate_kbps: args.audio_bitrate,
    };
    let ffmpeg = FfmpegTranscoder::new(config.transcoder);

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let last_decile = AtomicU8::new(0);
    let progress = |fraction: f64| {
        let percent = (fraction.clamp(0.0, 1.0) * 100.0) as u8;
        if percent / 10 > last_decile.fetch_max(percent / 10, Ordering::SeqCst) {
            eprintln!("{percent}%");
        }
    };

    match transcoder::convert(
        &ffmpeg,
        &args.input,
        &out_dir,
        format.as_str(),
        options,
        &cancel,
        &progress,
    )
    .await
    {
        Ok(output) => {
            println!("{}", output.display());
            Ok(())
        }
        Err(TranscodeError::Cancelled) => bail!("conversion cancelled"),
        Err(e) => Err(e.into()),
    }
}

fn cmd_formats() {
    for format in OutputFormat::ALL {
        let kind = if format.is_audio_only() {
            "audio"
        } else if format.is_looped_image() {
            "animated image"
        } else {
            "video"
        };
        println!("{:<6} {:<12} {}", format.as_str(), format.content_type(), kind);
    }
}
