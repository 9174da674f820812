//! Per-format invocation profiles.
//!
//! Every format maps to a builder that produces an argument vector for
//! ffmpeg. Nothing here goes through a shell: option values are typed
//! numbers rendered into separate arguments.

use std::ffi::OsString;
use std::path::Path;

use render_core::{FormatOptions, OutputFormat, Quality, SourceKind};

use crate::error::TranscodeError;
use crate::{SegmentRequest, TranscodeRequest};

/// Defaults applied when a request leaves an option unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDefaults {
    pub quality: Quality,
    /// Frame rate for looped image outputs.
    pub loop_fps: u32,
    /// Width for looped image outputs.
    pub loop_width: u32,
    /// 0 loops forever.
    pub loop_count: u32,
    pub audio_bitrate_kbps: u32,
}

impl Default for FormatDefaults {
    fn default() -> Self {
        Self {
            quality: Quality::Medium,
            loop_fps: 15,
            loop_width: 480,
            loop_count: 0,
            audio_bitrate_kbps: 128,
        }
    }
}

/// Options after defaults have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub quality: Quality,
    pub fps: u32,
    pub width: u32,
    pub loop_count: u32,
    pub audio_bitrate_kbps: u32,
}

impl FormatDefaults {
    pub fn resolve(&self, options: &FormatOptions) -> ResolvedOptions {
        ResolvedOptions {
            quality: options.quality.unwrap_or(self.quality),
            fps: options.fps.unwrap_or(self.loop_fps),
            width: options.width.unwrap_or(self.loop_width),
            loop_count: options.loop_count.unwrap_or(self.loop_count),
            audio_bitrate_kbps: options.audio_bitrate_kbps.unwrap_or(self.audio_bitrate_kbps),
        }
    }
}

/// Typed video filters a caller may ask for ahead of the format's own chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VideoFilter {
    /// Scale into a canvas, keeping aspect ratio, and pad the rest.
    Fit { width: u32, height: u32 },
    /// Constant output frame rate.
    Fps(u32),
    FadeIn { duration_secs: f64 },
    FadeOut { start_secs: f64, duration_secs: f64 },
}

impl VideoFilter {
    /// The matching audio filter, for filters that also shape the sound.
    fn audio(&self) -> Option<String> {
        match *self {
            VideoFilter::FadeIn { duration_secs } => {
                Some(format!("afade=t=in:st=0:d={duration_secs:.3}"))
            }
            VideoFilter::FadeOut {
                start_secs,
                duration_secs,
            } => Some(format!("afade=t=out:st={start_secs:.3}:d={duration_secs:.3}")),
            VideoFilter::Fit { .. } | VideoFilter::Fps(_) => None,
        }
    }

    fn render(&self) -> String {
        match *self {
            VideoFilter::Fit { width, height } => format!(
                "scale={width}:{height}:force_original_aspect_ratio=decrease,\
                 pad={width}:{height}:(ow-iw)/2:(oh-ih)/2,setsar=1"
            ),
            VideoFilter::Fps(fps) => format!("fps={fps}"),
            VideoFilter::FadeIn { duration_secs } => {
                format!("fade=t=in:st=0:d={duration_secs:.3}")
            }
            VideoFilter::FadeOut {
                start_secs,
                duration_secs,
            } => format!("fade=t=out:st={start_secs:.3}:d={duration_secs:.3}"),
        }
    }
}

/// Extension used for the intermediate concat manifest.
pub const CONCAT_EXTENSION: &str = "ffconcat";

/// Container of intermediate segments.
pub const SEGMENT_EXTENSION: &str = "mkv";

/// Near-lossless so the final encode is not working from a degraded copy.
const SEGMENT_CRF: &str = "12";

fn h264_settings(quality: Quality) -> (&'static str, u8) {
    match quality {
        Quality::High => ("slow", 18),
        Quality::Medium => ("medium", 23),
        Quality::Low => ("veryfast", 28),
    }
}

fn vp9_crf(quality: Quality) -> u8 {
    match quality {
        Quality::High => 24,
        Quality::Medium => 32,
        Quality::Low => 40,
    }
}

fn webp_quality(quality: Quality) -> u8 {
    match quality {
        Quality::High => 90,
        Quality::Medium => 75,
        Quality::Low => 50,
    }
}

fn mp3_vbr(quality: Quality) -> u8 {
    match quality {
        Quality::High => 0,
        Quality::Medium => 4,
        Quality::Low => 7,
    }
}

/// Accumulates arguments; paths stay `OsString` so nothing is lossily converted.
#[derive(Default)]
struct Args(Vec<OsString>);

impl Args {
    fn push(&mut self, arg: impl Into<OsString>) -> &mut Self {
        self.0.push(arg.into());
        self
    }

    fn pair(&mut self, flag: &str, value: impl Into<OsString>) -> &mut Self {
        self.push(flag).push(value)
    }
}

fn common_flags(args: &mut Args) {
    args.push("-hide_banner")
        .push("-nostdin")
        .push("-y")
        .pair("-loglevel", "error")
        .pair("-progress", "pipe:1")
        .push("-nostats");
}

fn seconds(secs: f64) -> String {
    format!("{secs:.3}")
}

fn is_concat_manifest(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(CONCAT_EXTENSION))
}

/// Build the full argument vector for a request.
pub fn build_args(
    request: &TranscodeRequest,
    defaults: &FormatDefaults,
) -> Result<Vec<OsString>, TranscodeError> {
    let problems = request.options.check();
    if !problems.is_empty() {
        return Err(TranscodeError::InvalidOptions(problems));
    }
    let opts = defaults.resolve(&request.options);
    let format = request.format;

    let mut args = Args::default();
    common_flags(&mut args);

    if is_concat_manifest(&request.input) {
        args.pair("-f", "concat");
    }
    args.pair("-i", request.input.as_os_str());

    let duration = request.duration_secs.filter(|d| d.is_finite() && *d > 0.0);
    let track = request.audio.as_ref().filter(|_| format.carries_audio());
    // A track that is already the main input is not opened twice.
    let separate_audio = track.filter(|a| a.path != request.input);
    if let Some(audio) = separate_audio {
        args.pair("-i", audio.path.as_os_str());
        if format.is_audio_only() {
            args.pair("-map", "1:a:0");
        } else {
            args.pair("-map", "0:v:0").pair("-map", "1:a:0");
        }
    }

    if !format.is_audio_only() {
        let chain = video_chain(request, format, &opts);
        if !chain.is_empty() {
            args.pair("-vf", chain);
        }
    }

    // Only when an audio stream is known to exist.
    if format.is_audio_only() || separate_audio.is_some() {
        let chain = audio_chain(request, track.and_then(|a| a.volume), duration);
        if !chain.is_empty() {
            args.pair("-af", chain);
        }
    }

    match format {
        OutputFormat::Mp4 => {
            let (preset, crf) = h264_settings(opts.quality);
            args.pair("-c:v", "libx264")
                .pair("-preset", preset)
                .pair("-crf", crf.to_string())
                .pair("-pix_fmt", "yuv420p")
                .pair("-movflags", "+faststart")
                .pair("-c:a", "aac")
                .pair("-b:a", format!("{}k", opts.audio_bitrate_kbps));
        }
        OutputFormat::Webm => {
            args.pair("-c:v", "libvpx-vp9")
                .pair("-b:v", "0")
                .pair("-crf", vp9_crf(opts.quality).to_string())
                .pair("-c:a", "libopus")
                .pair("-b:a", format!("{}k", opts.audio_bitrate_kbps));
        }
        OutputFormat::Gif => {
            args.pair("-loop", opts.loop_count.to_string()).push("-an");
        }
        OutputFormat::Webp => {
            args.pair("-c:v", "libwebp")
                .pair("-lossless", "0")
                .pair("-q:v", webp_quality(opts.quality).to_string())
                .pair("-loop", opts.loop_count.to_string())
                .push("-an");
        }
        OutputFormat::Mp3 => {
            args.push("-vn")
                .pair("-c:a", "libmp3lame")
                .pair("-q:a", mp3_vbr(opts.quality).to_string());
        }
    }

    if let Some(d) = duration {
        args.pair("-t", seconds(d));
    }
    args.push(request.output.as_os_str());
    Ok(args.0)
}

/// Volume, then padding up to the output length, then fades.
fn audio_chain(request: &TranscodeRequest, volume: Option<f64>, duration: Option<f64>) -> String {
    let mut parts = Vec::new();
    if let Some(volume) = volume {
        parts.push(format!("volume={volume:.3}"));
    }
    if let Some(d) = duration {
        parts.push(format!("apad=whole_dur={d:.3}"));
    }
    parts.extend(request.filters.iter().filter_map(VideoFilter::audio));
    parts.join(",")
}

/// Build the argument vector for one intermediate segment.
pub fn build_segment_args(request: &SegmentRequest) -> Result<Vec<OsString>, TranscodeError> {
    if !(request.duration_secs.is_finite() && request.duration_secs > 0.0) {
        return Err(TranscodeError::InvalidInput(
            "segment duration must be positive".to_string(),
        ));
    }
    if request.width == 0 || request.height == 0 || request.fps == 0 {
        return Err(TranscodeError::InvalidInput(
            "segment canvas and frame rate must be positive".to_string(),
        ));
    }
    let duration = seconds(request.duration_secs);

    let mut args = Args::default();
    common_flags(&mut args);

    let mut filters = vec![
        VideoFilter::Fit {
            width: request.width,
            height: request.height,
        }
        .render(),
        VideoFilter::Fps(request.fps).render(),
    ];
    match request.kind {
        SourceKind::Image => {
            args.pair("-loop", "1")
                .pair("-framerate", request.fps.to_string())
                .pair("-t", duration.clone());
        }
        SourceKind::Video => {
            if request.start_secs > 0.0 {
                args.pair("-ss", seconds(request.start_secs));
            }
            args.pair("-t", duration.clone());
            filters.push(format!("tpad=stop_mode=clone:stop_duration={duration}"));
        }
    }
    args.pair("-i", request.source.as_os_str());
    filters.push("format=yuv420p".to_string());

    args.pair("-vf", filters.join(","))
        .push("-an")
        .pair("-c:v", "libx264")
        .pair("-preset", "veryfast")
        .pair("-crf", SEGMENT_CRF)
        .pair("-pix_fmt", "yuv420p")
        .pair("-r", request.fps.to_string())
        .pair("-t", duration)
        .push(request.output.as_os_str());
    Ok(args.0)
}

fn video_chain(request: &TranscodeRequest, format: OutputFormat, opts: &ResolvedOptions) -> String {
    let mut parts: Vec<String> = request.filters.iter().map(VideoFilter::render).collect();

    if format.is_looped_image() {
        parts.push(format!("fps={}", opts.fps));
        parts.push(format!("scale={}:-2:flags=lanczos", opts.width));
    }

    let mut chain = parts.join(",");
    if format == OutputFormat::Gif {
        if !chain.is_empty() {
            chain.push(',');
        }
        chain.push_str("split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse");
    }
    chain
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::AudioInput;

    fn request(format: OutputFormat) -> TranscodeRequest {
        TranscodeRequest::new("/work/in.mp4", format!("/work/out.{}", format.extension()), format)
    }

    fn args_of(request: &TranscodeRequest) -> Vec<String> {
        build_args(request, &FormatDefaults::default())
            .unwrap()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn value_after(args: &[String], flag: &str) -> Option<String> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1).cloned())
    }

    #[test]
    fn mp4_defaults_to_the_medium_preset() {
        let args = args_of(&request(OutputFormat::Mp4));
        assert_eq!(value_after(&args, "-c:v").as_deref(), Some("libx264"));
        assert_eq!(value_after(&args, "-crf").as_deref(), Some("23"));
        assert_eq!(value_after(&args, "-preset").as_deref(), Some("medium"));
        assert_eq!(value_after(&args, "-b:a").as_deref(), Some("128k"));
        assert_eq!(args.last().map(String::as_str), Some("/work/out.mp4"));
    }

    #[test]
    fn quality_option_overrides_the_default() {
        let mut req = request(OutputFormat::Webm);
        req.options.quality = Some(Quality::High);
        let args = args_of(&req);
        assert_eq!(value_after(&args, "-c:v").as_deref(), Some("libvpx-vp9"));
        assert_eq!(value_after(&args, "-crf").as_deref(), Some("24"));
    }

    #[test]
    fn gif_uses_fps_scale_and_palette() {
        let mut req = request(OutputFormat::Gif);
        req.options.fps = Some(12);
        req.options.width = Some(320);
        let args = args_of(&req);
        assert_eq!(
            value_after(&args, "-vf").as_deref(),
            Some("fps=12,scale=320:-2:flags=lanczos,split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse")
        );
        assert_eq!(value_after(&args, "-loop").as_deref(), Some("0"));
        assert!(args.contains(&"-an".to_string()));
    }

    #[test]
    fn webp_takes_quality_and_loop_settings() {
        let mut req = request(OutputFormat::Webp);
        req.options.loop_count = Some(3);
        req.options.quality = Some(Quality::Low);
        let args = args_of(&req);
        assert_eq!(value_after(&args, "-c:v").as_deref(), Some("libwebp"));
        assert_eq!(value_after(&args, "-q:v").as_deref(), Some("50"));
        assert_eq!(value_after(&args, "-loop").as_deref(), Some("3"));
    }

    #[test]
    fn mp3_drops_video_and_maps_the_audio_input() {
        let mut req = request(OutputFormat::Mp3);
        req.audio = Some(AudioInput {
            path: PathBuf::from("/work/audio.wav"),
            volume: Some(0.5),
        });
        let args = args_of(&req);
        assert!(args.contains(&"-vn".to_string()));
        assert!(!args.contains(&"-vf".to_string()));
        assert_eq!(value_after(&args, "-map").as_deref(), Some("1:a:0"));
        assert_eq!(value_after(&args, "-af").as_deref(), Some("volume=0.500"));
        assert_eq!(value_after(&args, "-q:a").as_deref(), Some("4"));
    }

    #[test]
    fn concat_manifests_select_the_concat_demuxer() {
        let mut req = request(OutputFormat::Mp4);
        req.input = PathBuf::from("/work/scene.ffconcat");
        req.filters = vec![
            VideoFilter::Fit {
                width: 720,
                height: 1280,
            },
            VideoFilter::Fps(30),
            VideoFilter::FadeIn { duration_secs: 0.5 },
        ];
        let args = args_of(&req);
        assert_eq!(value_after(&args, "-f").as_deref(), Some("concat"));
        let chain = value_after(&args, "-vf").unwrap();
        assert!(chain.starts_with("scale=720:1280:force_original_aspect_ratio=decrease"));
        assert!(chain.ends_with("fps=30,fade=t=in:st=0:d=0.500"));
    }

    #[test]
    fn looped_outputs_ignore_separate_audio() {
        let mut req = request(OutputFormat::Gif);
        req.audio = Some(AudioInput {
            path: PathBuf::from("/work/audio.mp3"),
            volume: None,
        });
        let args = args_of(&req);
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 1);
    }

    #[test]
    fn out_of_range_options_fail_before_building() {
        let mut req = request(OutputFormat::Gif);
        req.options.width = Some(3);
        let err = build_args(&req, &FormatDefaults::default()).unwrap_err();
        assert!(matches!(err, TranscodeError::InvalidOptions(_)));
        assert!(err.is_precondition());
    }

    #[test]
    fn output_follows_the_timeline_not_the_audio_track() {
        let mut req = request(OutputFormat::Mp4);
        req.input = PathBuf::from("/work/scene.ffconcat");
        req.duration_secs = Some(10.0);
        req.audio = Some(AudioInput {
            path: PathBuf::from("/work/audio.mp3"),
            volume: None,
        });
        let args = args_of(&req);
        assert!(!args.contains(&"-shortest".to_string()));
        assert_eq!(value_after(&args, "-af").as_deref(), Some("apad=whole_dur=10.000"));
        assert_eq!(value_after(&args, "-t").as_deref(), Some("10.000"));
        assert_eq!(args.last().map(String::as_str), Some("/work/out.mp4"));
    }

    #[test]
    fn mp3_is_cut_to_length_and_faded() {
        let mut req = request(OutputFormat::Mp3);
        req.input = PathBuf::from("/work/audio.wav");
        req.duration_secs = Some(6.0);
        req.filters = vec![
            VideoFilter::FadeIn { duration_secs: 1.0 },
            VideoFilter::FadeOut {
                start_secs: 4.0,
                duration_secs: 2.0,
            },
        ];
        let args = args_of(&req);
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 1);
        assert_eq!(
            value_after(&args, "-af").as_deref(),
            Some("apad=whole_dur=6.000,afade=t=in:st=0:d=1.000,afade=t=out:st=4.000:d=2.000")
        );
        assert_eq!(value_after(&args, "-t").as_deref(), Some("6.000"));
    }

    #[test]
    fn video_without_separate_audio_gets_no_audio_filters() {
        let mut req = request(OutputFormat::Webm);
        req.duration_secs = Some(3.0);
        req.filters = vec![VideoFilter::FadeIn { duration_secs: 1.0 }];
        let args = args_of(&req);
        assert!(!args.contains(&"-af".to_string()));
        assert_eq!(value_after(&args, "-t").as_deref(), Some("3.000"));
    }

    fn segment(kind: SourceKind, start_secs: f64) -> SegmentRequest {
        SegmentRequest {
            source: PathBuf::from("/work/step-000.src"),
            kind,
            output: PathBuf::from("/work/segment-000.mkv"),
            width: 640,
            height: 360,
            fps: 25,
            start_secs,
            duration_secs: 2.5,
        }
    }

    fn segment_args(request: &SegmentRequest) -> Vec<String> {
        build_segment_args(request)
            .unwrap()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn image_segments_loop_the_still_for_its_duration() {
        let args = segment_args(&segment(SourceKind::Image, 0.0));
        assert_eq!(value_after(&args, "-loop").as_deref(), Some("1"));
        assert_eq!(value_after(&args, "-framerate").as_deref(), Some("25"));
        assert_eq!(value_after(&args, "-t").as_deref(), Some("2.500"));
        assert_eq!(
            value_after(&args, "-vf").as_deref(),
            Some(
                "scale=640:360:force_original_aspect_ratio=decrease,\
                 pad=640:360:(ow-iw)/2:(oh-ih)/2,setsar=1,fps=25,format=yuv420p"
            )
        );
        assert!(args.contains(&"-an".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/work/segment-000.mkv"));
    }

    #[test]
    fn video_segments_seek_and_hold_the_last_frame() {
        let args = segment_args(&segment(SourceKind::Video, 1.5));
        let seek = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(seek < input);
        assert_eq!(args[seek + 1], "1.500");
        assert!(!args.contains(&"-loop".to_string()));
        assert!(
            value_after(&args, "-vf")
                .unwrap()
                .contains("tpad=stop_mode=clone:stop_duration=2.500")
        );
        assert_eq!(value_after(&args, "-c:v").as_deref(), Some("libx264"));
    }

    #[test]
    fn zero_length_segments_are_rejected() {
        let mut req = segment(SourceKind::Image, 0.0);
        req.duration_secs = 0.0;
        assert!(build_segment_args(&req).unwrap_err().is_precondition());
    }

    #[test]
    fn mp3_from_its_own_track_opens_it_once() {
        let mut req = request(OutputFormat::Mp3);
        req.input = PathBuf::from("/work/audio.wav");
        req.audio = Some(AudioInput {
            path: PathBuf::from("/work/audio.wav"),
            volume: Some(0.5),
        });
        req.duration_secs = Some(3.0);
        let args = args_of(&req);

        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 1);
        assert!(!args.contains(&"-map".to_string()));
        assert_eq!(
            value_after(&args, "-af").as_deref(),
            Some("volume=0.500,apad=whole_dur=3.000")
        );
    }
}
