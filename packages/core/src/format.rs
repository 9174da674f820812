//! Output formats, quality presets and per-format options.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of formats the transcoder can materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Webm,
    Gif,
    Webp,
    Mp3,
}

impl OutputFormat {
    /// Every supported format, in the order they are listed to users.
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::Mp4,
        OutputFormat::Webm,
        OutputFormat::Gif,
        OutputFormat::Webp,
        OutputFormat::Mp3,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
            OutputFormat::Gif => "gif",
            OutputFormat::Webp => "webp",
            OutputFormat::Mp3 => "mp3",
        }
    }

    /// File extension used for artifacts of this format.
    pub fn extension(self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "video/mp4",
            OutputFormat::Webm => "video/webm",
            OutputFormat::Gif => "image/gif",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Mp3 => "audio/mpeg",
        }
    }

    /// Looped image outputs take the frame-rate/scale knobs.
    pub fn is_looped_image(self) -> bool {
        matches!(self, OutputFormat::Gif | OutputFormat::Webp)
    }

    pub fn is_audio_only(self) -> bool {
        matches!(self, OutputFormat::Mp3)
    }

    /// Whether the format can carry an audio stream at all.
    pub fn carries_audio(self) -> bool {
        !self.is_looped_image()
    }

    /// Look a format up by file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }

    /// Comma separated list of supported format names.
    pub fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a format name is not in the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported format '{requested}' (supported: {})", supported.join(", "))]
pub struct UnsupportedFormat {
    pub requested: String,
    pub supported: Vec<String>,
}

impl FromStr for OutputFormat {
    type Err = UnsupportedFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().trim_start_matches('.').to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == normalized)
            .ok_or_else(|| UnsupportedFormat {
                requested: s.to_string(),
                supported: Self::ALL.iter().map(|f| f.as_str().to_string()).collect(),
            })
    }
}

/// Compression quality preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" | "med" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            other => Err(format!(
                "invalid quality '{other}' (expected low|medium|high)"
            )),
        }
    }
}

/// Per-format knobs. Absent values fall back to the transcoder defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    /// Output frame rate for looped image formats.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    /// Output width for looped image formats; height follows the aspect ratio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// 0 loops forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_bitrate_kbps: Option<u32>,
}

pub const OPTION_FPS_RANGE: std::ops::RangeInclusive<u32> = 1..=60;
pub const OPTION_WIDTH_RANGE: std::ops::RangeInclusive<u32> = 16..=4096;
pub const OPTION_BITRATE_RANGE: std::ops::RangeInclusive<u32> = 32..=320;

impl FormatOptions {
    /// Range-check the numeric knobs. Every violation is reported.
    pub fn check(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(fps) = self.fps
            && !OPTION_FPS_RANGE.contains(&fps)
        {
            errors.push(format!(
                "fps must be between {} and {}",
                OPTION_FPS_RANGE.start(),
                OPTION_FPS_RANGE.end()
            ));
        }
        if let Some(width) = self.width {
            if !OPTION_WIDTH_RANGE.contains(&width) {
                errors.push(format!(
                    "width must be between {} and {}",
                    OPTION_WIDTH_RANGE.start(),
                    OPTION_WIDTH_RANGE.end()
                ));
            } else if width % 2 != 0 {
                errors.push("width must be even".to_string());
            }
        }
        if let Some(kbps) = self.audio_bitrate_kbps
            && !OPTION_BITRATE_RANGE.contains(&kbps)
        {
            errors.push(format!(
                "audio_bitrate_kbps must be between {} and {}",
                OPTION_BITRATE_RANGE.start(),
                OPTION_BITRATE_RANGE.end()
            ));
        }
        errors
    }
}

/// Kind of media a recipe step draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Image,
    Video,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Image => "image",
            SourceKind::Video => "video",
        }
    }

    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            SourceKind::Image => IMAGE_EXTENSIONS,
            SourceKind::Video => VIDEO_EXTENSIONS,
        }
    }
}

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "mkv", "gif"];
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "aac", "ogg", "flac", "opus"];
