//! Recipe validation.
//!
//! Validation is pure: it never touches the filesystem. Whether referenced
//! sources actually exist is checked when the recipe is rendered.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::format::{AUDIO_EXTENSIONS, OutputFormat};
use crate::recipe::{AudioDef, EffectsDef, RecipeDef, StepDef, parse_kind};

pub const MAX_DIMENSION: i64 = 7680;
pub const MAX_FPS: i64 = 120;
pub const MAX_STEPS: usize = 500;
pub const MAX_STEP_SECS: f64 = 3600.0;
pub const MAX_VOLUME: f64 = 4.0;

/// Outcome of validating a recipe. `valid` is true exactly when `errors` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

impl std::fmt::Display for Validation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.valid {
            return f.write_str("recipe is valid");
        }
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Validation {}

/// Collects errors under a JSON-path style location prefix.
struct Report {
    errors: Vec<String>,
}

impl Report {
    fn at(&mut self, path: &str, message: impl std::fmt::Display) {
        self.errors.push(format!("{path}: {message}"));
    }
}

/// Validate a submitted recipe, reporting every violation.
pub fn validate(def: &RecipeDef) -> Validation {
    let mut report = Report { errors: Vec::new() };

    check_dimension(&mut report, "$.width", def.width);
    check_dimension(&mut report, "$.height", def.height);

    match def.fps {
        None => report.at("$.fps", "is required"),
        Some(fps) if !(1..=MAX_FPS).contains(&fps) => {
            report.at("$.fps", format!("must be between 1 and {MAX_FPS}"))
        }
        Some(_) => {}
    }

    let format = match def.format.as_deref() {
        None => {
            report.at("$.format", "is required");
            None
        }
        Some(name) => match name.parse::<OutputFormat>() {
            Ok(format) => Some(format),
            Err(e) => {
                report.at("$.format", e);
                None
            }
        },
    };

    let total_secs = match def.steps.as_deref() {
        None => {
            report.at("$.steps", "is required");
            None
        }
        Some([]) => {
            report.at("$.steps", "must contain at least one step");
            None
        }
        Some(steps) if steps.len() > MAX_STEPS => {
            report.at("$.steps", format!("must not exceed {MAX_STEPS} steps"));
            None
        }
        Some(steps) => {
            let mut total = 0.0;
            let mut all_timed = true;
            for (i, step) in steps.iter().enumerate() {
                match check_step(&mut report, i, step) {
                    Some(secs) => total += secs,
                    None => all_timed = false,
                }
            }
            all_timed.then_some(total)
        }
    };

    if let Some(audio) = &def.audio {
        check_audio(&mut report, audio);
    }

    if let Some(effects) = &def.effects {
        check_effects(&mut report, effects, total_secs);
    }

    if let Some(options) = &def.options {
        for e in options.check() {
            report.at("$.options", e);
        }
    }

    if format == Some(OutputFormat::Mp3) && def.audio.is_none() {
        report.at("$.audio", "is required for mp3 output");
    }

    Validation::from_errors(report.errors)
}

fn check_dimension(report: &mut Report, path: &str, value: Option<i64>) {
    match value {
        None => report.at(path, "is required"),
        Some(v) if v <= 0 => report.at(path, "must be greater than 0"),
        Some(v) if v > MAX_DIMENSION => report.at(path, format!("must not exceed {MAX_DIMENSION}")),
        Some(v) if v % 2 != 0 => report.at(path, "must be even"),
        Some(_) => {}
    }
}

/// Returns the step duration when it is usable for totals.
fn check_step(report: &mut Report, index: usize, step: &StepDef) -> Option<f64> {
    let path = format!("$.steps[{index}]");

    let kind = match step.kind.as_deref() {
        None => {
            report.at(&format!("{path}.kind"), "is required");
            None
        }
        Some(k) => match parse_kind(k) {
            Some(kind) => Some(kind),
            None => {
                report.at(
                    &format!("{path}.kind"),
                    format!("unknown kind '{k}' (expected image|video)"),
                );
                None
            }
        },
    };

    match step.source.as_deref() {
        None => report.at(&format!("{path}.source"), "is required"),
        Some(s) if s.trim().is_empty() => report.at(&format!("{path}.source"), "must not be empty"),
        Some(s) => {
            if let Some(kind) = kind
                && !has_extension(s, kind.extensions())
            {
                report.at(
                    &format!("{path}.source"),
                    format!(
                        "unsupported {} source (expected one of: {})",
                        kind.as_str(),
                        kind.extensions().join(", ")
                    ),
                );
            }
        }
    }

    let duration = match step.duration_secs {
        None => {
            report.at(&format!("{path}.duration_secs"), "is required");
            None
        }
        Some(d) if !d.is_finite() => {
            report.at(&format!("{path}.duration_secs"), "must be a finite number");
            None
        }
        Some(d) if d <= 0.0 => {
            report.at(&format!("{path}.duration_secs"), "must be greater than 0");
            None
        }
        Some(d) if d > MAX_STEP_SECS => {
            report.at(
                &format!("{path}.duration_secs"),
                format!("must not exceed {MAX_STEP_SECS} seconds"),
            );
            None
        }
        Some(d) => Some(d),
    };

    if let Some(trim) = step.trim_start_secs {
        let trim_path = format!("{path}.trim_start_secs");
        if !trim.is_finite() || trim < 0.0 {
            report.at(&trim_path, "must be a non-negative number");
        }
        if kind == Some(crate::format::SourceKind::Image) {
            report.at(&trim_path, "is only allowed on video steps");
        }
    }

    duration
}

fn check_audio(report: &mut Report, audio: &AudioDef) {
    match audio.source.as_deref() {
        None => report.at("$.audio.source", "is required"),
        Some(s) if s.trim().is_empty() => report.at("$.audio.source", "must not be empty"),
        Some(s) if !has_extension(s, AUDIO_EXTENSIONS) => report.at(
            "$.audio.source",
            format!(
                "unsupported audio source (expected one of: {})",
                AUDIO_EXTENSIONS.join(", ")
            ),
        ),
        Some(_) => {}
    }

    if let Some(volume) = audio.volume
        && (!volume.is_finite() || !(0.0..=MAX_VOLUME).contains(&volume))
    {
        report.at("$.audio.volume", format!("must be between 0 and {MAX_VOLUME}"));
    }
}

fn check_effects(report: &mut Report, effects: &EffectsDef, total_secs: Option<f64>) {
    let mut fades = 0.0;
    for (name, value) in [
        ("fade_in_secs", effects.fade_in_secs),
        ("fade_out_secs", effects.fade_out_secs),
    ] {
        let Some(v) = value else { continue };
        if !v.is_finite() || v < 0.0 {
            report.at(&format!("$.effects.{name}"), "must be a non-negative number");
        } else {
            fades += v;
        }
    }

    if let Some(total) = total_secs
        && fades > total
    {
        report.at("$.effects", "fades must not be longer than the composition");
    }
}

fn has_extension(source: &str, allowed: &[&str]) -> bool {
    Path::new(source)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| allowed.iter().any(|a| a.eq_ignore_ascii_case(e)))
}
