//! Composition recipes: the submitted document and its validated form.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::format::{FormatOptions, OutputFormat, SourceKind};
use crate::validate::{Validation, validate};

/// A recipe as submitted by a client.
///
/// Every field is optional so that missing values can be reported by the
/// validator instead of failing deserialization on the first one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeDef {
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<i64>,
    pub format: Option<String>,
    pub steps: Option<Vec<StepDef>>,
    pub audio: Option<AudioDef>,
    pub effects: Option<EffectsDef>,
    pub options: Option<FormatOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDef {
    pub source: Option<String>,
    pub kind: Option<String>,
    pub duration_secs: Option<f64>,
    pub trim_start_secs: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioDef {
    pub source: Option<String>,
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsDef {
    pub fade_in_secs: Option<f64>,
    pub fade_out_secs: Option<f64>,
}

impl RecipeDef {
    /// Parse a recipe document from JSON.
    ///
    /// Documents that are not even shaped like a recipe come back as a
    /// failed validation. The recipe and every nested record must be JSON
    /// objects; positional arrays are refused. Unknown keys are ignored.
    pub fn from_json(json: &str) -> Result<Self, Validation> {
        let value: Value = serde_json::from_str(json).map_err(malformed)?;
        let shape = shape_errors(&value);
        if !shape.is_empty() {
            return Err(Validation::from_errors(shape));
        }
        serde_json::from_value(value).map_err(malformed)
    }

    /// Validate and convert into an immutable [`Recipe`].
    pub fn into_recipe(self) -> Result<Recipe, Validation> {
        let validation = validate(&self);
        if !validation.valid {
            return Err(validation);
        }
        Recipe::from_validated(self).ok_or_else(|| {
            Validation::from_errors(vec!["$: recipe could not be converted".to_string()])
        })
    }
}

fn malformed(e: serde_json::Error) -> Validation {
    Validation::from_errors(vec![format!("$: malformed recipe: {e}")])
}

/// Serde would also accept records written as arrays, by field position.
fn shape_errors(value: &Value) -> Vec<String> {
    const NOT_AN_OBJECT: &str = "must be a JSON object";

    let Some(root) = value.as_object() else {
        return vec![format!("$: {NOT_AN_OBJECT}")];
    };
    let mut errors = Vec::new();
    for key in ["audio", "effects", "options"] {
        if let Some(v) = root.get(key)
            && !(v.is_null() || v.is_object())
        {
            errors.push(format!("$.{key}: {NOT_AN_OBJECT}"));
        }
    }
    if let Some(Value::Array(steps)) = root.get("steps") {
        for (i, step) in steps.iter().enumerate() {
            if !step.is_object() {
                errors.push(format!("$.steps[{i}]: {NOT_AN_OBJECT}"));
            }
        }
    }
    errors
}

/// A validated, immutable composition recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: OutputFormat,
    pub steps: Vec<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioTrack>,
    #[serde(default)]
    pub effects: Effects,
    #[serde(default)]
    pub options: FormatOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub source: PathBuf,
    pub kind: SourceKind,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trim_start_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub source: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Effects {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fade_in_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fade_out_secs: Option<f64>,
}

impl Recipe {
    /// Total composition length in seconds.
    pub fn total_duration_secs(&self) -> f64 {
        self.steps.iter().map(|s| s.duration_secs).sum()
    }

    // Only called after `validate` accepted the definition.
    fn from_validated(def: RecipeDef) -> Option<Self> {
        let steps = def
            .steps?
            .into_iter()
            .map(|s| {
                Some(Step {
                    source: PathBuf::from(s.source?),
                    kind: parse_kind(s.kind.as_deref()?)?,
                    duration_secs: s.duration_secs?,
                    trim_start_secs: s.trim_start_secs,
                })
            })
            .collect::<Option<Vec<_>>>()?;

        let audio = match def.audio {
            Some(a) => Some(AudioTrack {
                source: PathBuf::from(a.source?),
                volume: a.volume,
            }),
            None => None,
        };

        let effects = def
            .effects
            .map(|e| Effects {
                fade_in_secs: e.fade_in_secs,
                fade_out_secs: e.fade_out_secs,
            })
            .unwrap_or_default();

        Some(Self {
            width: u32::try_from(def.width?).ok()?,
            height: u32::try_from(def.height?).ok()?,
            fps: u32::try_from(def.fps?).ok()?,
            format: def.format?.parse().ok()?,
            steps,
            audio,
            effects,
            options: def.options.unwrap_or_default(),
        })
    }
}

pub(crate) fn parse_kind(kind: &str) -> Option<SourceKind> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "image" => Some(SourceKind::Image),
        "video" => Some(SourceKind::Video),
        _ => None,
    }
}
