use std::path::PathBuf;

use render_core::UnsupportedFormat;

/// Errors produced by the transcoder adapter.
///
/// `UnsupportedFormat`, `InvalidInput` and `InvalidOptions` are precondition
/// violations: they are raised before any process is spawned.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error(transparent)]
    UnsupportedFormat(#[from] UnsupportedFormat),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid options: {}", .0.join("; "))]
    InvalidOptions(Vec<String>),

    #[error("invalid transcoder config: {0}")]
    InvalidConfig(String),

    #[error("failed to start transcoder '{}': {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit or abnormal termination. `diagnostic` is the captured
    /// stderr of the process, verbatim.
    #[error("transcoder exited with {}: {diagnostic}", exit_label(.code))]
    Failed {
        code: Option<i32>,
        diagnostic: String,
    },

    #[error("transcoder produced no output")]
    EmptyOutput,

    #[error("transcode cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    /// Precondition failures never reached the external process.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            TranscodeError::UnsupportedFormat(_)
                | TranscodeError::InvalidInput(_)
                | TranscodeError::InvalidOptions(_)
        )
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}
