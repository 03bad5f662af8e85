//! Recorder error types

use crate::source::SourceFailure;
use tracefold_capture::CaptureError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    /// Sources, pids and settings can only change while idle
    #[error("recorder is {0}, operation requires idle")]
    NotIdle(crate::profiler::RecorderState),

    #[error("invalid pid {0}")]
    InvalidPid(i32),

    /// The first failure reported by a source during the session
    #[error(transparent)]
    SourceFailed(#[from] SourceFailure),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
