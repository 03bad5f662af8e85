//! Analysis error types

use thiserror::Error;
use tracefold_capture::CaptureError;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The cancellation token was observed; no partial result exists
    #[error("operation cancelled")]
    Cancelled,

    #[error("capture: {0}")]
    Capture(#[from] CaptureError),

    #[error("resolver {resolver}: {reason}")]
    Resolver {
        resolver: &'static str,
        reason: String,
    },

    #[error("background worker failed: {0}")]
    Worker(String),
}

impl AnalysisError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AnalysisError::Cancelled)
    }
}
