//! Error types for capture encoding, reading, writing and merging

use crate::types::frames::FrameKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// A frame's declared length or one of its trailing arrays does not fit
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("not a capture file (magic {0:#010x})")]
    BadMagic(u32),

    #[error("unsupported capture version {0}")]
    UnsupportedVersion(u8),

    /// A typed read was requested but the next frame is of another kind
    #[error("expected {expected:?} frame, found {found:?}")]
    KindMismatch {
        expected: FrameKind,
        found: Option<FrameKind>,
    },

    #[error("{kind:?} frame of {len} bytes exceeds the maximum frame size")]
    FrameTooLarge { kind: FrameKind, len: usize },

    /// A previous write failed; the writer refuses further appends
    #[error("capture writer failed earlier: {0}")]
    WriterFailed(String),

    /// A merged frame referenced an id whose definition was never merged
    #[error("no translation for {what} {id:#x}")]
    UntranslatedId { what: &'static str, id: u64 },

    /// Counter ids are 24 bits wide and 0 marks an unused slot
    #[error("counter id {0:#x} is outside 1..=0xffffff")]
    InvalidCounterId(u32),

    #[error("counter id space exhausted")]
    CounterIdsExhausted,

    #[error("jitmap address space exhausted")]
    JitmapExhausted,

    #[error("background merge task failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        CaptureError::CorruptFrame(reason.into())
    }
}
