//! Cancellable passes over a capture

use crate::error::AnalysisError;
use tokio_util::sync::CancellationToken;
use tracefold_capture::{CaptureFrame, CaptureReader, FrameKind};

/// Frames between two cancellation checks
pub const CANCEL_CHECK_INTERVAL: u64 = 100;

/// Fails with `Cancelled` on every `CANCEL_CHECK_INTERVAL`th call position
pub(crate) fn check_cancelled(cancel: &CancellationToken, seen: u64) -> Result<(), AnalysisError> {
    if seen % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
        return Err(AnalysisError::Cancelled);
    }
    Ok(())
}

/// Decode every frame from the reader's position to the end
pub(crate) fn for_each_frame<F>(
    reader: &mut CaptureReader,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<(), AnalysisError>
where
    F: FnMut(CaptureFrame),
{
    let mut seen = 0u64;
    while let Some(frame) = reader.read_frame()? {
        check_cancelled(cancel, seen)?;
        seen += 1;
        f(frame);
    }
    Ok(())
}

/// Reassemble the embedded file `path`, skipping other frames undecoded
pub(crate) fn read_embedded_file(
    reader: &mut CaptureReader,
    path: &str,
    cancel: &CancellationToken,
) -> Result<Option<Vec<u8>>, AnalysisError> {
    let mut data: Option<Vec<u8>> = None;
    let mut seen = 0u64;
    while let Some(kind) = reader.peek_kind()? {
        check_cancelled(cancel, seen)?;
        seen += 1;
        if kind != FrameKind::FileChunk {
            reader.skip()?;
            continue;
        }
        let (_, chunk) = reader.read_file_chunk()?;
        if chunk.path != path {
            continue;
        }
        data.get_or_insert_with(Vec::new).extend_from_slice(&chunk.data);
        if chunk.is_last {
            break;
        }
    }
    Ok(data)
}
