//! The contract between the recorder and a data source
//!
//! A source is anything that produces frames into the shared capture
//! writer: a sampler, a counter poller, a log collector. The recorder drives
//! it through `prepare -> start -> stop -> supplement`, and the source reports
//! readiness, completion and failure back through its [`SourceNotifier`].
//! Notifications may be sent from any thread.

use crate::config::SpawnConfig;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracefold_capture::{CaptureError, CaptureReader, CaptureWriter, Pid};

/// Identity of a source within one recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub(crate) u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A failure reported by a source, or by the recorder on its behalf
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{origin} failed: {reason}")]
pub struct SourceFailure {
    /// Source name, or "recorder" for session-level failures
    pub origin: String,
    pub reason: String,
}

impl SourceFailure {
    pub fn new(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SourceSignal {
    Ready,
    Finished,
    Failed(String),
}

/// Messages delivered to the recorder's event loop
#[derive(Debug)]
pub(crate) enum Message {
    Source(SourceId, SourceSignal),
    ChildExited { pid: Pid, status: String },
}

/// Handle a source uses to report back to the recorder
#[derive(Debug, Clone)]
pub struct SourceNotifier {
    id: SourceId,
    tx: UnboundedSender<Message>,
}

impl SourceNotifier {
    pub(crate) fn new(id: SourceId, tx: UnboundedSender<Message>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    /// The source finished preparing and may be started
    pub fn ready(&self) {
        self.send(SourceSignal::Ready);
    }

    /// The source has nothing more to record
    pub fn finished(&self) {
        self.send(SourceSignal::Finished);
    }

    pub fn failed(&self, reason: impl fmt::Display) {
        self.send(SourceSignal::Failed(reason.to_string()));
    }

    /// Pass through a writer result, reporting an error as a failure
    pub fn check<T>(&self, result: Result<T, CaptureError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.failed(e);
                None
            }
        }
    }

    fn send(&self, signal: SourceSignal) {
        // The recorder is gone; nobody is listening
        let _ = self.tx.send(Message::Source(self.id, signal));
    }
}

/// A producer of capture frames.
///
/// Sources that need asynchronous setup return `false` from [`is_ready`]
/// after `prepare` and call [`SourceNotifier::ready`] once set up. A source
/// that completes on its own calls [`SourceNotifier::finished`]; after
/// `stop` every source must eventually report finished or failed.
///
/// [`is_ready`]: Source::is_ready
pub trait Source: Send {
    fn name(&self) -> &str;

    /// Restrict recording to `pid`. Not called in whole-system mode.
    fn add_pid(&mut self, _pid: Pid) {}

    /// Adjust the child process about to be launched (environment, argv)
    fn modify_spawn(&mut self, _spawn: &mut SpawnConfig) {}

    fn prepare(&mut self, writer: CaptureWriter, notifier: SourceNotifier);

    fn is_ready(&self) -> bool {
        true
    }

    fn start(&mut self);

    fn stop(&mut self);

    /// Append post-processing data once recording has stopped. The reader
    /// is positioned at the start of the capture.
    fn supplement(&mut self, _reader: &mut CaptureReader) -> Result<(), CaptureError> {
        Ok(())
    }
}
