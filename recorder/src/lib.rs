//! Recording orchestration for Tracefold
//!
//! This library drives a set of [`Source`]s through one recording session:
//! it hands them the shared capture writer, waits for them to become ready,
//! starts and stops them together, and collects failures. Subscribers follow
//! the session through [`RecorderEvent`]s.

pub mod config;
pub mod error;
pub mod profiler;
pub mod source;
mod spawn;

pub use config::{RecorderConfig, SpawnConfig};
pub use error::RecorderError;
pub use profiler::{Recorder, RecorderEvent, RecorderState};
pub use source::{Source, SourceFailure, SourceId, SourceNotifier};
