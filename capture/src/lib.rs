//! Capture files for Tracefold
//!
//! A capture is an append-only binary log of profiling frames. This crate
//! holds the frame definitions and their on-disk codec, the shared
//! [`CaptureWriter`], the sequential [`CaptureReader`] with its filtering
//! [`CaptureCursor`], and [`cat::merge`] for combining captures.

pub mod cat;
pub mod cursor;
pub mod error;
pub mod protocol;
pub mod reader;
pub mod types;
pub mod utils;
pub mod writer;

// Re-export commonly used types
pub use cursor::{CaptureCondition, CaptureCursor};
pub use error::CaptureError;
pub use protocol::wire::ByteOrder;
pub use reader::CaptureReader;
pub use types::{events::*, frames::*};
pub use writer::{CaptureStat, CaptureWriter, WriterOptions};
