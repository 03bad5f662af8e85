//! Filtered iteration over a capture

use crate::error::CaptureError;
use crate::reader::CaptureReader;
use crate::types::events::{Pid, Timestamp};
use crate::types::frames::{CaptureFrame, FrameBody, FrameKind};

/// A predicate over frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureCondition {
    KindIn(Vec<FrameKind>),
    /// Inclusive on both ends
    TimeBetween { begin: Timestamp, end: Timestamp },
    PidIn(Vec<Pid>),
    /// Counter definitions or values touching any of these ids
    CounterIn(Vec<u32>),
    And(Box<CaptureCondition>, Box<CaptureCondition>),
}

impl CaptureCondition {
    pub fn and(self, other: CaptureCondition) -> Self {
        CaptureCondition::And(Box::new(self), Box::new(other))
    }

    pub fn matches(&self, frame: &CaptureFrame) -> bool {
        match self {
            CaptureCondition::KindIn(kinds) => kinds.contains(&frame.kind()),
            CaptureCondition::TimeBetween { begin, end } => {
                (*begin..=*end).contains(&frame.time())
            }
            CaptureCondition::PidIn(pids) => pids.contains(&frame.pid()),
            CaptureCondition::CounterIn(ids) => match &frame.body {
                FrameBody::CounterDefine(define) => {
                    define.counters.iter().any(|c| ids.contains(&c.id))
                }
                FrameBody::CounterSet(set) => set.values.iter().any(|v| ids.contains(&v.id)),
                _ => false,
            },
            CaptureCondition::And(left, right) => left.matches(frame) && right.matches(frame),
        }
    }
}

/// Walks a reader from its current position, yielding frames that satisfy
/// any one of the conditions (or every frame when there are none).
pub struct CaptureCursor<'r> {
    reader: &'r mut CaptureReader,
    conditions: Vec<CaptureCondition>,
}

impl<'r> CaptureCursor<'r> {
    pub fn new(reader: &'r mut CaptureReader) -> Self {
        Self {
            reader,
            conditions: Vec::new(),
        }
    }

    pub fn add_condition(&mut self, condition: CaptureCondition) -> &mut Self {
        self.conditions.push(condition);
        self
    }

    fn accepts(&self, frame: &CaptureFrame) -> bool {
        self.conditions.is_empty() || self.conditions.iter().any(|c| c.matches(frame))
    }

    /// Call `f` for each matching frame until it returns `false` or the
    /// capture ends
    pub fn for_each<F>(&mut self, mut f: F) -> Result<(), CaptureError>
    where
        F: FnMut(&CaptureFrame) -> bool,
    {
        while let Some(frame) = self.reader.read_frame()? {
            if self.accepts(&frame) && !f(&frame) {
                break;
            }
        }
        Ok(())
    }

    /// Rewind the underlying reader
    pub fn reset(&mut self) {
        self.reader.reset();
    }
}
