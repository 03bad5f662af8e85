//! Frame definitions
//!
//! A capture is a header followed by a stream of frames. Every frame starts
//! with a [`FrameHeader`] and carries one [`FrameBody`] variant.

use super::events::{Address, Counter, CounterSample, Cpu, Origin, Pid, Tid, Timestamp};
use serde::{Deserialize, Serialize};

/// Kind tag stored in every frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    Timestamp = 1,
    Sample = 2,
    Map = 3,
    Process = 4,
    Fork = 5,
    Exit = 6,
    JitMap = 7,
    CounterDefine = 8,
    CounterSet = 9,
    Mark = 10,
    Metadata = 11,
    Log = 12,
    FileChunk = 13,
    Allocation = 14,
}

impl FrameKind {
    pub const ALL: [FrameKind; 14] = [
        FrameKind::Timestamp,
        FrameKind::Sample,
        FrameKind::Map,
        FrameKind::Process,
        FrameKind::Fork,
        FrameKind::Exit,
        FrameKind::JitMap,
        FrameKind::CounterDefine,
        FrameKind::CounterSet,
        FrameKind::Mark,
        FrameKind::Metadata,
        FrameKind::Log,
        FrameKind::FileChunk,
        FrameKind::Allocation,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(usize::from(tag).wrapping_sub(1)).copied()
    }
}

/// Common header of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Total encoded length including the header, a multiple of 8
    pub len: u16,
    pub cpu: Cpu,
    pub pid: Pid,
    pub time: Timestamp,
}

impl FrameHeader {
    pub fn origin(&self) -> Origin {
        Origin::new(self.time, self.cpu, self.pid)
    }
}

/// A memory mapping of a file into a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Map {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub inode: u64,
    pub filename: String,
}

/// A stack sample, innermost frame first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub tid: Tid,
    pub addrs: Vec<Address>,
}

/// A memory allocation (positive size) or release (size 0) with its stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub alloc_addr: Address,
    pub alloc_size: i64,
    pub tid: Tid,
    pub addrs: Vec<Address>,
}

/// A timed text mark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    pub duration: i64,
    /// Truncated to 23 bytes on disk
    pub group: String,
    /// Truncated to 39 bytes on disk
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub cmdline: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fork {
    pub child_pid: Pid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub severity: u16,
    pub domain: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    pub metadata: String,
}

/// Synthetic addresses and the JIT symbol names they stand for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitMap {
    pub entries: Vec<(Address, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterDefine {
    pub counters: Vec<Counter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSet {
    pub values: Vec<CounterSample>,
}

/// One piece of a file embedded in the capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub path: String,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Payload of a frame, one variant per [`FrameKind`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameBody {
    Timestamp,
    Sample(Sample),
    Map(Map),
    Process(Process),
    Fork(Fork),
    Exit,
    JitMap(JitMap),
    CounterDefine(CounterDefine),
    CounterSet(CounterSet),
    Mark(Mark),
    Metadata(Metadata),
    Log(Log),
    FileChunk(FileChunk),
    Allocation(Allocation),
}

impl FrameBody {
    pub fn kind(&self) -> FrameKind {
        match self {
            FrameBody::Timestamp => FrameKind::Timestamp,
            FrameBody::Sample(_) => FrameKind::Sample,
            FrameBody::Map(_) => FrameKind::Map,
            FrameBody::Process(_) => FrameKind::Process,
            FrameBody::Fork(_) => FrameKind::Fork,
            FrameBody::Exit => FrameKind::Exit,
            FrameBody::JitMap(_) => FrameKind::JitMap,
            FrameBody::CounterDefine(_) => FrameKind::CounterDefine,
            FrameBody::CounterSet(_) => FrameKind::CounterSet,
            FrameBody::Mark(_) => FrameKind::Mark,
            FrameBody::Metadata(_) => FrameKind::Metadata,
            FrameBody::Log(_) => FrameKind::Log,
            FrameBody::FileChunk(_) => FrameKind::FileChunk,
            FrameBody::Allocation(_) => FrameKind::Allocation,
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureFrame {
    pub header: FrameHeader,
    pub body: FrameBody,
}

impl CaptureFrame {
    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    pub fn time(&self) -> Timestamp {
        self.header.time
    }

    pub fn pid(&self) -> Pid {
        self.header.pid
    }

    /// Time at which the frame's event ends: marks extend by their duration
    pub fn end_time(&self) -> Timestamp {
        match &self.body {
            FrameBody::Mark(mark) => self
                .header
                .time
                .saturating_add(mark.duration.max(0)),
            _ => self.header.time,
        }
    }
}
