//! Scalar types shared by every frame kind
//!
//! Times are monotonic nanoseconds. A cpu or pid of `-1` means "unspecified".

use serde::{Deserialize, Serialize};

/// Monotonic timestamp in nanoseconds
pub type Timestamp = i64;

/// Process ID
pub type Pid = i32;

/// Thread ID
pub type Tid = i32;

/// CPU core number, `-1` when unknown
pub type Cpu = i32;

/// Instruction address or synthetic JIT address
pub type Address = u64;

/// Where and when a frame was produced.
///
/// Every `add_*` call on the writer takes one of these; readers get the same
/// fields back in [`FrameHeader`](crate::types::frames::FrameHeader).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub time: Timestamp,
    pub cpu: Cpu,
    pub pid: Pid,
}

impl Origin {
    pub fn new(time: Timestamp, cpu: Cpu, pid: Pid) -> Self {
        Self { time, cpu, pid }
    }

    /// An origin with unspecified cpu and pid
    pub fn at(time: Timestamp) -> Self {
        Self::new(time, -1, -1)
    }
}

/// Initial value carried by a counter definition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CounterValue {
    Int64(i64),
    Double(f64),
}

impl CounterValue {
    pub(crate) fn type_tag(&self) -> u8 {
        match self {
            CounterValue::Int64(_) => 0,
            CounterValue::Double(_) => 1,
        }
    }

    pub(crate) fn bits(&self) -> u64 {
        match self {
            CounterValue::Int64(v) => *v as u64,
            CounterValue::Double(v) => v.to_bits(),
        }
    }

    pub(crate) fn from_parts(type_tag: u8, bits: u64) -> Option<Self> {
        match type_tag {
            0 => Some(CounterValue::Int64(bits as i64)),
            1 => Some(CounterValue::Double(f64::from_bits(bits))),
            _ => None,
        }
    }
}

/// A counter definition; ids are allocated by the capture writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    /// 24-bit counter id, never 0
    pub id: u32,
    pub category: String,
    pub name: String,
    pub description: String,
    pub value: CounterValue,
}

/// One (id, value) pair inside a counter-set frame.
///
/// The value is stored as raw bits; its interpretation depends on the type
/// recorded in the matching [`Counter`] definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterSample {
    pub id: u32,
    pub bits: u64,
}

impl CounterSample {
    pub fn int64(id: u32, value: i64) -> Self {
        Self {
            id,
            bits: value as u64,
        }
    }

    pub fn double(id: u32, value: f64) -> Self {
        Self {
            id,
            bits: value.to_bits(),
        }
    }

    pub fn as_int64(&self) -> i64 {
        self.bits as i64
    }

    pub fn as_double(&self) -> f64 {
        f64::from_bits(self.bits)
    }
}
