//! Merging one capture into another
//!
//! Counter ids and JIT addresses are owned by the writer that issued them, so
//! copying frames from a foreign capture has to re-issue both through the
//! destination writer. The mapping lives in two [`TranslateTable`]s that are
//! sorted after every batch of insertions and searched with binary search.

use crate::error::CaptureError;
use crate::protocol::wire::is_jit_address;
use crate::reader::CaptureReader;
use crate::types::events::{Address, Timestamp};
use crate::types::frames::{
    Allocation, CounterDefine, CounterSet, FrameBody, JitMap, Sample,
};
use crate::writer::CaptureWriter;
use tracing::{debug, info};

/// Sorted (source, destination) id pairs
#[derive(Debug, Default)]
pub(crate) struct TranslateTable {
    pairs: Vec<(u64, u64)>,
    sorted: bool,
}

impl TranslateTable {
    pub(crate) fn add(&mut self, src: u64, dst: u64) {
        self.pairs.push((src, dst));
        self.sorted = false;
    }

    pub(crate) fn sort(&mut self) {
        // A later definition of the same source id wins
        self.pairs.reverse();
        self.pairs.sort_by_key(|(src, _)| *src);
        self.pairs.dedup_by_key(|(src, _)| *src);
        self.sorted = true;
    }

    pub(crate) fn lookup(&self, src: u64) -> Option<u64> {
        debug_assert!(self.sorted || self.pairs.is_empty());
        self.pairs
            .binary_search_by_key(&src, |(s, _)| *s)
            .ok()
            .map(|i| self.pairs[i].1)
    }

    pub(crate) fn len(&self) -> usize {
        self.pairs.len()
    }
}

#[derive(Default)]
struct Translations {
    addrs: TranslateTable,
    counters: TranslateTable,
}

impl Translations {
    fn address(&self, addr: Address) -> Result<Address, CaptureError> {
        if !is_jit_address(addr) {
            return Ok(addr);
        }
        self.addrs.lookup(addr).ok_or(CaptureError::UntranslatedId {
            what: "jit address",
            id: addr,
        })
    }

    fn addresses(&self, addrs: &[Address]) -> Result<Vec<Address>, CaptureError> {
        addrs.iter().map(|a| self.address(*a)).collect()
    }

    fn counter(&self, id: u32) -> Result<u32, CaptureError> {
        self.counters
            .lookup(u64::from(id))
            .map(|dst| dst as u32)
            .ok_or(CaptureError::UntranslatedId {
                what: "counter id",
                id: u64::from(id),
            })
    }
}

/// Copy every frame of `src` into `dest`.
///
/// `src` is rewound first. On success `dest` is flushed and its header range
/// is widened to cover the merged frames. Any failure aborts the merge; retry
/// with a fresh reader.
pub fn merge(dest: &CaptureWriter, src: &mut CaptureReader) -> Result<(), CaptureError> {
    src.reset();

    let mut tables = Translations::default();
    let mut first_time: Timestamp = src.start_time();
    let mut last_time: Option<Timestamp> = None;
    let mut frames = 0u64;

    while let Some(frame) = src.read_frame()? {
        first_time = first_time.min(frame.time());
        let end = frame.end_time();
        last_time = Some(last_time.map_or(end, |t| t.max(end)));
        frames += 1;

        let origin = frame.header.origin();
        let body = match frame.body {
            FrameBody::JitMap(JitMap { entries }) => {
                for (addr, name) in &entries {
                    let replacement = dest.add_jitmap(name)?;
                    tables.addrs.add(*addr, replacement);
                }
                tables.addrs.sort();
                // The destination writes its own jitmap frames
                continue;
            }
            FrameBody::CounterDefine(CounterDefine { counters }) => {
                let mut remapped = Vec::with_capacity(counters.len());
                for mut counter in counters {
                    let id = dest.request_counter_ids(1)?;
                    tables.counters.add(u64::from(counter.id), u64::from(id));
                    counter.id = id;
                    remapped.push(counter);
                }
                tables.counters.sort();
                FrameBody::CounterDefine(CounterDefine { counters: remapped })
            }
            FrameBody::CounterSet(CounterSet { values }) => {
                let mut remapped = Vec::with_capacity(values.len());
                for mut value in values {
                    value.id = tables.counter(value.id)?;
                    remapped.push(value);
                }
                FrameBody::CounterSet(CounterSet { values: remapped })
            }
            FrameBody::Sample(Sample { tid, addrs }) => FrameBody::Sample(Sample {
                tid,
                addrs: tables.addresses(&addrs)?,
            }),
            FrameBody::Allocation(alloc) => FrameBody::Allocation(Allocation {
                addrs: tables.addresses(&alloc.addrs)?,
                ..alloc
            }),
            other => other,
        };

        dest.add_frame(origin, &body)?;
    }

    let last_time = last_time.unwrap_or_else(|| src.end_time());
    dest.flush()?;
    dest.set_time_range(first_time, last_time)?;

    info!(
        frames,
        jit_symbols = tables.addrs.len(),
        counters = tables.counters.len(),
        start = first_time,
        end = last_time,
        "merged capture"
    );
    Ok(())
}

/// Run [`merge`] on a blocking worker thread. The reader is handed back so
/// the caller can inspect or reuse it.
pub async fn merge_in_background(
    dest: CaptureWriter,
    mut src: CaptureReader,
) -> Result<CaptureReader, CaptureError> {
    debug!("scheduling background merge");
    tokio::task::spawn_blocking(move || merge(&dest, &mut src).map(|_| src))
        .await
        .map_err(|e| CaptureError::Worker(e.to_string()))?
}
