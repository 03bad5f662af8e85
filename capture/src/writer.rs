//! Capture writer
//!
//! [`CaptureWriter`] is a cheaply clonable handle around one capture file.
//! Every clone shares the same buffer, id allocators and file, and all
//! appends go through a single mutex. Frames are buffered in memory and only
//! reach the file on [`CaptureWriter::flush`] (or when the buffer fills up).
//! Dropping the last handle flushes whatever is still buffered.

use crate::error::CaptureError;
use crate::protocol::wire::{
    encode_frame, ByteOrder, FileHeader, END_TIME_OFFSET, JITMAP_MARK, MAX_COUNTER_ID,
    MAX_FILE_CHUNK_DATA, MAX_FRAME_LEN, START_TIME_OFFSET,
};
use crate::reader::CaptureReader;
use crate::types::events::{Address, Counter, CounterSample, Origin, Pid, Tid, Timestamp};
use crate::types::frames::{
    Allocation, CounterDefine, CounterSet, FileChunk, Fork, FrameBody, FrameKind, JitMap, Log,
    Map, Mark, Metadata, Process, Sample,
};
use crate::utils::time::{capture_time_now, monotonic_nanos};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Deepest stack kept per sample or allocation. Longer stacks lose their
/// outermost frames.
pub const MAX_UNWIND_DEPTH: usize = 128;

/// Default in-memory buffer: 64 pages
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 4096;

/// Bytes needed to hold one jitmap entry besides the name itself
const JITMAP_ENTRY_OVERHEAD: usize = 8 + 1;

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub buffer_size: usize,
    /// Byte order used for every multi-byte field
    pub byte_order: ByteOrder,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            byte_order: ByteOrder::native(),
        }
    }
}

impl WriterOptions {
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            ..Self::default()
        }
    }
}

/// Frame counts and time bounds of everything written so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStat {
    counts: HashMap<FrameKind, u64>,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

impl CaptureStat {
    pub fn count(&self, kind: FrameKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

#[derive(Clone)]
pub struct CaptureWriter {
    inner: Arc<Mutex<WriterInner>>,
}

struct WriterInner {
    file: File,
    path: Option<PathBuf>,
    order: ByteOrder,
    buf: Vec<u8>,
    buffer_size: usize,
    header: FileHeader,
    next_counter_id: u32,
    addr_seq: u64,
    jit_names: HashMap<String, Address>,
    pending_jitmap: Vec<(Address, String)>,
    pending_jitmap_bytes: usize,
    counts: HashMap<FrameKind, u64>,
    max_time: Option<Timestamp>,
    patched_range: Option<(Timestamp, Timestamp)>,
    failed: Option<String>,
}

impl std::fmt::Debug for CaptureWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CaptureWriter")
            .field("path", &inner.path)
            .field("buffered", &inner.buf.len())
            .field("failed", &inner.failed)
            .finish()
    }
}

impl CaptureWriter {
    /// Create (or truncate) a capture file at `path`
    pub fn create(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::open(file, Some(path.to_path_buf()), options)
    }

    /// Take over an already-open file; its previous contents are discarded
    pub fn from_file(file: File, options: WriterOptions) -> Result<Self, CaptureError> {
        file.set_len(0)?;
        Self::open(file, None, options)
    }

    /// A capture backed by an unnamed temporary file
    pub fn anonymous(options: WriterOptions) -> Result<Self, CaptureError> {
        Self::open(tempfile::tempfile()?, None, options)
    }

    fn open(
        mut file: File,
        path: Option<PathBuf>,
        options: WriterOptions,
    ) -> Result<Self, CaptureError> {
        let start_time = monotonic_nanos();
        let header = FileHeader {
            byte_order: options.byte_order,
            capture_time: capture_time_now(),
            start_time,
            // Unpatched marker: readers discover the real end by scanning
            end_time: start_time - 1,
        };
        file.write_all(&header.encode())?;

        let buffer_size = options.buffer_size.max(MAX_FRAME_LEN);
        debug!(?path, buffer_size, "opened capture writer");

        Ok(Self {
            inner: Arc::new(Mutex::new(WriterInner {
                file,
                path,
                order: options.byte_order,
                buf: Vec::with_capacity(buffer_size),
                buffer_size,
                header,
                next_counter_id: 1,
                addr_seq: 0,
                jit_names: HashMap::new(),
                pending_jitmap: Vec::new(),
                pending_jitmap_bytes: 0,
                counts: HashMap::new(),
                max_time: None,
                patched_range: None,
                failed: None,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WriterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live handles sharing this writer
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.lock().order
    }

    pub fn start_time(&self) -> Timestamp {
        self.lock().header.start_time
    }

    /// Append any frame
    pub fn add_frame(&self, origin: Origin, body: &FrameBody) -> Result<(), CaptureError> {
        self.lock().append(origin, body)
    }

    pub fn add_timestamp(&self, origin: Origin) -> Result<(), CaptureError> {
        self.add_frame(origin, &FrameBody::Timestamp)
    }

    pub fn add_sample(&self, origin: Origin, tid: Tid, addrs: &[Address]) -> Result<(), CaptureError> {
        self.add_frame(
            origin,
            &FrameBody::Sample(Sample {
                tid,
                addrs: innermost(addrs).to_vec(),
            }),
        )
    }

    pub fn add_allocation(&self, origin: Origin, allocation: &Allocation) -> Result<(), CaptureError> {
        let allocation = Allocation {
            addrs: innermost(&allocation.addrs).to_vec(),
            ..allocation.clone()
        };
        self.add_frame(origin, &FrameBody::Allocation(allocation))
    }

    pub fn add_map(&self, origin: Origin, map: &Map) -> Result<(), CaptureError> {
        self.add_frame(origin, &FrameBody::Map(map.clone()))
    }

    pub fn add_mark(&self, origin: Origin, mark: &Mark) -> Result<(), CaptureError> {
        self.add_frame(origin, &FrameBody::Mark(mark.clone()))
    }

    pub fn add_process(&self, origin: Origin, cmdline: &str) -> Result<(), CaptureError> {
        self.add_frame(
            origin,
            &FrameBody::Process(Process {
                cmdline: cmdline.to_string(),
            }),
        )
    }

    pub fn add_fork(&self, origin: Origin, child_pid: Pid) -> Result<(), CaptureError> {
        self.add_frame(origin, &FrameBody::Fork(Fork { child_pid }))
    }

    pub fn add_exit(&self, origin: Origin) -> Result<(), CaptureError> {
        self.add_frame(origin, &FrameBody::Exit)
    }

    pub fn add_log(
        &self,
        origin: Origin,
        severity: u16,
        domain: &str,
        message: &str,
    ) -> Result<(), CaptureError> {
        self.add_frame(
            origin,
            &FrameBody::Log(Log {
                severity,
                domain: domain.to_string(),
                message: message.to_string(),
            }),
        )
    }

    pub fn add_metadata(&self, origin: Origin, id: &str, metadata: &str) -> Result<(), CaptureError> {
        self.add_frame(
            origin,
            &FrameBody::Metadata(Metadata {
                id: id.to_string(),
                metadata: metadata.to_string(),
            }),
        )
    }

    /// Define counters. Ids must come from [`request_counter_ids`](Self::request_counter_ids).
    pub fn add_counter_define(&self, origin: Origin, counters: &[Counter]) -> Result<(), CaptureError> {
        self.add_frame(
            origin,
            &FrameBody::CounterDefine(CounterDefine {
                counters: counters.to_vec(),
            }),
        )
    }

    pub fn add_counter_set(&self, origin: Origin, values: &[CounterSample]) -> Result<(), CaptureError> {
        self.add_frame(
            origin,
            &FrameBody::CounterSet(CounterSet {
                values: values.to_vec(),
            }),
        )
    }

    /// Embed a file, split over as many chunk frames as needed
    pub fn add_file(
        &self,
        origin: Origin,
        path: &str,
        is_last: bool,
        data: &[u8],
    ) -> Result<(), CaptureError> {
        let mut inner = self.lock();
        let mut chunks = data.chunks(MAX_FILE_CHUNK_DATA).peekable();
        if chunks.peek().is_none() {
            return inner.append(
                origin,
                &FrameBody::FileChunk(FileChunk {
                    path: path.to_string(),
                    is_last,
                    data: Vec::new(),
                }),
            );
        }
        while let Some(chunk) = chunks.next() {
            let body = FrameBody::FileChunk(FileChunk {
                path: path.to_string(),
                is_last: is_last && chunks.peek().is_none(),
                data: chunk.to_vec(),
            });
            inner.append(origin, &body)?;
        }
        Ok(())
    }

    /// Synthetic address for a JIT symbol name. Names are deduplicated; new
    /// entries are written as one jitmap frame before the next frame that
    /// can reference them, or on flush.
    pub fn add_jitmap(&self, name: &str) -> Result<Address, CaptureError> {
        self.lock().add_jitmap(name)
    }

    /// Reserve `count` consecutive counter ids and return the first one
    pub fn request_counter_ids(&self, count: u32) -> Result<u32, CaptureError> {
        let mut inner = self.lock();
        let base = inner.next_counter_id;
        match base.checked_add(count) {
            Some(next) if next - 1 <= MAX_COUNTER_ID => {
                inner.next_counter_id = next;
                Ok(base)
            }
            _ => Err(CaptureError::CounterIdsExhausted),
        }
    }

    /// Write buffered frames and refresh the header's end time
    pub fn flush(&self) -> Result<(), CaptureError> {
        self.lock().flush()
    }

    /// Overwrite the header's recorded time range.
    ///
    /// This is the one edit of already-written bytes. It flushes first, and a
    /// later call widens the range instead of replacing it.
    pub fn set_time_range(&self, start: Timestamp, end: Timestamp) -> Result<(), CaptureError> {
        let mut inner = self.lock();
        inner.flush()?;
        let (start, end) = match inner.patched_range {
            Some((s, e)) => (s.min(start), e.max(end)),
            None => (start, end),
        };
        inner.patched_range = Some((start, end));
        inner.write_range(start, end)
    }

    /// Flush and open an independent reader over the same file
    pub fn create_reader(&self) -> Result<CaptureReader, CaptureError> {
        let mut inner = self.lock();
        inner.flush()?;
        let file = inner.file.try_clone()?;
        drop(inner);
        CaptureReader::from_file(file)
    }

    /// Flush and copy the capture to `path`
    pub fn save_as(&self, path: impl AsRef<Path>) -> Result<(), CaptureError> {
        let mut inner = self.lock();
        inner.flush()?;
        let mut out = File::create(path.as_ref())?;
        let mut chunk = vec![0u8; 64 * 1024];
        let mut offset = 0u64;
        loop {
            let n = inner.file.read_at(&mut chunk, offset)?;
            if n == 0 {
                break;
            }
            out.write_all(&chunk[..n])?;
            offset += n as u64;
        }
        out.flush()?;
        debug!(path = %path.as_ref().display(), bytes = offset, "saved capture copy");
        Ok(())
    }

    pub fn stat(&self) -> CaptureStat {
        let inner = self.lock();
        let (start_time, end_time) = inner.current_range();
        CaptureStat {
            counts: inner.counts.clone(),
            start_time,
            end_time,
        }
    }
}

impl WriterInner {
    fn check(&self) -> Result<(), CaptureError> {
        match &self.failed {
            Some(reason) => Err(CaptureError::WriterFailed(reason.clone())),
            None => Ok(()),
        }
    }

    fn append(&mut self, origin: Origin, body: &FrameBody) -> Result<(), CaptureError> {
        self.check()?;

        // Definitions must precede the first frame that can use them
        if matches!(body, FrameBody::Sample(_) | FrameBody::Allocation(_)) {
            self.emit_jitmap()?;
        }

        let frame = encode_frame(self.order, origin, body)?;
        self.push_bytes(&frame)?;

        *self.counts.entry(body.kind()).or_insert(0) += 1;
        let end = match body {
            FrameBody::Mark(mark) => origin.time.saturating_add(mark.duration.max(0)),
            _ => origin.time,
        };
        self.max_time = Some(self.max_time.map_or(end, |t| t.max(end)));
        Ok(())
    }

    fn push_bytes(&mut self, frame: &[u8]) -> Result<(), CaptureError> {
        if self.buf.len() + frame.len() > self.buffer_size {
            self.write_buffer()?;
        }
        self.buf.extend_from_slice(frame);
        Ok(())
    }

    fn add_jitmap(&mut self, name: &str) -> Result<Address, CaptureError> {
        self.check()?;
        if let Some(addr) = self.jit_names.get(name) {
            return Ok(*addr);
        }
        if self.addr_seq >= u64::from(u32::MAX) {
            return Err(CaptureError::JitmapExhausted);
        }

        let entry_bytes = name.len() + JITMAP_ENTRY_OVERHEAD;
        if self.pending_jitmap_bytes + entry_bytes > MAX_FRAME_LEN - 64 {
            self.emit_jitmap()?;
        }

        self.addr_seq += 1;
        let addr = JITMAP_MARK | self.addr_seq;
        self.jit_names.insert(name.to_string(), addr);
        self.pending_jitmap.push((addr, name.to_string()));
        self.pending_jitmap_bytes += entry_bytes;
        Ok(addr)
    }

    fn emit_jitmap(&mut self) -> Result<(), CaptureError> {
        if self.pending_jitmap.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(&mut self.pending_jitmap);
        self.pending_jitmap_bytes = 0;
        debug!(entries = entries.len(), "writing jitmap frame");
        let origin = Origin::new(monotonic_nanos(), -1, std::process::id() as Pid);
        let frame = encode_frame(self.order, origin, &FrameBody::JitMap(JitMap { entries }))?;
        self.push_bytes(&frame)?;
        *self.counts.entry(FrameKind::JitMap).or_insert(0) += 1;
        Ok(())
    }

    fn write_buffer(&mut self) -> Result<(), CaptureError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.file.write_all(&self.buf) {
            warn!(error = %e, "capture write failed");
            self.failed = Some(e.to_string());
            return Err(CaptureError::Io(e));
        }
        self.buf.clear();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CaptureError> {
        self.check()?;
        self.emit_jitmap()?;
        self.write_buffer()?;
        let (start, end) = self.current_range();
        self.write_range(start, end)
    }

    fn current_range(&self) -> (Timestamp, Timestamp) {
        match (self.patched_range, self.max_time) {
            (Some((start, end)), max) => (start, max.map_or(end, |m| m.max(end))),
            (None, Some(max)) => (self.header.start_time, max),
            (None, None) => (self.header.start_time, self.header.end_time),
        }
    }

    fn write_range(&mut self, start: Timestamp, end: Timestamp) -> Result<(), CaptureError> {
        let result = self
            .file
            .write_all_at(&self.order.encode_i64(start), START_TIME_OFFSET)
            .and_then(|_| {
                self.file
                    .write_all_at(&self.order.encode_i64(end), END_TIME_OFFSET)
            });
        if let Err(e) = result {
            self.failed = Some(e.to_string());
            return Err(CaptureError::Io(e));
        }
        self.header.start_time = start;
        self.header.end_time = end;
        Ok(())
    }
}

impl Drop for WriterInner {
    fn drop(&mut self) {
        if self.failed.is_some() {
            return;
        }
        if let Err(e) = self.flush() {
            warn!(error = %e, "final capture flush failed");
        }
    }
}

/// Addresses are innermost first
fn innermost(addrs: &[Address]) -> &[Address] {
    &addrs[..addrs.len().min(MAX_UNWIND_DEPTH)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire;
    use crate::types::events::CounterValue;

    #[test]
    fn test_counter_ids_are_contiguous() {
        let writer = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
        assert_eq!(writer.request_counter_ids(3).unwrap(), 1);
        assert_eq!(writer.request_counter_ids(1).unwrap(), 4);
        assert!(matches!(
            writer.request_counter_ids(MAX_COUNTER_ID),
            Err(CaptureError::CounterIdsExhausted)
        ));
        // A failed request reserves nothing
        assert_eq!(writer.request_counter_ids(1).unwrap(), 5);
    }

    #[test]
    fn test_jitmap_dedup() {
        let writer = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
        let a = writer.add_jitmap("js::foo").unwrap();
        let b = writer.add_jitmap("js::bar").unwrap();
        assert_ne!(a, b);
        assert_eq!(writer.add_jitmap("js::foo").unwrap(), a);
        assert!(wire::is_jit_address(a));
    }

    #[test]
    fn test_jitmap_emitted_before_sample() {
        let writer = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
        let addr = writer.add_jitmap("jit_fn").unwrap();
        writer.add_sample(Origin::at(10), 1, &[addr]).unwrap();

        let mut reader = writer.create_reader().unwrap();
        assert_eq!(reader.peek_kind().unwrap(), Some(FrameKind::JitMap));
        let frame = reader.read_frame().unwrap().unwrap();
        match frame.body {
            FrameBody::JitMap(map) => assert_eq!(map.entries, vec![(addr, "jit_fn".to_string())]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reader.peek_kind().unwrap(), Some(FrameKind::Sample));
    }

    #[test]
    fn test_stat_counts() {
        let writer = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
        writer.add_process(Origin::new(5, -1, 1), "app").unwrap();
        writer.add_sample(Origin::new(6, 0, 1), 1, &[1, 2]).unwrap();
        writer.add_sample(Origin::new(9, 0, 1), 1, &[1, 3]).unwrap();
        let stat = writer.stat();
        assert_eq!(stat.count(FrameKind::Sample), 2);
        assert_eq!(stat.count(FrameKind::Process), 1);
        assert_eq!(stat.total(), 3);
        assert_eq!(stat.end_time, 9);
    }

    #[test]
    fn test_handles_share_state() {
        let writer = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
        let other = writer.clone();
        assert_eq!(writer.handle_count(), 2);
        other.add_exit(Origin::at(1)).unwrap();
        assert_eq!(writer.stat().count(FrameKind::Exit), 1);
        drop(other);
        assert_eq!(writer.handle_count(), 1);
    }

    #[test]
    fn test_deep_stacks_keep_innermost_frames() {
        let writer = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
        let addrs: Vec<Address> = (1..=200).collect();
        writer.add_sample(Origin::at(1), 7, &addrs).unwrap();
        let allocation = Allocation {
            alloc_addr: 0xdead_0000,
            alloc_size: 64,
            tid: 7,
            addrs: addrs.clone(),
        };
        writer.add_allocation(Origin::at(2), &allocation).unwrap();
        writer.add_sample(Origin::at(3), 7, &addrs[..5]).unwrap();

        let mut reader = writer.create_reader().unwrap();
        let (_, sample) = reader.read_sample().unwrap();
        assert_eq!(sample.addrs, addrs[..MAX_UNWIND_DEPTH]);
        let (_, stored) = reader.read_allocation().unwrap();
        assert_eq!(stored.addrs, addrs[..MAX_UNWIND_DEPTH]);
        assert_eq!(stored.alloc_size, 64);
        let (_, short) = reader.read_sample().unwrap();
        assert_eq!(short.addrs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_counter_ids_outside_24_bits_are_rejected() {
        let writer = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
        let counter = |id| Counter {
            id,
            category: "Memory".into(),
            name: "Used".into(),
            description: String::new(),
            value: CounterValue::Int64(0),
        };
        assert!(matches!(
            writer.add_counter_define(Origin::at(1), &[counter(MAX_COUNTER_ID + 1)]),
            Err(CaptureError::InvalidCounterId(id)) if id == MAX_COUNTER_ID + 1
        ));
        assert!(matches!(
            writer.add_counter_set(Origin::at(2), &[CounterSample::int64(1 << 24 | 3, 9)]),
            Err(CaptureError::InvalidCounterId(_))
        ));
        assert!(matches!(
            writer.add_counter_set(Origin::at(3), &[CounterSample::int64(0, 9)]),
            Err(CaptureError::InvalidCounterId(0))
        ));
        assert_eq!(writer.stat().total(), 0);

        writer.add_counter_define(Origin::at(4), &[counter(MAX_COUNTER_ID)]).unwrap();
        let mut reader = writer.create_reader().unwrap();
        let (_, define) = reader.read_counter_define().unwrap();
        assert_eq!(define.counters[0].id, MAX_COUNTER_ID);
    }

    #[test]
    fn test_large_file_is_chunked() {
        let writer = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        writer.add_file(Origin::at(1), "/proc/kallsyms", true, &data).unwrap();
        assert!(writer.stat().count(FrameKind::FileChunk) > 1);

        let mut reader = writer.create_reader().unwrap();
        assert_eq!(reader.read_file("/proc/kallsyms").unwrap(), Some(data));
    }
}
