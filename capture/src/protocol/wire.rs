//! Binary layout of capture files.
//!
//! A capture is a fixed 256-byte [`FileHeader`] followed by frames. Each frame
//! is a 24-byte header (`len`, `cpu`, `pid`, `time`, `kind`) and a kind-specific
//! payload, padded so that `len` is a multiple of [`CAPTURE_ALIGN`].
//!
//! Multi-byte fields use the byte order recorded in the file header. Decoding
//! never trusts a length read from the file: every count and string is checked
//! against the bytes actually available in the frame, and violations surface
//! as [`CaptureError::CorruptFrame`].

use crate::error::CaptureError;
use crate::types::events::{Counter, CounterSample, CounterValue, Origin};
use crate::types::frames::{
    Allocation, CaptureFrame, CounterDefine, CounterSet, FileChunk, Fork, FrameBody, FrameHeader,
    FrameKind, JitMap, Log, Map, Mark, Metadata, Process, Sample,
};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

pub const CAPTURE_MAGIC: u32 = 0xFDCA_975E;
pub const CAPTURE_VERSION: u8 = 1;
pub const CAPTURE_ALIGN: usize = 8;
pub const FILE_HEADER_SIZE: usize = 256;
pub const FRAME_HEADER_SIZE: usize = 24;

/// Largest encodable frame: `len` is a u16 and must stay aligned
pub const MAX_FRAME_LEN: usize = u16::MAX as usize & !(CAPTURE_ALIGN - 1);

/// High bits shared by every synthetic JIT address
pub const JITMAP_MARK: u64 = 0xE000_0000_0000_0000;
const JITMAP_MARK_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// Counter ids are 24 bits wide; 0 is reserved for "unused slot"
pub const MAX_COUNTER_ID: u32 = (1 << 24) - 1;

/// Slots per group in a counter-set frame
pub const COUNTER_GROUP_SIZE: usize = 8;

pub(crate) const START_TIME_OFFSET: u64 = 72;
pub(crate) const END_TIME_OFFSET: u64 = 80;

const CAPTURE_TIME_LEN: usize = 64;
const COUNTER_CATEGORY_LEN: usize = 32;
const COUNTER_NAME_LEN: usize = 32;
const COUNTER_DESCRIPTION_LEN: usize = 52;
const COUNTER_DEF_SIZE: usize =
    COUNTER_CATEGORY_LEN + COUNTER_NAME_LEN + COUNTER_DESCRIPTION_LEN + 4 + 8;
const COUNTER_GROUP_BYTES: usize = COUNTER_GROUP_SIZE * (4 + 8);
const MARK_GROUP_LEN: usize = 24;
const MARK_NAME_LEN: usize = 40;
const METADATA_ID_LEN: usize = 40;
const LOG_DOMAIN_LEN: usize = 32;
const FILE_PATH_LEN: usize = 256;

/// Whether `addr` was issued by a writer's jitmap allocator
pub fn is_jit_address(addr: u64) -> bool {
    addr & JITMAP_MARK_MASK == JITMAP_MARK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    pub(crate) fn encode_i64(self, value: i64) -> [u8; 8] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// File header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub byte_order: ByteOrder,
    /// Wall-clock creation time, ISO-8601
    pub capture_time: String,
    pub start_time: i64,
    /// Older than `start_time` until the writer records a real end
    pub end_time: i64,
}

impl FileHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new(self.byte_order, FILE_HEADER_SIZE);
        // Magic and version are order-independent so foreign files are recognized
        enc.buf.put_u32_le(CAPTURE_MAGIC);
        enc.put_u8(CAPTURE_VERSION);
        enc.put_u8(u8::from(self.byte_order == ByteOrder::Little));
        enc.put_zeros(2);
        enc.put_fixed_str(&self.capture_time, CAPTURE_TIME_LEN);
        enc.put_i64(self.start_time);
        enc.put_i64(self.end_time);
        enc.put_zeros(FILE_HEADER_SIZE - enc.buf.len());
        enc.buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CaptureError> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(CaptureError::corrupt("capture shorter than its header"));
        }
        let mut raw = &bytes[..FILE_HEADER_SIZE];
        let magic = raw.get_u32_le();
        if magic != CAPTURE_MAGIC {
            return Err(CaptureError::BadMagic(magic));
        }
        let version = raw.get_u8();
        if version != CAPTURE_VERSION {
            return Err(CaptureError::UnsupportedVersion(version));
        }
        let byte_order = if raw.get_u8() != 0 {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        };
        raw.advance(2);

        let mut dec = Decoder::new(byte_order, raw);
        let capture_time = dec.fixed_str(CAPTURE_TIME_LEN, "capture time")?;
        let start_time = dec.get_i64("start time")?;
        let end_time = dec.get_i64("end time")?;

        Ok(Self {
            byte_order,
            capture_time,
            start_time,
            end_time,
        })
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

macro_rules! put_int {
    ($name:ident, $ty:ty, $le:ident, $be:ident) => {
        fn $name(&mut self, value: $ty) {
            match self.order {
                ByteOrder::Little => self.buf.$le(value),
                ByteOrder::Big => self.buf.$be(value),
            }
        }
    };
}

struct Encoder {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl Encoder {
    fn new(order: ByteOrder, capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            order,
        }
    }

    put_int!(put_u16, u16, put_u16_le, put_u16);
    put_int!(put_i16, i16, put_i16_le, put_i16);
    put_int!(put_u32, u32, put_u32_le, put_u32);
    put_int!(put_i32, i32, put_i32_le, put_i32);
    put_int!(put_u64, u64, put_u64_le, put_u64);
    put_int!(put_i64, i64, put_i64_le, put_i64);

    fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    fn put_zeros(&mut self, count: usize) {
        self.buf.put_bytes(0, count);
    }

    /// NUL-padded field of exactly `width` bytes, always NUL-terminated
    fn put_fixed_str(&mut self, value: &str, width: usize) {
        let text = truncate_str(text_before_nul(value), width - 1);
        self.buf.put_slice(text.as_bytes());
        self.put_zeros(width - text.len());
    }

    fn put_cstr(&mut self, value: &str) {
        self.buf.put_slice(text_before_nul(value).as_bytes());
        self.put_u8(0);
    }

    fn pad_to_align(&mut self) {
        let rem = self.buf.len() % CAPTURE_ALIGN;
        if rem != 0 {
            self.put_zeros(CAPTURE_ALIGN - rem);
        }
    }
}

fn text_before_nul(value: &str) -> &str {
    match value.find('\0') {
        Some(end) => &value[..end],
        None => value,
    }
}

fn truncate_str(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Encode one frame. The returned buffer's length is a multiple of 8.
pub fn encode_frame(
    order: ByteOrder,
    origin: Origin,
    body: &FrameBody,
) -> Result<Vec<u8>, CaptureError> {
    let kind = body.kind();
    let mut enc = Encoder::new(order, FRAME_HEADER_SIZE + 64);

    enc.put_u16(0); // patched below
    enc.put_i16(origin.cpu.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16);
    enc.put_i32(origin.pid);
    enc.put_i64(origin.time);
    enc.put_u8(kind.tag());
    enc.put_zeros(7);

    match body {
        FrameBody::Timestamp | FrameBody::Exit => {}
        FrameBody::Sample(sample) => {
            enc.put_u16(addr_count(kind, sample.addrs.len())?);
            enc.put_zeros(2);
            enc.put_i32(sample.tid);
            for addr in &sample.addrs {
                enc.put_u64(*addr);
            }
        }
        FrameBody::Allocation(alloc) => {
            enc.put_u64(alloc.alloc_addr);
            enc.put_i64(alloc.alloc_size);
            enc.put_i32(alloc.tid);
            enc.put_u16(addr_count(kind, alloc.addrs.len())?);
            enc.put_zeros(2);
            for addr in &alloc.addrs {
                enc.put_u64(*addr);
            }
        }
        FrameBody::Map(map) => {
            enc.put_u64(map.start);
            enc.put_u64(map.end);
            enc.put_u64(map.offset);
            enc.put_u64(map.inode);
            enc.put_cstr(&map.filename);
        }
        FrameBody::Process(process) => enc.put_cstr(&process.cmdline),
        FrameBody::Fork(fork) => {
            enc.put_i32(fork.child_pid);
            enc.put_zeros(4);
        }
        FrameBody::JitMap(jitmap) => {
            enc.put_u32(jitmap.entries.len() as u32);
            enc.put_zeros(4);
            for (addr, name) in &jitmap.entries {
                enc.put_u64(*addr);
                enc.put_cstr(name);
            }
        }
        FrameBody::CounterDefine(define) => {
            enc.put_u16(u16::try_from(define.counters.len()).map_err(|_| too_large(kind, usize::MAX))?);
            enc.put_zeros(6);
            for counter in &define.counters {
                check_counter_id(counter.id)?;
                enc.put_fixed_str(&counter.category, COUNTER_CATEGORY_LEN);
                enc.put_fixed_str(&counter.name, COUNTER_NAME_LEN);
                enc.put_fixed_str(&counter.description, COUNTER_DESCRIPTION_LEN);
                enc.put_u32(u32::from(counter.value.type_tag()) << 24 | counter.id);
                enc.put_u64(counter.value.bits());
            }
        }
        FrameBody::CounterSet(set) => {
            for value in &set.values {
                check_counter_id(value.id)?;
            }
            let groups = set.values.chunks(COUNTER_GROUP_SIZE);
            enc.put_u16(u16::try_from(groups.len()).map_err(|_| too_large(kind, usize::MAX))?);
            enc.put_zeros(6);
            for group in groups {
                for slot in 0..COUNTER_GROUP_SIZE {
                    enc.put_u32(group.get(slot).map_or(0, |v| v.id));
                }
                for slot in 0..COUNTER_GROUP_SIZE {
                    enc.put_u64(group.get(slot).map_or(0, |v| v.bits));
                }
            }
        }
        FrameBody::Mark(mark) => {
            enc.put_i64(mark.duration);
            enc.put_fixed_str(&mark.group, MARK_GROUP_LEN);
            enc.put_fixed_str(&mark.name, MARK_NAME_LEN);
            enc.put_cstr(&mark.message);
        }
        FrameBody::Metadata(meta) => {
            enc.put_fixed_str(&meta.id, METADATA_ID_LEN);
            enc.put_cstr(&meta.metadata);
        }
        FrameBody::Log(log) => {
            enc.put_u16(log.severity);
            enc.put_zeros(6);
            enc.put_fixed_str(&log.domain, LOG_DOMAIN_LEN);
            enc.put_cstr(&log.message);
        }
        FrameBody::FileChunk(chunk) => {
            enc.put_u16(u16::from(chunk.is_last));
            enc.put_u16(u16::try_from(chunk.data.len()).map_err(|_| too_large(kind, chunk.data.len()))?);
            enc.put_zeros(4);
            enc.put_fixed_str(&chunk.path, FILE_PATH_LEN);
            enc.buf.put_slice(&chunk.data);
        }
    }

    enc.pad_to_align();

    let len = enc.buf.len();
    if len > MAX_FRAME_LEN {
        return Err(too_large(kind, len));
    }
    let len_bytes = match order {
        ByteOrder::Little => (len as u16).to_le_bytes(),
        ByteOrder::Big => (len as u16).to_be_bytes(),
    };
    enc.buf[..2].copy_from_slice(&len_bytes);

    Ok(enc.buf)
}

fn addr_count(kind: FrameKind, len: usize) -> Result<u16, CaptureError> {
    u16::try_from(len).map_err(|_| too_large(kind, len.saturating_mul(8)))
}

fn check_counter_id(id: u32) -> Result<(), CaptureError> {
    if id == 0 || id > MAX_COUNTER_ID {
        return Err(CaptureError::InvalidCounterId(id));
    }
    Ok(())
}

fn too_large(kind: FrameKind, len: usize) -> CaptureError {
    CaptureError::FrameTooLarge { kind, len }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

macro_rules! get_int {
    ($name:ident, $ty:ty, $le:ident, $be:ident) => {
        fn $name(&mut self, what: &str) -> Result<$ty, CaptureError> {
            self.need(std::mem::size_of::<$ty>(), what)?;
            Ok(match self.order {
                ByteOrder::Little => self.buf.$le(),
                ByteOrder::Big => self.buf.$be(),
            })
        }
    };
}

struct Decoder<'a> {
    buf: &'a [u8],
    order: ByteOrder,
}

impl<'a> Decoder<'a> {
    fn new(order: ByteOrder, buf: &'a [u8]) -> Self {
        Self { buf, order }
    }

    fn need(&self, count: usize, what: &str) -> Result<(), CaptureError> {
        if self.buf.remaining() < count {
            return Err(CaptureError::corrupt(format!(
                "{what} needs {count} bytes, {} left in frame",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    get_int!(get_u16, u16, get_u16_le, get_u16);
    get_int!(get_i16, i16, get_i16_le, get_i16);
    get_int!(get_u32, u32, get_u32_le, get_u32);
    get_int!(get_i32, i32, get_i32_le, get_i32);
    get_int!(get_u64, u64, get_u64_le, get_u64);
    get_int!(get_i64, i64, get_i64_le, get_i64);

    fn get_u8(&mut self, what: &str) -> Result<u8, CaptureError> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn skip(&mut self, count: usize, what: &str) -> Result<(), CaptureError> {
        self.need(count, what)?;
        self.buf.advance(count);
        Ok(())
    }

    fn take(&mut self, count: usize, what: &str) -> Result<&'a [u8], CaptureError> {
        self.need(count, what)?;
        let (head, tail) = self.buf.split_at(count);
        self.buf = tail;
        Ok(head)
    }

    fn fixed_str(&mut self, width: usize, what: &str) -> Result<String, CaptureError> {
        let raw = self.take(width, what)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    fn cstr(&mut self, what: &str) -> Result<String, CaptureError> {
        let end = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| CaptureError::corrupt(format!("unterminated {what}")))?;
        let text = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.advance(end + 1);
        Ok(text)
    }

    fn addrs(&mut self, count: usize) -> Result<Vec<u64>, CaptureError> {
        self.need(count * 8, "stack addresses")?;
        (0..count).map(|_| self.get_u64("stack address")).collect()
    }
}

/// Decode the 24-byte header at the start of `bytes` and validate its length
pub fn decode_frame_header(order: ByteOrder, bytes: &[u8]) -> Result<FrameHeader, CaptureError> {
    let mut dec = Decoder::new(order, bytes);
    let len = dec.get_u16("frame length")?;
    let cpu = dec.get_i16("cpu")?;
    let pid = dec.get_i32("pid")?;
    let time = dec.get_i64("time")?;
    let tag = dec.get_u8("frame kind")?;

    if usize::from(len) < FRAME_HEADER_SIZE || usize::from(len) % CAPTURE_ALIGN != 0 {
        return Err(CaptureError::corrupt(format!("invalid frame length {len}")));
    }
    let kind = FrameKind::from_tag(tag)
        .ok_or_else(|| CaptureError::corrupt(format!("unknown frame kind {tag}")))?;

    Ok(FrameHeader {
        kind,
        len,
        cpu: i32::from(cpu),
        pid,
        time,
    })
}

/// Decode a whole frame. `bytes` must start at the frame header; anything past
/// the declared length is ignored.
pub fn decode_frame(order: ByteOrder, bytes: &[u8]) -> Result<CaptureFrame, CaptureError> {
    let header = decode_frame_header(order, bytes)?;
    let len = usize::from(header.len);
    if bytes.len() < len {
        return Err(CaptureError::corrupt(format!(
            "frame declares {len} bytes but only {} are available",
            bytes.len()
        )));
    }
    let mut dec = Decoder::new(order, &bytes[FRAME_HEADER_SIZE..len]);

    let body = match header.kind {
        FrameKind::Timestamp => FrameBody::Timestamp,
        FrameKind::Exit => FrameBody::Exit,
        FrameKind::Sample => {
            let n_addrs = dec.get_u16("address count")?;
            dec.skip(2, "sample padding")?;
            let tid = dec.get_i32("tid")?;
            let addrs = dec.addrs(usize::from(n_addrs))?;
            FrameBody::Sample(Sample { tid, addrs })
        }
        FrameKind::Allocation => {
            let alloc_addr = dec.get_u64("allocation address")?;
            let alloc_size = dec.get_i64("allocation size")?;
            let tid = dec.get_i32("tid")?;
            let n_addrs = dec.get_u16("address count")?;
            dec.skip(2, "allocation padding")?;
            let addrs = dec.addrs(usize::from(n_addrs))?;
            FrameBody::Allocation(Allocation {
                alloc_addr,
                alloc_size,
                tid,
                addrs,
            })
        }
        FrameKind::Map => FrameBody::Map(Map {
            start: dec.get_u64("map start")?,
            end: dec.get_u64("map end")?,
            offset: dec.get_u64("map offset")?,
            inode: dec.get_u64("map inode")?,
            filename: dec.cstr("map filename")?,
        }),
        FrameKind::Process => FrameBody::Process(Process {
            cmdline: dec.cstr("cmdline")?,
        }),
        FrameKind::Fork => FrameBody::Fork(Fork {
            child_pid: dec.get_i32("child pid")?,
        }),
        FrameKind::JitMap => {
            let count = dec.get_u32("jitmap count")?;
            dec.skip(4, "jitmap padding")?;
            // Each entry takes at least an address and a terminator
            dec.need((count as usize).saturating_mul(9), "jitmap entries")?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let addr = dec.get_u64("jitmap address")?;
                entries.push((addr, dec.cstr("jitmap name")?));
            }
            FrameBody::JitMap(JitMap { entries })
        }
        FrameKind::CounterDefine => {
            let count = usize::from(dec.get_u16("counter count")?);
            dec.skip(6, "counter padding")?;
            dec.need(count * COUNTER_DEF_SIZE, "counter definitions")?;
            let mut counters = Vec::with_capacity(count);
            for _ in 0..count {
                let category = dec.fixed_str(COUNTER_CATEGORY_LEN, "counter category")?;
                let name = dec.fixed_str(COUNTER_NAME_LEN, "counter name")?;
                let description = dec.fixed_str(COUNTER_DESCRIPTION_LEN, "counter description")?;
                let id_type = dec.get_u32("counter id")?;
                let bits = dec.get_u64("counter value")?;
                let type_tag = (id_type >> 24) as u8;
                let value = CounterValue::from_parts(type_tag, bits).ok_or_else(|| {
                    CaptureError::corrupt(format!("unknown counter type {type_tag}"))
                })?;
                counters.push(Counter {
                    id: id_type & MAX_COUNTER_ID,
                    category,
                    name,
                    description,
                    value,
                });
            }
            FrameBody::CounterDefine(CounterDefine { counters })
        }
        FrameKind::CounterSet => {
            let groups = usize::from(dec.get_u16("counter group count")?);
            dec.skip(6, "counter set padding")?;
            dec.need(groups * COUNTER_GROUP_BYTES, "counter groups")?;
            let mut values = Vec::with_capacity(groups * COUNTER_GROUP_SIZE);
            for _ in 0..groups {
                let mut ids = [0u32; COUNTER_GROUP_SIZE];
                for id in ids.iter_mut() {
                    *id = dec.get_u32("counter set id")?;
                }
                for id in ids {
                    let bits = dec.get_u64("counter set value")?;
                    if id != 0 {
                        values.push(CounterSample { id, bits });
                    }
                }
            }
            FrameBody::CounterSet(CounterSet { values })
        }
        FrameKind::Mark => FrameBody::Mark(Mark {
            duration: dec.get_i64("mark duration")?,
            group: dec.fixed_str(MARK_GROUP_LEN, "mark group")?,
            name: dec.fixed_str(MARK_NAME_LEN, "mark name")?,
            message: dec.cstr("mark message")?,
        }),
        FrameKind::Metadata => FrameBody::Metadata(Metadata {
            id: dec.fixed_str(METADATA_ID_LEN, "metadata id")?,
            metadata: dec.cstr("metadata")?,
        }),
        FrameKind::Log => {
            let severity = dec.get_u16("log severity")?;
            dec.skip(6, "log padding")?;
            FrameBody::Log(Log {
                severity,
                domain: dec.fixed_str(LOG_DOMAIN_LEN, "log domain")?,
                message: dec.cstr("log message")?,
            })
        }
        FrameKind::FileChunk => {
            let is_last = dec.get_u16("file chunk flags")? & 1 == 1;
            let data_len = usize::from(dec.get_u16("file chunk length")?);
            dec.skip(4, "file chunk padding")?;
            let path = dec.fixed_str(FILE_PATH_LEN, "file chunk path")?;
            let data = dec.take(data_len, "file chunk data")?.to_vec();
            FrameBody::FileChunk(FileChunk {
                path,
                is_last,
                data,
            })
        }
    };

    Ok(CaptureFrame { header, body })
}

/// Room left for file data in a single chunk frame
pub(crate) const MAX_FILE_CHUNK_DATA: usize = MAX_FRAME_LEN - FRAME_HEADER_SIZE - 8 - FILE_PATH_LEN;
