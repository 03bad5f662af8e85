//! Capture reader
//!
//! A [`CaptureReader`] walks the frames of a capture sequentially. It reads
//! with positioned I/O through its own window buffer, so several readers can
//! share one file (including one a writer is still appending to) without
//! disturbing each other. A partially written frame at the tail reads as end
//! of stream; a malformed frame fails with [`CaptureError::CorruptFrame`].

use crate::error::CaptureError;
use crate::protocol::wire::{
    decode_frame, decode_frame_header, ByteOrder, FileHeader, FILE_HEADER_SIZE, FRAME_HEADER_SIZE,
};
use crate::types::events::Timestamp;
use crate::types::frames::{
    Allocation, CaptureFrame, CounterDefine, CounterSet, FileChunk, Fork, FrameBody, FrameHeader,
    FrameKind, JitMap, Log, Map, Mark, Metadata, Process, Sample,
};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::debug;

const READ_WINDOW: usize = 128 * 1024;

macro_rules! typed_read {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $name(&mut self) -> Result<(FrameHeader, $ty), CaptureError> {
            let frame = self.read_expected(FrameKind::$variant)?;
            match frame.body {
                FrameBody::$variant(body) => Ok((frame.header, body)),
                _ => Err(CaptureError::KindMismatch {
                    expected: FrameKind::$variant,
                    found: Some(frame.header.kind),
                }),
            }
        }
    };
}

pub struct CaptureReader {
    file: File,
    path: Option<PathBuf>,
    header: FileHeader,
    /// File offset of the next frame
    pos: u64,
    window: Vec<u8>,
    window_start: u64,
    end_time: Timestamp,
}

impl std::fmt::Debug for CaptureReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureReader")
            .field("path", &self.path)
            .field("pos", &self.pos)
            .field("header", &self.header)
            .finish()
    }
}

impl CaptureReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let mut reader = Self::from_file(File::open(path)?)?;
        reader.path = Some(path.to_path_buf());
        Ok(reader)
    }

    pub fn from_file(file: File) -> Result<Self, CaptureError> {
        let mut raw = vec![0u8; FILE_HEADER_SIZE];
        file.read_exact_at(&mut raw, 0).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                CaptureError::corrupt("capture shorter than its header")
            }
            _ => CaptureError::Io(e),
        })?;
        let header = FileHeader::decode(&raw)?;

        let mut reader = Self {
            file,
            path: None,
            end_time: header.end_time,
            header,
            pos: FILE_HEADER_SIZE as u64,
            window: Vec::new(),
            window_start: 0,
        };

        if reader.header.end_time < reader.header.start_time {
            reader.discover_end_time()?;
        }

        Ok(reader)
    }

    /// The header was never patched (crash, or a writer still running):
    /// find the end by looking at every frame.
    fn discover_end_time(&mut self) -> Result<(), CaptureError> {
        self.end_time = Timestamp::MIN;
        let mut frames = 0usize;
        while self.read_frame()?.is_some() {
            frames += 1;
        }
        if frames == 0 {
            self.end_time = self.header.start_time;
        }
        debug!(frames, end_time = self.end_time, "discovered capture end time");
        self.reset();
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order
    }

    /// Whether the capture was written with the other byte order than this host
    pub fn needs_swap(&self) -> bool {
        self.header.byte_order != ByteOrder::native()
    }

    pub fn capture_time(&self) -> &str {
        &self.header.capture_time
    }

    pub fn start_time(&self) -> Timestamp {
        self.header.start_time
    }

    /// Largest end time seen so far: the header value, raised by every frame
    /// read. A reader that stops early may under-report.
    pub fn end_time(&self) -> Timestamp {
        self.end_time
    }

    /// Rewind to the first frame
    pub fn reset(&mut self) {
        self.pos = FILE_HEADER_SIZE as u64;
    }

    /// Bytes `[offset, offset + len)`, or `None` if the file is shorter
    fn fetch(&mut self, offset: u64, len: usize) -> Result<Option<&[u8]>, CaptureError> {
        let window_end = self.window_start + self.window.len() as u64;
        if offset < self.window_start || offset + len as u64 > window_end {
            let want = len.max(READ_WINDOW);
            self.window.resize(want, 0);
            let mut filled = 0;
            while filled < want {
                let n = self
                    .file
                    .read_at(&mut self.window[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            self.window.truncate(filled);
            self.window_start = offset;
            if filled < len {
                return Ok(None);
            }
        }
        let start = (offset - self.window_start) as usize;
        Ok(Some(&self.window[start..start + len]))
    }

    pub fn peek_header(&mut self) -> Result<Option<FrameHeader>, CaptureError> {
        let order = self.header.byte_order;
        let pos = self.pos;
        let header = match self.fetch(pos, FRAME_HEADER_SIZE)? {
            Some(bytes) => decode_frame_header(order, bytes)?,
            None => return Ok(None),
        };
        // The tail may still be in flight
        if self.fetch(pos, usize::from(header.len))?.is_none() {
            return Ok(None);
        }
        Ok(Some(header))
    }

    /// Kind of the next frame without consuming it
    pub fn peek_kind(&mut self) -> Result<Option<FrameKind>, CaptureError> {
        Ok(self.peek_header()?.map(|h| h.kind))
    }

    /// Step over the next frame. Returns `false` at the end of the capture.
    pub fn skip(&mut self) -> Result<bool, CaptureError> {
        match self.peek_header()? {
            Some(header) => {
                self.note_time(header.time);
                self.pos += u64::from(header.len);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Decode and consume the next frame
    pub fn read_frame(&mut self) -> Result<Option<CaptureFrame>, CaptureError> {
        let order = self.header.byte_order;
        let Some(header) = self.peek_header()? else {
            return Ok(None);
        };
        let pos = self.pos;
        let frame = match self.fetch(pos, usize::from(header.len))? {
            Some(bytes) => decode_frame(order, bytes)?,
            None => return Ok(None),
        };
        self.pos += u64::from(header.len);
        self.note_time(frame.end_time());
        Ok(Some(frame))
    }

    fn note_time(&mut self, time: Timestamp) {
        if time > self.end_time {
            self.end_time = time;
        }
    }

    fn read_expected(&mut self, expected: FrameKind) -> Result<CaptureFrame, CaptureError> {
        let found = self.peek_kind()?;
        if found != Some(expected) {
            return Err(CaptureError::KindMismatch { expected, found });
        }
        self.read_frame()?.ok_or(CaptureError::KindMismatch {
            expected,
            found: None,
        })
    }

    pub fn read_timestamp(&mut self) -> Result<FrameHeader, CaptureError> {
        Ok(self.read_expected(FrameKind::Timestamp)?.header)
    }

    pub fn read_exit(&mut self) -> Result<FrameHeader, CaptureError> {
        Ok(self.read_expected(FrameKind::Exit)?.header)
    }

    typed_read!(read_sample, Sample, Sample);
    typed_read!(read_allocation, Allocation, Allocation);
    typed_read!(read_map, Map, Map);
    typed_read!(read_process, Process, Process);
    typed_read!(read_fork, Fork, Fork);
    typed_read!(read_jitmap, JitMap, JitMap);
    typed_read!(read_counter_define, CounterDefine, CounterDefine);
    typed_read!(read_counter_set, CounterSet, CounterSet);
    typed_read!(read_mark, Mark, Mark);
    typed_read!(read_metadata, Metadata, Metadata);
    typed_read!(read_log, Log, Log);
    typed_read!(read_file_chunk, FileChunk, FileChunk);

    /// Reassemble an embedded file from its chunks, scanning from the start.
    /// The cursor is left at the start of the capture.
    pub fn read_file(&mut self, path: &str) -> Result<Option<Vec<u8>>, CaptureError> {
        self.reset();
        let mut data: Option<Vec<u8>> = None;
        while let Some(kind) = self.peek_kind()? {
            if kind != FrameKind::FileChunk {
                self.skip()?;
                continue;
            }
            let (_, chunk) = self.read_file_chunk()?;
            if chunk.path != path {
                continue;
            }
            data.get_or_insert_with(Vec::new).extend_from_slice(&chunk.data);
            if chunk.is_last {
                break;
            }
        }
        self.reset();
        Ok(data)
    }

    /// Paths of every embedded file, in order of first appearance
    pub fn list_files(&mut self) -> Result<Vec<String>, CaptureError> {
        self.reset();
        let mut paths: Vec<String> = Vec::new();
        while let Some(kind) = self.peek_kind()? {
            if kind != FrameKind::FileChunk {
                self.skip()?;
                continue;
            }
            let (_, chunk) = self.read_file_chunk()?;
            if !paths.contains(&chunk.path) {
                paths.push(chunk.path);
            }
        }
        self.reset();
        Ok(paths)
    }
}
