//! On-disk capture format

pub mod wire;

pub use wire::{
    decode_frame, decode_frame_header, encode_frame, is_jit_address, ByteOrder, FileHeader,
    CAPTURE_ALIGN, FILE_HEADER_SIZE, FRAME_HEADER_SIZE, JITMAP_MARK, MAX_COUNTER_ID,
    MAX_FRAME_LEN,
};
