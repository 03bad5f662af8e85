//! Integration test: merging captures
//!
//! Counter ids and JIT addresses from independent captures collide; after a
//! merge every id must be unique and every reference must resolve to the
//! definition it originally pointed at.

use std::collections::HashMap;
use tracefold_capture::cat::{merge, merge_in_background};
use tracefold_capture::protocol::{is_jit_address, FILE_HEADER_SIZE};
use tracefold_capture::{
    CaptureError, CaptureReader, CaptureWriter, Counter, CounterSample, CounterValue, FrameBody,
    Mark, Origin, WriterOptions,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn counter(id: u32, name: &str) -> Counter {
    Counter {
        id,
        category: "test".into(),
        name: name.into(),
        description: String::new(),
        value: CounterValue::Int64(0),
    }
}

/// A capture defining two counters (ids 1 and 2) and one JIT symbol
fn source_capture(prefix: &str, base_time: i64) -> CaptureReader {
    let writer = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
    let id = writer.request_counter_ids(2).unwrap();
    assert_eq!(id, 1);
    writer
        .add_counter_define(
            Origin::at(base_time),
            &[counter(id, &format!("{prefix}-a")), counter(id + 1, &format!("{prefix}-b"))],
        )
        .unwrap();
    writer
        .add_counter_set(
            Origin::at(base_time + 1),
            &[CounterSample::int64(id, 10), CounterSample::int64(id + 1, 20)],
        )
        .unwrap();
    let jit = writer.add_jitmap(&format!("{prefix}::jitted")).unwrap();
    writer
        .add_sample(Origin::new(base_time + 2, 0, 7), 7, &[jit, 0x40_1000])
        .unwrap();
    writer.create_reader().unwrap()
}

#[test]
fn test_merged_counter_ids_are_unique() {
    init_tracing();
    let dest = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
    let mut first = source_capture("first", 1_000);
    let mut second = source_capture("second", 2_000);
    merge(&dest, &mut first).unwrap();
    merge(&dest, &mut second).unwrap();

    let mut reader = dest.create_reader().unwrap();
    let mut names: HashMap<u32, String> = HashMap::new();
    let mut jit_names: HashMap<u64, String> = HashMap::new();
    let mut set_values: Vec<(String, i64)> = Vec::new();
    let mut sample_symbols: Vec<String> = Vec::new();

    while let Some(frame) = reader.read_frame().unwrap() {
        match frame.body {
            FrameBody::CounterDefine(define) => {
                for c in define.counters {
                    assert!(names.insert(c.id, c.name).is_none(), "duplicate counter id");
                }
            }
            FrameBody::CounterSet(set) => {
                for v in set.values {
                    set_values.push((names[&v.id].clone(), v.as_int64()));
                }
            }
            FrameBody::JitMap(map) => {
                for (addr, name) in map.entries {
                    assert!(jit_names.insert(addr, name).is_none(), "duplicate jit address");
                }
            }
            FrameBody::Sample(sample) => {
                assert!(is_jit_address(sample.addrs[0]));
                assert_eq!(sample.addrs[1], 0x40_1000);
                sample_symbols.push(jit_names[&sample.addrs[0]].clone());
            }
            _ => {}
        }
    }

    assert_eq!(names.len(), 4);
    assert_eq!(
        set_values,
        vec![
            ("first-a".to_string(), 10),
            ("first-b".to_string(), 20),
            ("second-a".to_string(), 10),
            ("second-b".to_string(), 20),
        ]
    );
    assert_eq!(sample_symbols, vec!["first::jitted", "second::jitted"]);
}

#[test]
fn test_merged_time_range_includes_mark_end() {
    let src = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
    src.add_sample(Origin::at(1_000), 1, &[1]).unwrap();
    src.add_mark(
        Origin::at(1_500),
        &Mark {
            duration: 2_000,
            group: "app".into(),
            name: "load".into(),
            message: String::new(),
        },
    )
    .unwrap();
    src.add_sample(Origin::at(3_000), 1, &[1]).unwrap();
    let mut reader = src.create_reader().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("merged.capture");
    let dest = CaptureWriter::create(&path, WriterOptions::default()).unwrap();
    merge(&dest, &mut reader).unwrap();
    drop(dest);

    let merged = CaptureReader::open(&path).unwrap();
    assert_eq!(merged.start_time(), 1_000);
    assert_eq!(merged.end_time(), 3_500);
}

#[test]
fn test_counter_set_without_definition_fails() {
    let src = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
    src.add_counter_set(Origin::at(5), &[CounterSample::int64(3, 1)])
        .unwrap();
    let mut reader = src.create_reader().unwrap();

    let dest = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
    assert!(matches!(
        merge(&dest, &mut reader),
        Err(CaptureError::UntranslatedId {
            what: "counter id",
            id: 3
        })
    ));
}

#[tokio::test]
async fn test_background_merge() {
    init_tracing();
    let dest = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
    let reader = source_capture("bg", 10);
    let reader = merge_in_background(dest.clone(), reader).await.unwrap();
    assert!(reader.end_time() >= 12);

    let stat = dest.stat();
    assert_eq!(stat.count(tracefold_capture::FrameKind::Sample), 1);
    assert_eq!(stat.count(tracefold_capture::FrameKind::CounterDefine), 1);
}

#[test]
fn test_corrupt_source_frame_fails_the_merge() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source.capture");
    {
        let src = CaptureWriter::create(&path, WriterOptions::default()).unwrap();
        let base = src.start_time();
        for i in 1..=8 {
            src.add_sample(Origin::new(base + i, 0, 3), 3, &[0x40_1000, 0x40_2000])
                .unwrap();
        }
    }

    // Zero the length of the fifth frame
    let mut bytes = std::fs::read(&path).unwrap();
    let mut offset = FILE_HEADER_SIZE;
    for _ in 0..4 {
        offset += usize::from(u16::from_ne_bytes([bytes[offset], bytes[offset + 1]]));
    }
    bytes[offset..offset + 2].copy_from_slice(&0u16.to_ne_bytes());
    std::fs::write(&path, bytes).unwrap();

    let mut reader = CaptureReader::open(&path).unwrap();
    let dest = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
    let result = merge(&dest, &mut reader);
    assert!(
        matches!(result, Err(CaptureError::CorruptFrame(_))),
        "{:?}",
        result
    );
}
