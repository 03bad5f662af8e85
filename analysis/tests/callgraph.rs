//! Integration test: building call trees from captures
//!
//! Covers prefix collapse with resolved symbols, context markers, allocation
//! weights, selections, cancellation and folded output.

use anyhow::Result;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracefold_analysis::resolver::{CaptureSymbolResolver, EmbeddedSymbol, EMBEDDED_SYMBOLS_PATH};
use tracefold_analysis::{
    count_augment, AddressContext, AnalysisError, CallTree, CallgraphBuilder, CallgraphOptions,
    CountAugment, ResolvedSymbol, ResolverChain, Selection, SymbolResolver, TraceSource,
};
use tracefold_capture::protocol::FILE_HEADER_SIZE;
use tracefold_capture::{
    Address, Allocation, CaptureError, CaptureReader, CaptureWriter, Origin, Pid, WriterOptions,
};

const PID: Pid = 42;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn user_symbol(begin: Address, name: &str) -> EmbeddedSymbol {
    EmbeddedSymbol {
        pid: PID,
        begin,
        end: begin + 0x100,
        name: name.to_string(),
        tag: None,
    }
}

/// A, B, C, D at 0x1000, 0x2000, 0x3000, 0x4000 for PID
fn new_capture() -> CaptureWriter {
    let writer = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
    let symbols = vec![
        user_symbol(0x1000, "A"),
        user_symbol(0x2000, "B"),
        user_symbol(0x3000, "C"),
        user_symbol(0x4000, "D"),
    ];
    writer
        .add_file(
            Origin::at(0),
            EMBEDDED_SYMBOLS_PATH,
            true,
            &CaptureSymbolResolver::encode(&symbols).unwrap(),
        )
        .unwrap();
    writer
        .add_process(Origin::new(1, -1, PID), "app")
        .unwrap();
    writer
}

fn sample(writer: &CaptureWriter, time: i64, addrs: &[Address]) {
    writer
        .add_sample(Origin::new(time, 0, PID), PID, addrs)
        .unwrap();
}

fn build(reader: &mut CaptureReader, source: TraceSource) -> CallTree<CountAugment> {
    CallgraphBuilder::new(source)
        .build_blocking(reader, count_augment, &CancellationToken::new())
        .unwrap()
}

#[test]
fn test_shared_prefixes_collapse() {
    let writer = new_capture();
    sample(&writer, 10, &[0x3010, 0x2010, 0x1010]);
    sample(&writer, 11, &[0x4010, 0x2020, 0x1020]);
    let mut reader = writer.create_reader().unwrap();

    let tree = build(&mut reader, TraceSource::Samples);

    let process = tree.find(&["[app]"]).unwrap();
    assert_eq!(tree.children(tree.root()), &[process]);
    let a = tree.find(&["[app]", "A"]).unwrap();
    let b = tree.find(&["[app]", "A", "B"]).unwrap();
    let c = tree.find(&["[app]", "A", "B", "C"]).unwrap();
    let d = tree.find(&["[app]", "A", "B", "D"]).unwrap();
    assert_eq!(tree.children(process).len(), 1);
    assert_eq!(tree.children(a).len(), 1);
    assert_eq!(tree.children(b).len(), 2);

    assert_eq!(tree.data(tree.root()).total_weight, 2);
    assert_eq!(tree.data(a).total_weight, 2);
    assert_eq!(tree.data(b).total_weight, 2);
    assert_eq!(tree.data(c).total_weight, 1);
    assert_eq!(tree.data(d).total_weight, 1);
    assert_eq!(tree.data(c).self_weight, 1);
    assert_eq!(tree.data(b).self_weight, 0);
    assert_eq!(tree.traces(), 2);
}

#[test]
fn test_context_markers() {
    let kernel = AddressContext::Kernel.marker().unwrap();
    let user = AddressContext::User.marker().unwrap();

    let writer = new_capture();
    writer
        .add_file(
            Origin::at(0),
            "/proc/kallsyms",
            true,
            b"ffffffff81000000 T schedule\nffffffff81010000 T do_syscall_64\n",
        )
        .unwrap();
    sample(
        &writer,
        10,
        &[kernel, 0xffff_ffff_8100_0010, 0xffff_ffff_8101_0010, user, 0x1010],
    );
    sample(&writer, 11, &[kernel, 0xffff_ffff_8100_0020]);
    let mut reader = writer.create_reader().unwrap();

    let tree = build(&mut reader, TraceSource::Samples);

    let leaf = tree
        .find(&["[app]", "A", "- - Kernel - -", "do_syscall_64", "schedule"])
        .unwrap();
    assert_eq!(tree.tag(leaf), Some("Kernel"));
    assert_eq!(tree.data(leaf).self_weight, 1);

    let kernel_only = tree
        .find(&["[app]", "- - Kernel - -", "schedule"])
        .unwrap();
    assert_eq!(tree.data(kernel_only).self_weight, 1);
}

#[test]
fn test_allocations_weigh_by_size() {
    let writer = new_capture();
    for (time, size) in [(10, 100), (11, 28), (12, -64)] {
        writer
            .add_allocation(
                Origin::new(time, 0, PID),
                &Allocation {
                    alloc_addr: 0x7f00_0000,
                    alloc_size: size,
                    tid: PID,
                    addrs: vec![0x2010, 0x1010],
                },
            )
            .unwrap();
    }
    sample(&writer, 13, &[0x3010, 0x1010]);
    let mut reader = writer.create_reader().unwrap();

    let memory = build(&mut reader, TraceSource::Allocations);
    let b = memory.find(&["[app]", "A", "B"]).unwrap();
    assert_eq!(memory.data(b).self_weight, 128);
    assert!(memory.find(&["[app]", "A", "C"]).is_none());

    let cpu = build(&mut reader, TraceSource::Samples);
    assert_eq!(cpu.traces(), 1);
    assert!(cpu.find(&["[app]", "A", "C"]).is_some());
}

#[test]
fn test_selection_filters_samples() {
    let writer = new_capture();
    sample(&writer, 10, &[0x3010, 0x1010]);
    sample(&writer, 20, &[0x4010, 0x1010]);
    let mut reader = writer.create_reader().unwrap();

    let mut selection = Selection::new();
    selection.select_range(15, 25);
    let tree: CallTree<CountAugment> = CallgraphBuilder::new(TraceSource::Samples)
        .with_selection(selection)
        .build_blocking(&mut reader, count_augment, &CancellationToken::new())
        .unwrap();

    assert_eq!(tree.traces(), 1);
    assert!(tree.find(&["[app]", "A", "C"]).is_none());
    assert!(tree.find(&["[app]", "A", "D"]).is_some());
}

#[test]
fn test_jit_frames_and_unknown_processes() {
    let writer = CaptureWriter::anonymous(WriterOptions::default()).unwrap();
    let jit = writer.add_jitmap("JS::interpret").unwrap();
    writer
        .add_sample(Origin::new(5, 0, 77), 77, &[jit, 0xdead])
        .unwrap();
    let mut reader = writer.create_reader().unwrap();

    let tree = build(&mut reader, TraceSource::Samples);
    let leaf = tree
        .find(&["[Process 77]", "0xdead", "JS::interpret"])
        .unwrap();
    assert_eq!(tree.tag(leaf), Some("JIT"));
}

/// Marks everything under 0x9000 as a system library frame
struct SystemSplit;

impl SymbolResolver for SystemSplit {
    fn name(&self) -> &'static str {
        "system-split"
    }

    fn resolve(
        &mut self,
        _time: i64,
        _pid: Pid,
        _context: AddressContext,
        address: Address,
    ) -> Option<ResolvedSymbol> {
        let mut symbol = ResolvedSymbol::new(format!("fn_{:x}", address));
        symbol.system_library = address < 0x9000;
        Some(symbol)
    }
}

#[test]
fn test_hide_system_libraries() {
    let writer = new_capture();
    sample(&writer, 10, &[0x9100, 0x1000, 0x9200]);
    let mut reader = writer.create_reader().unwrap();

    let tree: CallTree<CountAugment> = CallgraphBuilder::new(TraceSource::Samples)
        .with_resolvers(ResolverChain::new().with(SystemSplit))
        .with_options(CallgraphOptions {
            hide_system_libraries: true,
            ..CallgraphOptions::default()
        })
        .build_blocking(&mut reader, count_augment, &CancellationToken::new())
        .unwrap();

    assert!(tree.find(&["[app]", "fn_9200", "fn_9100"]).is_some());
    assert!(tree.interner().get("fn_1000").is_none());
}

#[test]
fn test_folded_output_from_saved_capture() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("folded.capture");

    let writer = new_capture();
    sample(&writer, 10, &[0x3010, 0x2010, 0x1010]);
    sample(&writer, 11, &[0x3020, 0x2020, 0x1020]);
    sample(&writer, 12, &[0x2030, 0x1030]);
    writer.save_as(&path)?;
    drop(writer);

    let mut reader = CaptureReader::open(&path)?;
    let tree: CallTree<CountAugment> = CallgraphBuilder::new(TraceSource::Samples)
        .build_blocking(&mut reader, count_augment, &CancellationToken::new())?;
    assert_eq!(tree.to_folded(), "[app];A;B 1\n[app];A;B;C 2\n");
    Ok(())
}

#[tokio::test]
async fn test_cancellation_then_fresh_build() {
    init_tracing();
    let writer = new_capture();
    for i in 0..1_000 {
        sample(&writer, 100 + i, &[0x3010, 0x2010, 0x1010]);
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let result: Result<CallTree<CountAugment>, _> = CallgraphBuilder::new(TraceSource::Samples)
        .build(
            writer.create_reader().unwrap(),
            move |data: &mut CountAugment, traceable, is_leaf| {
                // Cancel as soon as the first batch starts merging
                trigger.cancel();
                count_augment(data, traceable, is_leaf);
            },
            cancel,
        )
        .await;
    assert!(matches!(result, Err(AnalysisError::Cancelled)));

    let tree: CallTree<CountAugment> = CallgraphBuilder::new(TraceSource::Samples)
        .build(writer.create_reader().unwrap(), count_augment, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tree.traces(), 1_000);
    let c = tree.find(&["[app]", "A", "B", "C"]).unwrap();
    assert_eq!(tree.data(c).self_weight, 1_000);
}

/// Give the `index`th frame of a saved capture a length that is not a
/// multiple of the frame alignment
fn corrupt_frame_len(path: &Path, index: usize) -> Result<()> {
    let mut bytes = std::fs::read(path)?;
    let mut offset = FILE_HEADER_SIZE;
    for _ in 0..index {
        let len = u16::from_ne_bytes([bytes[offset], bytes[offset + 1]]);
        offset += usize::from(len);
    }
    bytes[offset..offset + 2].copy_from_slice(&13u16.to_ne_bytes());
    std::fs::write(path, bytes)?;
    Ok(())
}

#[test]
fn test_corrupt_frame_fails_the_build() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("corrupt.capture");

    let writer = new_capture();
    // Times after the capture start keep the header range valid, so opening
    // does not need to scan the frames
    let base = writer.start_time();
    for i in 1..=10 {
        sample(&writer, base + i, &[0x3010, 0x2010, 0x1010]);
    }
    writer.save_as(&path)?;
    drop(writer);
    // Frames: symbols file, process, then samples
    corrupt_frame_len(&path, 6)?;

    let mut reader = CaptureReader::open(&path)?;
    let result: Result<CallTree<CountAugment>, _> = CallgraphBuilder::new(TraceSource::Samples)
        .build_blocking(&mut reader, count_augment, &CancellationToken::new());
    assert!(
        matches!(result, Err(AnalysisError::Capture(CaptureError::CorruptFrame(_)))),
        "{:?}",
        result.err()
    );
    Ok(())
}

/// Blocks in `load` until the build is cancelled
struct BlockingLoad {
    started: mpsc::Sender<()>,
}

impl SymbolResolver for BlockingLoad {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn load(
        &mut self,
        _reader: &mut CaptureReader,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        let _ = self.started.send(());
        while !cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn resolve(
        &mut self,
        _time: i64,
        _pid: Pid,
        _context: AddressContext,
        _address: Address,
    ) -> Option<ResolvedSymbol> {
        None
    }
}

#[tokio::test]
async fn test_cancel_while_resolvers_load() {
    let writer = new_capture();
    sample(&writer, 10, &[0x3010, 0x2010, 0x1010]);
    let reader = writer.create_reader().unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let cancel = CancellationToken::new();
    let resolvers = ResolverChain::new()
        .with(BlockingLoad { started: started_tx })
        .with(SystemSplit);
    let build = tokio::spawn(
        CallgraphBuilder::new(TraceSource::Samples)
            .with_resolvers(resolvers)
            .build(reader, count_augment, cancel.clone()),
    );

    tokio::task::spawn_blocking(move || started_rx.recv())
        .await
        .unwrap()
        .unwrap();
    cancel.cancel();

    let result: Result<CallTree<CountAugment>, _> = build.await.unwrap();
    assert!(matches!(result, Err(AnalysisError::Cancelled)));
}
