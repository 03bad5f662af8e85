//! Callgraph construction
//!
//! Walks every traceable frame of a capture, symbolizes its stack through a
//! [`ResolverChain`] and merges the result into a [`StackStash`] rooted at
//! `[Everything]`. Each trace is laid out root first as
//! `[Everything] -> [process] -> outermost frame -> ... -> innermost frame`.

use crate::context::AddressContext;
use crate::error::AnalysisError;
use crate::resolver::ResolverChain;
use crate::scan::{check_cancelled, for_each_frame};
use crate::selection::Selection;
use crate::stash::{CountAugment, Interner, NodeId, StackStash, SymbolId};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracefold_capture::writer::MAX_UNWIND_DEPTH;
use tracefold_capture::{
    Address, Allocation, CaptureReader, FrameBody, FrameHeader, Pid, Sample, Tid,
};
use tracing::{debug, info};

pub const ROOT_NAME: &str = "[Everything]";

/// A record carrying a stack
pub trait Traceable {
    fn stack_depth(&self) -> u32;

    /// Address `index` frames out from the innermost one
    fn stack_address(&self, index: u32) -> Address;

    fn thread_id(&self) -> Tid;

    /// Contribution of this record to a call tree
    fn weight(&self) -> u64 {
        1
    }
}

impl Traceable for Sample {
    fn stack_depth(&self) -> u32 {
        self.addrs.len() as u32
    }

    fn stack_address(&self, index: u32) -> Address {
        self.addrs[index as usize]
    }

    fn thread_id(&self) -> Tid {
        self.tid
    }
}

impl Traceable for Allocation {
    fn stack_depth(&self) -> u32 {
        self.addrs.len() as u32
    }

    fn stack_address(&self, index: u32) -> Address {
        self.addrs[index as usize]
    }

    fn thread_id(&self) -> Tid {
        self.tid
    }

    /// Bytes allocated; frees (negative sizes) weigh nothing
    fn weight(&self) -> u64 {
        self.alloc_size.max(0) as u64
    }
}

/// Which frames of the capture feed the call tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSource {
    /// CPU samples, one unit each
    Samples,
    /// Memory allocations weighted by size
    Allocations,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallgraphOptions {
    /// Deeper stacks are truncated to their innermost frames
    pub max_stack_depth: usize,
    /// Innermost frames at the top of the tree
    pub bottom_up: bool,
    /// Skip frames from system libraries
    pub hide_system_libraries: bool,
    /// Skip the idle process
    pub ignore_process_0: bool,
    /// Insert a `[Thread N]` level below each process
    pub include_threads: bool,
}

impl Default for CallgraphOptions {
    fn default() -> Self {
        Self {
            max_stack_depth: MAX_UNWIND_DEPTH,
            bottom_up: false,
            hide_system_libraries: false,
            ignore_process_0: false,
            include_threads: false,
        }
    }
}

/// A finished call tree with its symbol names and tags
#[derive(Debug, Clone)]
pub struct CallTree<A> {
    stash: StackStash<A>,
    interner: Interner,
    tags: HashMap<SymbolId, String>,
    traces: u64,
}

impl<A: Default> CallTree<A> {
    fn new() -> Self {
        let mut interner = Interner::new();
        let root = interner.intern(ROOT_NAME);
        Self {
            stash: StackStash::new(root),
            interner,
            tags: HashMap::new(),
            traces: 0,
        }
    }

    pub fn stash(&self) -> &StackStash<A> {
        &self.stash
    }

    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    pub fn root(&self) -> NodeId {
        self.stash.root()
    }

    /// Number of traces merged into the tree
    pub fn traces(&self) -> u64 {
        self.traces
    }

    pub fn name(&self, node: NodeId) -> &str {
        self.interner.name(self.stash.node(node).symbol)
    }

    /// Classification reported by the resolver for this node's symbol
    pub fn tag(&self, node: NodeId) -> Option<&str> {
        self.tags
            .get(&self.stash.node(node).symbol)
            .map(String::as_str)
    }

    pub fn data(&self, node: NodeId) -> &A {
        &self.stash.node(node).data
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.stash.node(node).children
    }

    /// Child of `node` named `name`
    pub fn child(&self, node: NodeId, name: &str) -> Option<NodeId> {
        let symbol = self.interner.get(name)?;
        self.stash.child(node, symbol)
    }

    /// Follow `names` down from the root
    pub fn find(&self, names: &[&str]) -> Option<NodeId> {
        names
            .iter()
            .try_fold(self.root(), |node, name| self.child(node, name))
    }
}

impl CallTree<CountAugment> {
    /// Folded stacks (`a;b;c weight`), one line per node with self weight,
    /// sorted. The `[Everything]` root is omitted. Separators inside frame
    /// names are replaced so every line stays parseable.
    pub fn to_folded(&self) -> String {
        let mut lines = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(node) = stack.pop() {
            stack.extend(self.children(node).iter().copied());
            let weight = self.data(node).self_weight;
            if weight == 0 || node == self.root() {
                continue;
            }
            let path: Vec<String> = self
                .stash
                .path(node)
                .into_iter()
                .map(|symbol| folded_name(self.interner.name(symbol)))
                .collect();
            lines.push(format!("{} {}", path.join(";"), weight));
        }
        lines.sort();
        let mut out = lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

/// `;` separates frames and newlines separate stacks
fn folded_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ';' => ':',
            '\n' | '\r' => ' ',
            c => c,
        })
        .collect()
}

/// The standard augmentation: self and total weight per node
pub fn count_augment(data: &mut CountAugment, traceable: &dyn Traceable, is_leaf: bool) {
    data.add(traceable.weight(), is_leaf);
}

/// Builds call trees from captures
pub struct CallgraphBuilder {
    source: TraceSource,
    resolvers: ResolverChain,
    options: CallgraphOptions,
    selection: Selection,
}

impl CallgraphBuilder {
    /// A builder using the standard resolver chain
    pub fn new(source: TraceSource) -> Self {
        Self {
            source,
            resolvers: ResolverChain::standard(),
            options: CallgraphOptions::default(),
            selection: Selection::new(),
        }
    }

    pub fn with_resolvers(mut self, resolvers: ResolverChain) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn with_options(mut self, options: CallgraphOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    /// Build on a blocking worker thread.
    ///
    /// Completes with the tree, with `AnalysisError::Cancelled` once `cancel`
    /// is observed, or with the capture error that stopped the scan.
    pub async fn build<A, F>(
        self,
        mut reader: CaptureReader,
        augment: F,
        cancel: CancellationToken,
    ) -> Result<CallTree<A>, AnalysisError>
    where
        A: Default + Send + 'static,
        F: FnMut(&mut A, &dyn Traceable, bool) + Send + 'static,
    {
        let mut builder = self;
        tokio::task::spawn_blocking(move || builder.build_blocking(&mut reader, augment, &cancel))
            .await
            .map_err(|e| AnalysisError::Worker(e.to_string()))?
    }

    /// Build on the current thread
    pub fn build_blocking<A, F>(
        &mut self,
        reader: &mut CaptureReader,
        mut augment: F,
        cancel: &CancellationToken,
    ) -> Result<CallTree<A>, AnalysisError>
    where
        A: Default,
        F: FnMut(&mut A, &dyn Traceable, bool),
    {
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        let processes = process_names(reader, cancel)?;
        self.resolvers.load(reader, cancel)?;

        let mut tree = CallTree::new();
        let mut scratch = Vec::with_capacity(self.options.max_stack_depth + 4);
        let mut seen: u64 = 0;

        while let Some(frame) = reader.read_frame()? {
            let traceable: &dyn Traceable = match (&frame.body, self.source) {
                (FrameBody::Sample(sample), TraceSource::Samples) => sample,
                (FrameBody::Allocation(allocation), TraceSource::Allocations) => allocation,
                _ => continue,
            };

            if let Err(e) = check_cancelled(cancel, seen) {
                debug!("Callgraph cancelled after {} traces", seen);
                return Err(e);
            }
            seen += 1;

            if !self.symbolize(&frame.header, traceable, &processes, &mut tree, &mut scratch) {
                continue;
            }

            let root = tree.root();
            tree.stash
                .merge_trace(root, &scratch, |data, is_leaf| augment(data, traceable, is_leaf));
            tree.traces += 1;
        }

        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        info!(
            "Built callgraph from {} of {} traces ({} nodes)",
            tree.traces,
            seen,
            tree.stash.len()
        );
        Ok(tree)
    }

    /// Fill `out` with the trace's symbols, root first and without the
    /// `[Everything]` root. Returns false when the trace is skipped.
    fn symbolize<A: Default>(
        &mut self,
        header: &FrameHeader,
        traceable: &dyn Traceable,
        processes: &HashMap<Pid, String>,
        tree: &mut CallTree<A>,
        out: &mut Vec<SymbolId>,
    ) -> bool {
        out.clear();

        if self.options.ignore_process_0 && header.pid == 0 {
            return false;
        }
        if !self.selection.contains(header.time) {
            return false;
        }
        let depth = (traceable.stack_depth() as usize).min(self.options.max_stack_depth);
        if depth == 0 {
            return false;
        }

        // Innermost first while walking
        let mut context: Option<AddressContext> = None;
        for index in 0..depth {
            let address = traceable.stack_address(index as u32);
            if let Some(next) = AddressContext::from_marker(address) {
                if let Some(previous) = context {
                    out.push(tree.interner.intern(previous.name()));
                }
                context = Some(next);
                continue;
            }

            let current = context.unwrap_or(AddressContext::User);
            let symbol = match self.resolvers.resolve(header.time, header.pid, current, address) {
                Some(resolved) => {
                    if self.options.hide_system_libraries && resolved.system_library {
                        continue;
                    }
                    let symbol = tree.interner.intern(&resolved.name);
                    if let Some(tag) = resolved.tag {
                        tree.tags.entry(symbol).or_insert(tag);
                    }
                    symbol
                }
                None => tree.interner.intern(&format!("{:#x}", address)),
            };
            out.push(symbol);
        }

        if let Some(last) = context.filter(|c| *c != AddressContext::User) {
            out.push(tree.interner.intern(last.name()));
        }

        if self.options.bottom_up {
            out.reverse();
        }

        if self.options.include_threads {
            let thread = format!("[Thread {}]", traceable.thread_id());
            out.push(tree.interner.intern(&thread));
        }

        let process = match processes.get(&header.pid) {
            Some(name) => tree.interner.intern(name),
            None => tree.interner.intern(&format!("[Process {}]", header.pid)),
        };
        out.push(process);
        out.reverse();
        true
    }
}

/// pid -> "[cmdline]" from the capture's process frames
fn process_names(
    reader: &mut CaptureReader,
    cancel: &CancellationToken,
) -> Result<HashMap<Pid, String>, AnalysisError> {
    reader.reset();
    let mut names = HashMap::new();
    for_each_frame(reader, cancel, |frame| {
        if let FrameBody::Process(process) = frame.body {
            if !process.cmdline.is_empty() {
                names.insert(frame.header.pid, format!("[{}]", process.cmdline));
            }
        }
    })?;
    reader.reset();
    Ok(names)
}
