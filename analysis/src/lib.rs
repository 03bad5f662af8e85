//! Capture analysis for Tracefold
//!
//! Symbolizes stack traces recorded in a capture and aggregates them into
//! call trees.

pub mod callgraph;
pub mod context;
pub mod error;
pub mod resolver;
pub mod scan;
pub mod selection;
pub mod stash;

pub use callgraph::{
    count_augment, CallTree, CallgraphBuilder, CallgraphOptions, TraceSource, Traceable,
};
pub use context::AddressContext;
pub use error::AnalysisError;
pub use resolver::{ResolvedSymbol, ResolverChain, SymbolResolver};
pub use selection::Selection;
pub use stash::{CountAugment, Interner, NodeId, StackNode, StackStash, SymbolId};
