//! Symbol resolution
//!
//! Resolvers turn `(time, pid, context, address)` into a display name and an
//! optional classification tag. They are consulted in priority order and the
//! first answer wins.

mod capture;
mod elf;
mod jitmap;
mod kernel;

pub use capture::{CaptureSymbolResolver, EmbeddedSymbol, EMBEDDED_SYMBOLS_PATH};
pub use elf::ElfSymbolResolver;
pub use jitmap::JitmapResolver;
pub use kernel::{KernelSymbolResolver, KALLSYMS_PATH};

use crate::context::AddressContext;
use crate::error::AnalysisError;
use tokio_util::sync::CancellationToken;
use tracefold_capture::{Address, CaptureReader, Pid, Timestamp};
use tracing::debug;

/// A resolved address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub name: String,
    /// Classification such as "Kernel", "libc" or "JIT"
    pub tag: Option<String>,
    /// Belongs to a system library that callers may choose to hide
    pub system_library: bool,
}

impl ResolvedSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: None,
            system_library: false,
        }
    }

    pub fn tagged(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: Some(tag.into()),
            system_library: false,
        }
    }
}

pub trait SymbolResolver: Send {
    fn name(&self) -> &'static str;

    /// One pass over the capture to build lookup tables. The reader is
    /// positioned at the first frame. Long passes poll `cancel`.
    fn load(
        &mut self,
        _reader: &mut CaptureReader,
        _cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn resolve(
        &mut self,
        time: Timestamp,
        pid: Pid,
        context: AddressContext,
        address: Address,
    ) -> Option<ResolvedSymbol>;
}

/// Resolvers in priority order
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn SymbolResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Embedded symbols, then the kernel table, then ELF files, then JIT maps
    pub fn standard() -> Self {
        Self::new()
            .with(CaptureSymbolResolver::new())
            .with(KernelSymbolResolver::new())
            .with(ElfSymbolResolver::new())
            .with(JitmapResolver::new())
    }

    pub fn with(mut self, resolver: impl SymbolResolver + 'static) -> Self {
        self.push(Box::new(resolver));
        self
    }

    pub fn push(&mut self, resolver: Box<dyn SymbolResolver>) {
        self.resolvers.push(resolver);
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }

    /// Load every resolver, rewinding the reader before each
    pub fn load(
        &mut self,
        reader: &mut CaptureReader,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        for resolver in &mut self.resolvers {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            reader.reset();
            debug!("Loading {} resolver", resolver.name());
            resolver.load(reader, cancel)?;
        }
        reader.reset();
        Ok(())
    }

    pub fn resolve(
        &mut self,
        time: Timestamp,
        pid: Pid,
        context: AddressContext,
        address: Address,
    ) -> Option<ResolvedSymbol> {
        self.resolvers
            .iter_mut()
            .find_map(|resolver| resolver.resolve(time, pid, context, address))
    }
}
