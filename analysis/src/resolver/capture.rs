//! Symbols shipped inside the capture itself

use super::{ResolvedSymbol, SymbolResolver};
use crate::context::AddressContext;
use crate::error::AnalysisError;
use crate::scan::read_embedded_file;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracefold_capture::{Address, CaptureReader, Pid, Timestamp};
use tracing::debug;

/// Embedded file holding pre-resolved symbols as JSON
pub const EMBEDDED_SYMBOLS_PATH: &str = "__symbols__";

/// One pre-resolved address range. A pid of -1 applies to every process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedSymbol {
    pub pid: Pid,
    pub begin: Address,
    pub end: Address,
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Default)]
pub struct CaptureSymbolResolver {
    by_pid: HashMap<Pid, Vec<EmbeddedSymbol>>,
}

impl CaptureSymbolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_symbols(symbols: Vec<EmbeddedSymbol>) -> Self {
        let mut resolver = Self::new();
        resolver.index(symbols);
        resolver
    }

    /// Serialize `symbols` for embedding with `CaptureWriter::add_file`
    pub fn encode(symbols: &[EmbeddedSymbol]) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(symbols)
    }

    fn index(&mut self, symbols: Vec<EmbeddedSymbol>) {
        for symbol in symbols.into_iter().filter(|s| s.begin < s.end) {
            self.by_pid.entry(symbol.pid).or_default().push(symbol);
        }
        for list in self.by_pid.values_mut() {
            list.sort_by_key(|s| s.begin);
        }
    }

    fn lookup(&self, pid: Pid, address: Address) -> Option<&EmbeddedSymbol> {
        let list = self.by_pid.get(&pid)?;
        let idx = list.partition_point(|s| s.begin <= address);
        list[..idx].last().filter(|s| address < s.end)
    }
}

impl SymbolResolver for CaptureSymbolResolver {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn load(
        &mut self,
        reader: &mut CaptureReader,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        self.by_pid.clear();
        let Some(data) = read_embedded_file(reader, EMBEDDED_SYMBOLS_PATH, cancel)? else {
            return Ok(());
        };
        let symbols: Vec<EmbeddedSymbol> =
            serde_json::from_slice(&data).map_err(|e| AnalysisError::Resolver {
                resolver: "capture",
                reason: format!("invalid {}: {}", EMBEDDED_SYMBOLS_PATH, e),
            })?;
        debug!("Loaded {} embedded symbols", symbols.len());
        self.index(symbols);
        Ok(())
    }

    fn resolve(
        &mut self,
        _time: Timestamp,
        pid: Pid,
        _context: AddressContext,
        address: Address,
    ) -> Option<ResolvedSymbol> {
        let symbol = self
            .lookup(pid, address)
            .or_else(|| self.lookup(-1, address))?;
        Some(ResolvedSymbol {
            name: symbol.name.clone(),
            tag: symbol.tag.clone(),
            system_library: false,
        })
    }
}
