//! Kernel symbols from a kallsyms table

use super::{ResolvedSymbol, SymbolResolver};
use crate::context::AddressContext;
use crate::error::AnalysisError;
use crate::scan::read_embedded_file;
use tokio_util::sync::CancellationToken;
use tracefold_capture::{Address, CaptureReader, Pid, Timestamp};
use tracing::{debug, warn};

pub const KALLSYMS_PATH: &str = "/proc/kallsyms";

const KERNEL_TAG: &str = "Kernel";

#[derive(Default)]
pub struct KernelSymbolResolver {
    /// Sorted by address
    symbols: Vec<(Address, String)>,
    allow_host: bool,
}

impl KernelSymbolResolver {
    /// Uses only the kallsyms table embedded in the capture
    pub fn new() -> Self {
        Self::default()
    }

    /// Falls back to the running kernel's table when the capture has none
    pub fn with_host_fallback() -> Self {
        Self {
            allow_host: true,
            ..Self::default()
        }
    }

    pub fn from_kallsyms(text: &str) -> Self {
        let mut resolver = Self::new();
        resolver.symbols = parse_kallsyms(text);
        resolver
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Text symbols of a kallsyms listing, sorted by address. Zeroed addresses
/// (restricted kptr access) are dropped.
fn parse_kallsyms(text: &str) -> Vec<(Address, String)> {
    let mut symbols: Vec<(Address, String)> = text
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let address = Address::from_str_radix(fields.next()?, 16).ok()?;
            let kind = fields.next()?;
            let name = fields.next()?;
            let is_text = matches!(kind, "t" | "T" | "w" | "W");
            (is_text && address != 0).then(|| (address, name.to_string()))
        })
        .collect();
    symbols.sort_by_key(|(address, _)| *address);
    symbols
}

impl SymbolResolver for KernelSymbolResolver {
    fn name(&self) -> &'static str {
        "kernel"
    }

    fn load(
        &mut self,
        reader: &mut CaptureReader,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        if let Some(data) = read_embedded_file(reader, KALLSYMS_PATH, cancel)? {
            self.symbols = parse_kallsyms(&String::from_utf8_lossy(&data));
            debug!("Loaded {} kernel symbols from capture", self.symbols.len());
        } else if self.allow_host {
            match std::fs::read_to_string(KALLSYMS_PATH) {
                Ok(text) => {
                    self.symbols = parse_kallsyms(&text);
                    debug!("Loaded {} kernel symbols from host", self.symbols.len());
                }
                Err(e) => warn!("Failed to read {}: {}", KALLSYMS_PATH, e),
            }
        }
        Ok(())
    }

    fn resolve(
        &mut self,
        _time: Timestamp,
        _pid: Pid,
        context: AddressContext,
        address: Address,
    ) -> Option<ResolvedSymbol> {
        if context != AddressContext::Kernel {
            return None;
        }
        let idx = self.symbols.partition_point(|(start, _)| *start <= address);
        let (_, name) = self.symbols[..idx].last()?;
        Some(ResolvedSymbol::tagged(name.clone(), KERNEL_TAG))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KALLSYMS: &str = "\
ffffffff81000000 T _stext
ffffffff81001000 t do_one_initcall
0000000000000000 T hidden
ffffffff81002000 D some_data
ffffffff81003000 T schedule [kernel]
";

    #[test]
    fn test_parse_keeps_text_symbols() {
        let resolver = KernelSymbolResolver::from_kallsyms(KALLSYMS);
        assert_eq!(resolver.len(), 3);
    }

    #[test]
    fn test_resolves_only_kernel_context() {
        let mut resolver = KernelSymbolResolver::from_kallsyms(KALLSYMS);

        let hit = resolver
            .resolve(0, 1, AddressContext::Kernel, 0xffff_ffff_8100_1010)
            .unwrap();
        assert_eq!(hit.name, "do_one_initcall");
        assert_eq!(hit.tag.as_deref(), Some("Kernel"));

        assert!(resolver
            .resolve(0, 1, AddressContext::User, 0xffff_ffff_8100_1010)
            .is_none());
        assert!(resolver
            .resolve(0, 1, AddressContext::Kernel, 0x1000)
            .is_none());
        assert_eq!(
            resolver
                .resolve(0, 1, AddressContext::Kernel, 0xffff_ffff_8100_3008)
                .unwrap()
                .name,
            "schedule"
        );
    }
}
