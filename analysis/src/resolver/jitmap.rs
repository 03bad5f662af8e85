//! Names for JIT-generated code recorded in jitmap frames

use super::{ResolvedSymbol, SymbolResolver};
use crate::context::AddressContext;
use crate::error::AnalysisError;
use crate::scan::for_each_frame;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracefold_capture::protocol::is_jit_address;
use tracefold_capture::{Address, CaptureReader, FrameBody, Pid, Timestamp};
use tracing::debug;

const JIT_TAG: &str = "JIT";

#[derive(Default)]
pub struct JitmapResolver {
    names: HashMap<Address, String>,
}

impl JitmapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl SymbolResolver for JitmapResolver {
    fn name(&self) -> &'static str {
        "jitmap"
    }

    fn load(
        &mut self,
        reader: &mut CaptureReader,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        self.names.clear();
        for_each_frame(reader, cancel, |frame| {
            if let FrameBody::JitMap(map) = frame.body {
                self.names.extend(map.entries);
            }
        })?;
        debug!("Loaded {} jitmap entries", self.names.len());
        Ok(())
    }

    fn resolve(
        &mut self,
        _time: Timestamp,
        _pid: Pid,
        _context: AddressContext,
        address: Address,
    ) -> Option<ResolvedSymbol> {
        if !is_jit_address(address) {
            return None;
        }
        let name = self.names.get(&address)?;
        Some(ResolvedSymbol::tagged(name.clone(), JIT_TAG))
    }
}
