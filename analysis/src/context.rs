//! Execution contexts embedded in stack traces
//!
//! perf callchains interleave real instruction pointers with sentinel
//! values announcing which context the following frames belong to.

use std::fmt;
use tracefold_capture::Address;

const PERF_CONTEXT_HV: Address = -32i64 as Address;
const PERF_CONTEXT_KERNEL: Address = -128i64 as Address;
const PERF_CONTEXT_USER: Address = -512i64 as Address;
const PERF_CONTEXT_GUEST: Address = -2048i64 as Address;
const PERF_CONTEXT_GUEST_KERNEL: Address = -2176i64 as Address;
const PERF_CONTEXT_GUEST_USER: Address = -2560i64 as Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressContext {
    None,
    Hypervisor,
    Kernel,
    User,
    Guest,
    GuestKernel,
    GuestUser,
}

impl AddressContext {
    /// The context a marker address switches to, or None for a real address
    pub fn from_marker(address: Address) -> Option<Self> {
        match address {
            PERF_CONTEXT_HV => Some(AddressContext::Hypervisor),
            PERF_CONTEXT_KERNEL => Some(AddressContext::Kernel),
            PERF_CONTEXT_USER => Some(AddressContext::User),
            PERF_CONTEXT_GUEST => Some(AddressContext::Guest),
            PERF_CONTEXT_GUEST_KERNEL => Some(AddressContext::GuestKernel),
            PERF_CONTEXT_GUEST_USER => Some(AddressContext::GuestUser),
            _ => None,
        }
    }

    pub fn is_marker(address: Address) -> bool {
        Self::from_marker(address).is_some()
    }

    /// Marker value announcing this context
    pub fn marker(self) -> Option<Address> {
        match self {
            AddressContext::None => None,
            AddressContext::Hypervisor => Some(PERF_CONTEXT_HV),
            AddressContext::Kernel => Some(PERF_CONTEXT_KERNEL),
            AddressContext::User => Some(PERF_CONTEXT_USER),
            AddressContext::Guest => Some(PERF_CONTEXT_GUEST),
            AddressContext::GuestKernel => Some(PERF_CONTEXT_GUEST_KERNEL),
            AddressContext::GuestUser => Some(PERF_CONTEXT_GUEST_USER),
        }
    }

    /// Label used for the synthetic frame standing in for this context
    pub fn name(self) -> &'static str {
        match self {
            AddressContext::None => "- - None - -",
            AddressContext::Hypervisor => "- - Hypervisor - -",
            AddressContext::Kernel => "- - Kernel - -",
            AddressContext::User => "- - User - -",
            AddressContext::Guest => "- - Guest - -",
            AddressContext::GuestKernel => "- - Guest Kernel - -",
            AddressContext::GuestUser => "- - Guest User - -",
        }
    }
}

impl fmt::Display for AddressContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
