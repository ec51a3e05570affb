// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-level copy-on-write fork built on exokernel page primitives
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests per module + 4 integration suites
//!
//! PUBLIC API:
//!   - Runtime: context-local state (self identity, registered fault handler)
//!   - Runtime::fork(): duplicate the calling context with copy-on-write sharing
//!   - Runtime::sfork(): shared-memory variant, always rejected
//!   - pgfault(): copy-on-write fault handler
//!   - duppage(): per-page duplication decision
//!   - Kernel trait: kernel primitives and the read-only page-table window
//!   - Perm, Layout, Error
//!
//! DEPENDENCIES:
//!   - nexus-abi: context ids, PTE bits, trap frame, kernel error codes
//!   - parking_lot/serde/toml (std): host kernel model and layout profiles
//!
//! The kernel offers no fork. Everything here is assembled from page-fault
//! handling and explicit per-page remapping: writable pages become shared
//! copy-on-write frames, and the first write in either context takes a fault
//! that swaps in a private copy.

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![cfg_attr(
    not(all(nexus_env = "os", feature = "os-lite")),
    forbid(unsafe_code)
)]
#![deny(clippy::all, missing_docs)]
#![allow(unexpected_cfgs)]

mod duppage;
mod fault;
mod fork;
mod kernel;
pub mod layout;
mod perm;
mod runtime;
#[cfg(test)]
mod testing;
#[cfg(any(test, all(nexus_env = "os", feature = "os-lite")))]
mod upcall;

#[cfg(feature = "std")]
pub mod host;

#[cfg(all(nexus_env = "os", feature = "os-lite"))]
pub mod os;

pub use duppage::{duppage, Dup};
pub use fault::pgfault;
pub use fork::{Forked, Tally};
pub use kernel::Kernel;
pub use layout::{Layout, LayoutError};
pub use perm::Perm;
pub use runtime::{FaultHandler, Runtime};

pub use nexus_abi::{ContextId, FaultCode, KernelError, RunState, UTrapframe, PAGE_SIZE};

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Failures surfaced by the fork protocol.
///
/// Every kernel primitive has its own variant so a diagnostic names the call
/// that failed and the code it returned. Contract violations inside the fault
/// handler are not represented here; they abort the context.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Context creation failed.
    #[error("exofork: {0}")]
    Exofork(KernelError),
    /// Frame allocation failed.
    #[error("page_alloc {env} {va:#x}: {source}")]
    PageAlloc {
        /// Context receiving the frame.
        env: ContextId,
        /// Target address.
        va: usize,
        /// Kernel error.
        source: KernelError,
    },
    /// Frame sharing failed.
    #[error("page_map {src_va:#x} -> {dst_env} {dst_va:#x}: {source}")]
    PageMap {
        /// Source address in the calling context.
        src_va: usize,
        /// Context receiving the mapping.
        dst_env: ContextId,
        /// Target address.
        dst_va: usize,
        /// Kernel error.
        source: KernelError,
    },
    /// Unmapping failed.
    #[error("page_unmap {va:#x}: {source}")]
    PageUnmap {
        /// Address being unmapped.
        va: usize,
        /// Kernel error.
        source: KernelError,
    },
    /// Copying page contents inside the calling context failed.
    #[error("copy {src_va:#x} -> {dst_va:#x}: {source}")]
    CopyPage {
        /// Page being copied.
        src_va: usize,
        /// Scratch page receiving the copy.
        dst_va: usize,
        /// Kernel error.
        source: KernelError,
    },
    /// Binding the fault upcall failed.
    #[error("set_pgfault_upcall {env}: {source}")]
    SetUpcall {
        /// Context being bound.
        env: ContextId,
        /// Kernel error.
        source: KernelError,
    },
    /// Run-state transition failed.
    #[error("set_status {env}: {source}")]
    SetStatus {
        /// Context being transitioned.
        env: ContextId,
        /// Kernel error.
        source: KernelError,
    },
    /// Requested duplication variant is not implemented.
    #[error("shared fork is not implemented")]
    Unsupported,
    /// The kernel destroyed the context instead of delivering a fault.
    #[error("context {env} killed by unhandled fault at {va:#x}")]
    Killed {
        /// Context that was destroyed.
        env: ContextId,
        /// Faulting address.
        va: usize,
    },
    /// The memory layout failed validation.
    #[error("layout: {0}")]
    Layout(#[from] LayoutError),
}

impl Error {
    /// Returns the negative code the kernel-facing C ABI reports for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Exofork(source)
            | Self::PageAlloc { source, .. }
            | Self::PageMap { source, .. }
            | Self::PageUnmap { source, .. }
            | Self::CopyPage { source, .. }
            | Self::SetUpcall { source, .. }
            | Self::SetStatus { source, .. } => source.code(),
            Self::Unsupported | Self::Layout(_) => KernelError::Invalid.code(),
            Self::Killed { .. } => KernelError::Fault.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_kernel_error() {
        let err = Error::PageAlloc {
            env: ContextId::from_raw(0x1001),
            va: 0xeebff000,
            source: KernelError::NoMem,
        };
        assert_eq!(err.code(), -4);
        assert_eq!(Error::Unsupported.code(), -3);
        assert_eq!(Error::Exofork(KernelError::NoFreeEnv).code(), -5);
    }

    #[test]
    fn diagnostics_name_the_primitive() {
        let err = Error::PageMap {
            src_va: 0x1000,
            dst_env: ContextId::from_raw(0x1001),
            dst_va: 0x1000,
            source: KernelError::Invalid,
        };
        let text = err.to_string();
        assert!(text.starts_with("page_map 0x1000 -> 00001001 0x1000"), "{text}");
        assert!(text.ends_with("(-3)"), "{text}");
    }
}
