// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel primitive seam.
//!
//! The protocol never touches the kernel directly. The OS backend forwards to
//! the exokernel syscalls and reads the `uvpt` window; the host backend drives
//! an in-memory model so the protocol can be exercised without a kernel.

use nexus_abi::{ContextId, KernelError, Pte, RunState, UpcallEntry};

use crate::{fork::Forked, layout::Layout, perm::Perm, runtime::FaultHandler};

/// Kernel primitives and the read-only page-table window of the calling context.
pub trait Kernel {
    /// Identifier of the calling context.
    fn getenvid(&self) -> ContextId;

    /// Creates an empty, not-runnable child.
    ///
    /// Control comes back twice: as [`Forked::Parent`] in the caller and as
    /// [`Forked::Child`] once the child is first scheduled.
    fn exofork(&mut self) -> Result<Forked, KernelError>;

    /// Allocates a zeroed frame and maps it at `va` in `env`.
    fn page_alloc(&mut self, env: ContextId, va: usize, perm: Perm) -> Result<(), KernelError>;

    /// Maps the frame behind `src_va` in `src_env` at `dst_va` in `dst_env`.
    fn page_map(
        &mut self,
        src_env: ContextId,
        src_va: usize,
        dst_env: ContextId,
        dst_va: usize,
        perm: Perm,
    ) -> Result<(), KernelError>;

    /// Removes the mapping at `va` in `env`.
    fn page_unmap(&mut self, env: ContextId, va: usize) -> Result<(), KernelError>;

    /// Binds the fault upcall of `env`.
    fn set_pgfault_upcall(&mut self, env: ContextId, entry: UpcallEntry) -> Result<(), KernelError>;

    /// Transitions `env` to `status`.
    fn set_status(&mut self, env: ContextId, status: RunState) -> Result<(), KernelError>;

    /// Entry point of the assembly trampoline that calls the registered handler.
    fn trampoline(&self) -> UpcallEntry;

    /// Makes `handler` reachable from the upcall entry point.
    ///
    /// Called on every registration. Backends that deliver faults through
    /// [`crate::Runtime::dispatch`] have nothing to publish.
    fn publish_handler(&mut self, handler: FaultHandler<Self>, layout: &Layout) {
        let _ = (handler, layout);
    }

    /// Faults handled by the upcall entry point outside [`crate::Runtime::dispatch`].
    fn upcall_faults(&self) -> u64 {
        0
    }

    /// Page-directory entry covering `region`.
    fn pde(&self, region: usize) -> Pte;

    /// Page-table entry for page `vpn`. Only meaningful if its region is present.
    fn pte(&self, vpn: usize) -> Pte;

    /// Copies one page of the calling context from `src_va` to `dst_va`.
    fn copy_page(&mut self, dst_va: usize, src_va: usize) -> Result<(), KernelError>;
}
