// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fork orchestration.
//!
//! Order matters: the child is populated, given its own exception stack and
//! upcall, and only then made runnable. The kernel never delivers faults to a
//! context that is not runnable, so the child cannot fault before it can
//! handle the fault.

use nexus_abi::{region_of, ContextId, RunState, PAGES_PER_REGION};

use crate::{
    duppage::{duppage, Dup},
    fault::pgfault,
    kernel::Kernel,
    perm::Perm,
    runtime::Runtime,
    Error, Result,
};

/// Outcome of context creation and of [`Runtime::fork`], seen from each side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Forked {
    /// Caller side, carrying the new child's identifier.
    Parent(ContextId),
    /// Child side.
    Child,
}

impl Forked {
    /// Identifier returned to this side: the child's id in the parent, zero in the child.
    pub fn envid(self) -> ContextId {
        match self {
            Self::Parent(child) => child,
            Self::Child => ContextId::CURRENT,
        }
    }

    /// Returns `true` on the child side.
    pub fn is_child(self) -> bool {
        matches!(self, Self::Child)
    }
}

/// Pages handled by one fork.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    /// Pages now shared copy-on-write.
    pub cow: usize,
    /// Read-only pages shared unchanged.
    pub shared: usize,
    /// Page-directory regions skipped as unmapped.
    pub regions_skipped: usize,
}

impl<K: Kernel> Runtime<K> {
    /// Duplicates the calling context.
    ///
    /// Returns [`Forked::Parent`] with the runnable child's id in the caller
    /// and [`Forked::Child`] in the child. A failing primitive aborts the fork
    /// before the child is made runnable; the half-built child is left to the
    /// kernel.
    pub fn fork(&mut self) -> Result<Forked> {
        self.set_pgfault_handler(pgfault::<K>)?;

        let child = match self.kernel.exofork().map_err(Error::Exofork)? {
            Forked::Child => {
                self.this_env = self.kernel.getenvid();
                log::debug!("fork: running as child {}", self.this_env);
                return Ok(Forked::Child);
            }
            Forked::Parent(child) => child,
        };
        self.image_tally = self.last_tally;

        let mut tally = Tally::default();
        let end = self.layout.duplicable_pages();
        let mut vpn = 0;
        while vpn < end {
            match duppage(&mut self.kernel, child, vpn)? {
                Dup::RegionAbsent => {
                    tally.regions_skipped += 1;
                    vpn = (region_of(vpn) + 1) * PAGES_PER_REGION;
                    continue;
                }
                Dup::Absent => {}
                Dup::Shared => tally.shared += 1,
                Dup::Cow => tally.cow += 1,
            }
            vpn += 1;
        }

        let xstack = self.layout.exception_stack();
        self.kernel
            .page_alloc(child, xstack, Perm::EXCEPTION_STACK)
            .map_err(|source| Error::PageAlloc { env: child, va: xstack, source })?;
        let entry = self.kernel.trampoline();
        self.kernel
            .set_pgfault_upcall(child, entry)
            .map_err(|source| Error::SetUpcall { env: child, source })?;
        self.kernel
            .set_status(child, RunState::Runnable)
            .map_err(|source| Error::SetStatus { env: child, source })?;

        log::info!(
            "fork: {} -> {child} runnable (cow={} shared={} regions skipped={})",
            self.this_env,
            tally.cow,
            tally.shared,
            tally.regions_skipped
        );
        self.last_tally = Some(tally);
        Ok(Forked::Parent(child))
    }

    /// Shared-memory fork. Not implemented; always fails without side effects.
    pub fn sfork(&mut self) -> Result<Forked> {
        Err(Error::Unsupported)
    }
}
