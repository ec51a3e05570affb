// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Context-local state shared by the fork protocol and the fault upcall.

use nexus_abi::{ContextId, UTrapframe};

use crate::{fork::Tally, kernel::Kernel, layout::Layout, perm::Perm, Error, Result};

/// Handler invoked for every fault delivered to the calling context.
pub type FaultHandler<K> = fn(&mut K, &Layout, &UTrapframe) -> Result<()>;

/// State a context keeps about itself.
///
/// Everything here lives in the context's own memory image, so a child starts
/// with a copy of its parent's runtime. The cached identity in that copy is
/// the parent's until the child side of [`Runtime::fork`] refreshes it.
pub struct Runtime<K: Kernel> {
    pub(crate) kernel: K,
    pub(crate) layout: Layout,
    pub(crate) this_env: ContextId,
    pub(crate) handler: Option<FaultHandler<K>>,
    pub(crate) faults: u64,
    pub(crate) last_tally: Option<Tally>,
    /// `last_tally` as it stood when the most recent fork created its child.
    pub(crate) image_tally: Option<Tally>,
}

impl<K: Kernel> Runtime<K> {
    /// Binds a runtime to `kernel` after validating `layout`.
    pub fn new(kernel: K, layout: Layout) -> Result<Self> {
        layout.validate()?;
        let this_env = kernel.getenvid();
        Ok(Self { kernel, layout, this_env, handler: None, faults: 0, last_tally: None, image_tally: None })
    }

    /// Cached identity of the calling context.
    pub fn this_env(&self) -> ContextId {
        self.this_env
    }

    /// Memory layout in effect.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Kernel handle.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Mutable kernel handle.
    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    /// Returns `true` once a fault handler has been registered.
    pub fn handler_installed(&self) -> bool {
        self.handler.is_some()
    }

    /// Number of faults handled by the registered handler, whether they came
    /// through [`Runtime::dispatch`] or straight from the upcall entry point.
    pub fn faults_handled(&self) -> u64 {
        self.faults + self.kernel.upcall_faults()
    }

    /// Page counts from the most recent fork performed by this context.
    pub fn last_tally(&self) -> Option<Tally> {
        self.last_tally
    }

    /// Registers `handler` for faults in the calling context.
    ///
    /// The first registration allocates the exception stack and binds the
    /// trampoline as the upcall; later registrations only swap the handler.
    pub fn set_pgfault_handler(&mut self, handler: FaultHandler<K>) -> Result<()> {
        if self.handler.is_none() {
            let xstack = self.layout.exception_stack();
            self.kernel
                .page_alloc(ContextId::CURRENT, xstack, Perm::EXCEPTION_STACK)
                .map_err(|source| Error::PageAlloc { env: self.this_env, va: xstack, source })?;
            let entry = self.kernel.trampoline();
            self.kernel
                .set_pgfault_upcall(ContextId::CURRENT, entry)
                .map_err(|source| Error::SetUpcall { env: self.this_env, source })?;
            log::debug!("runtime: {} exception stack at {xstack:#x}, upcall {:#x}", self.this_env, entry.0);
        }
        self.kernel.publish_handler(handler, &self.layout);
        self.handler = Some(handler);
        Ok(())
    }

    /// Runs the registered handler for a delivered fault.
    ///
    /// # Panics
    ///
    /// Panics if no handler is registered; the upcall is only bound together
    /// with a handler, so a delivery without one is a broken runtime image.
    pub fn dispatch(&mut self, utf: &UTrapframe) -> Result<()> {
        let Some(handler) = self.handler else {
            panic!(
                "runtime: fault at {:#x} (err {:#x}) with no handler registered",
                utf.fault_va,
                utf.err.bits()
            );
        };
        handler(&mut self.kernel, &self.layout, utf)?;
        self.faults += 1;
        Ok(())
    }

    /// The runtime image a child of the most recent fork starts from, bound to
    /// another kernel handle.
    ///
    /// The child's pages were captured during the walk, before the parent
    /// recorded that fork's tally, so the child sees the tally from before it.
    #[cfg_attr(not(feature = "std"), allow(dead_code))]
    pub(crate) fn image_for(&self, kernel: K) -> Self {
        Self {
            kernel,
            layout: self.layout,
            this_env: self.this_env,
            handler: self.handler,
            faults: self.faults,
            last_tally: self.image_tally,
            image_tally: self.image_tally,
        }
    }
}
