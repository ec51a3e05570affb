// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! OS backend: exokernel syscalls and the `uvpt` page-table window.

use nexus_abi::{ContextId, KernelError, Pte, RunState, UTrapframe, UpcallEntry, PAGE_SIZE};

use crate::{
    fork::Forked, kernel::Kernel, layout::Layout, perm::Perm, runtime::FaultHandler, upcall::UpcallSlot,
};

extern "C" {
    /// Assembly trampoline: switches to the exception stack, calls
    /// [`nexus_pgfault_entry`] and resumes the faulting instruction.
    fn _pgfault_upcall();
}

static UPCALL: UpcallSlot = UpcallSlot::new();

/// Kernel handle of the calling context.
#[derive(Clone, Copy, Debug)]
pub struct OsKernel {
    layout: Layout,
}

impl OsKernel {
    /// Creates a handle reading page tables through `layout.uvpt`.
    pub const fn new(layout: Layout) -> Self {
        Self { layout }
    }

    fn uvpd(&self) -> usize {
        self.layout.uvpt + (self.layout.uvpt >> 12) * 4
    }
}

impl Kernel for OsKernel {
    fn getenvid(&self) -> ContextId {
        nexus_abi::getenvid()
    }

    fn exofork(&mut self) -> Result<Forked, KernelError> {
        let id = nexus_abi::exofork()?;
        Ok(if id.is_current() { Forked::Child } else { Forked::Parent(id) })
    }

    fn page_alloc(&mut self, env: ContextId, va: usize, perm: Perm) -> Result<(), KernelError> {
        nexus_abi::page_alloc(env, va, perm.bits())
    }

    fn page_map(
        &mut self,
        src_env: ContextId,
        src_va: usize,
        dst_env: ContextId,
        dst_va: usize,
        perm: Perm,
    ) -> Result<(), KernelError> {
        nexus_abi::page_map(src_env, src_va, dst_env, dst_va, perm.bits())
    }

    fn page_unmap(&mut self, env: ContextId, va: usize) -> Result<(), KernelError> {
        nexus_abi::page_unmap(env, va)
    }

    fn set_pgfault_upcall(&mut self, env: ContextId, entry: UpcallEntry) -> Result<(), KernelError> {
        nexus_abi::env_set_pgfault_upcall(env, entry)
    }

    fn set_status(&mut self, env: ContextId, status: RunState) -> Result<(), KernelError> {
        nexus_abi::env_set_status(env, status)
    }

    fn trampoline(&self) -> UpcallEntry {
        UpcallEntry(_pgfault_upcall as usize)
    }

    fn publish_handler(&mut self, handler: FaultHandler<Self>, layout: &Layout) {
        UPCALL.publish(handler as usize, layout);
    }

    fn upcall_faults(&self) -> u64 {
        UPCALL.faults()
    }

    fn pde(&self, region: usize) -> Pte {
        // SAFETY: the kernel maps the page directory read-only at uvpd for
        // every context; `region` indexes one of its entries.
        Pte::from_raw(unsafe { core::ptr::read_volatile((self.uvpd() as *const u32).add(region)) })
    }

    fn pte(&self, vpn: usize) -> Pte {
        // SAFETY: `duppage` and `pgfault` read the covering pde first and
        // only come here when it is present, so the page table backing this
        // slot of the uvpt window is mapped.
        Pte::from_raw(unsafe { core::ptr::read_volatile((self.layout.uvpt as *const u32).add(vpn)) })
    }

    fn copy_page(&mut self, dst_va: usize, src_va: usize) -> Result<(), KernelError> {
        // SAFETY: both addresses are mapped pages of this context and never
        // the same page (dst is the scratch page, writable and private).
        unsafe {
            core::ptr::copy_nonoverlapping(src_va as *const u8, dst_va as *mut u8, PAGE_SIZE);
        }
        Ok(())
    }
}

/// Called by the trampoline on the exception stack for every delivered fault.
///
/// Runs the handler last registered through
/// [`crate::Runtime::set_pgfault_handler`] under the layout it was registered
/// with. A fault the handler cannot repair, or a failing primitive, is fatal
/// to the context.
///
/// # Panics
///
/// Panics if no handler was ever registered, or if the handler fails.
#[no_mangle]
pub extern "C" fn nexus_pgfault_entry(utf: &UTrapframe) {
    let Some((addr, layout)) = UPCALL.load() else {
        log::error!("pgfault: fault at {:#x} with no handler registered", utf.fault_va);
        panic!("runtime: fault at {:#x} (err {:#x}) with no handler registered", utf.fault_va, utf.err.bits());
    };
    // SAFETY: the slot is only written by `publish_handler`, which stores the
    // address of a `FaultHandler<OsKernel>`.
    let handler = unsafe { core::mem::transmute::<usize, FaultHandler<OsKernel>>(addr) };
    let mut kernel = OsKernel::new(layout);
    if let Err(err) = handler(&mut kernel, &layout, utf) {
        log::error!("pgfault: {err}");
        panic!("pgfault at {:#x}: {err} (code {})", utf.fault_va, err.code());
    }
    UPCALL.record_fault();
}
