// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Recording kernel for unit tests.

use nexus_abi::{pte, ContextId, KernelError, Pte, RunState, UpcallEntry};

use crate::{fork::Forked, kernel::Kernel, layout::Layout, perm::Perm, runtime::FaultHandler};

pub(crate) const CHILD: ContextId = ContextId::from_raw(0x1001);

/// Address space whose every page has the same entry. Records mappings,
/// allocations, upcall bindings and handler publications.
pub(crate) struct Recorder {
    pub region_present: bool,
    pub entry: Pte,
    pub maps: Vec<(ContextId, Perm)>,
    /// Index of the `page_map` call that fails with `NoMem`, counted from zero.
    pub fail_map_at: Option<usize>,
    pub map_calls: usize,
    pub allocs: Vec<(usize, Perm)>,
    pub upcalls: Vec<UpcallEntry>,
    pub published: Vec<(FaultHandler<Recorder>, Layout)>,
    pub delivered: u64,
}

impl Recorder {
    pub(crate) fn with_entry(bits: u32) -> Self {
        Self {
            region_present: true,
            entry: Pte::new(42, bits),
            maps: Vec::new(),
            fail_map_at: None,
            map_calls: 0,
            allocs: Vec::new(),
            upcalls: Vec::new(),
            published: Vec::new(),
            delivered: 0,
        }
    }
}

impl Kernel for Recorder {
    fn getenvid(&self) -> ContextId {
        ContextId::from_raw(0x1000)
    }
    fn exofork(&mut self) -> Result<Forked, KernelError> {
        unreachable!("recorder never creates contexts")
    }
    fn page_alloc(&mut self, env: ContextId, va: usize, perm: Perm) -> Result<(), KernelError> {
        assert!(env.is_current());
        self.allocs.push((va, perm));
        Ok(())
    }
    fn page_map(
        &mut self,
        src_env: ContextId,
        src_va: usize,
        dst_env: ContextId,
        dst_va: usize,
        perm: Perm,
    ) -> Result<(), KernelError> {
        assert!(src_env.is_current());
        assert_eq!(src_va, dst_va);
        let call = self.map_calls;
        self.map_calls += 1;
        if self.fail_map_at == Some(call) {
            return Err(KernelError::NoMem);
        }
        self.maps.push((dst_env, perm));
        Ok(())
    }
    fn page_unmap(&mut self, _: ContextId, _: usize) -> Result<(), KernelError> {
        unreachable!("recorder never unmaps")
    }
    fn set_pgfault_upcall(&mut self, env: ContextId, entry: UpcallEntry) -> Result<(), KernelError> {
        assert!(env.is_current());
        self.upcalls.push(entry);
        Ok(())
    }
    fn set_status(&mut self, _: ContextId, _: RunState) -> Result<(), KernelError> {
        unreachable!("recorder never changes run state")
    }
    fn trampoline(&self) -> UpcallEntry {
        UpcallEntry(0x0080_0000)
    }
    fn publish_handler(&mut self, handler: FaultHandler<Self>, layout: &Layout) {
        self.published.push((handler, *layout));
    }
    fn upcall_faults(&self) -> u64 {
        self.delivered
    }
    fn pde(&self, _: usize) -> Pte {
        if self.region_present {
            Pte::new(1, pte::PRESENT | pte::WRITABLE | pte::USER)
        } else {
            Pte::EMPTY
        }
    }
    fn pte(&self, _: usize) -> Pte {
        self.entry
    }
    fn copy_page(&mut self, _: usize, _: usize) -> Result<(), KernelError> {
        unreachable!("recorder never copies")
    }
}
