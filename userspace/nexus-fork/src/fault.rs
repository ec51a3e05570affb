// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write page fault handler.

use nexus_abi::{page_number, page_round_down, region_of, ContextId, FaultCode, UTrapframe};

use crate::{kernel::Kernel, layout::Layout, perm::Perm, Error, Result};

/// Replaces the shared frame behind a faulting copy-on-write page with a
/// private writable copy.
///
/// # Panics
///
/// Panics if the fault is not a write or the page is not copy-on-write. Both
/// are access violations this handler has no authority to repair.
pub fn pgfault<K: Kernel>(kernel: &mut K, layout: &Layout, utf: &UTrapframe) -> Result<()> {
    let va = utf.fault_va;
    if !utf.err.contains(FaultCode::WRITE) {
        panic!("pgfault: fault at {va:#x} is not a write (err {:#x})", utf.err.bits());
    }
    let vpn = page_number(va);
    let perm = if kernel.pde(region_of(vpn)).is_present() {
        Perm::from_pte(kernel.pte(vpn))
    } else {
        Perm::empty()
    };
    if !perm.contains(Perm::COPY_ON_WRITE) {
        panic!(
            "pgfault: write fault at {va:#x} on a page that is not copy-on-write (perm {:#x}, err {:#x})",
            perm.bits(),
            utf.err.bits()
        );
    }

    let page = page_round_down(va);
    let perm = perm.private_copy();
    let scratch = layout.pftemp;
    kernel
        .page_alloc(ContextId::CURRENT, scratch, perm)
        .map_err(|source| Error::PageAlloc { env: ContextId::CURRENT, va: scratch, source })?;
    kernel
        .copy_page(scratch, page)
        .map_err(|source| Error::CopyPage { src_va: page, dst_va: scratch, source })?;
    kernel
        .page_map(ContextId::CURRENT, scratch, ContextId::CURRENT, page, perm)
        .map_err(|source| Error::PageMap {
            src_va: scratch,
            dst_env: ContextId::CURRENT,
            dst_va: page,
            source,
        })?;
    kernel
        .page_unmap(ContextId::CURRENT, scratch)
        .map_err(|source| Error::PageUnmap { va: scratch, source })?;
    log::trace!("pgfault: private copy of {page:#x}");
    Ok(())
}
