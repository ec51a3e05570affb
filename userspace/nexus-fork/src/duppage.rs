// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-page duplication into a child context.

use nexus_abi::{page_address, region_of, ContextId};

use crate::{kernel::Kernel, perm::Perm, Error, Result};

/// What [`duppage`] did with a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dup {
    /// The whole page-directory region is unmapped; nothing in it needs work.
    RegionAbsent,
    /// The page is unmapped.
    Absent,
    /// Read-only page mapped into the child unchanged.
    Shared,
    /// Page downgraded to copy-on-write in both contexts.
    Cow,
}

/// Establishes page `vpn` of the calling context in `env`.
///
/// Writable and copy-on-write pages end up copy-on-write in both contexts,
/// backed by the same frame. The child is mapped before the caller is
/// downgraded so the caller never loses write access to a frame it alone owns.
pub fn duppage<K: Kernel>(kernel: &mut K, env: ContextId, vpn: usize) -> Result<Dup> {
    if !kernel.pde(region_of(vpn)).is_present() {
        return Ok(Dup::RegionAbsent);
    }
    let entry = kernel.pte(vpn);
    if !entry.is_present() {
        return Ok(Dup::Absent);
    }

    let va = page_address(vpn);
    let perm = Perm::from_pte(entry);
    if !perm.needs_cow() {
        map(kernel, va, env, perm)?;
        log::trace!("duppage: {va:#x} shared read-only with {env}");
        return Ok(Dup::Shared);
    }

    let shared = perm.cow_downgrade();
    map(kernel, va, env, shared)?;
    map(kernel, va, ContextId::CURRENT, shared)?;
    log::trace!("duppage: {va:#x} copy-on-write with {env}");
    Ok(Dup::Cow)
}

fn map<K: Kernel>(kernel: &mut K, va: usize, dst_env: ContextId, perm: Perm) -> Result<()> {
    kernel
        .page_map(ContextId::CURRENT, va, dst_env, va, perm)
        .map_err(|source| Error::PageMap { src_va: va, dst_env, dst_va: va, source })
}
