// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(
    not(all(nexus_env = "os", target_arch = "riscv64", target_os = "none")),
    forbid(unsafe_code)
)]
#![deny(clippy::all, missing_docs)]
#![allow(unexpected_cfgs)]

//! CONTEXT: Shared ABI definitions for the exokernel memory primitives
//! OWNERS: @runtime
//! PUBLIC API: ContextId, RunState, Pte, PteFlags, FaultCode, UTrapframe, KernelError;
//!   OS-only syscalls: getenvid, exofork, page_alloc, page_map, page_unmap,
//!   env_set_pgfault_upcall, env_set_status
//! DEPENDS_ON: no_std (OS), riscv ecall asm (OS), bitflags
//! INVARIANTS: PTE_SYSCALL is the only permission set accepted by mapping syscalls;
//!   the AVAIL range never overlaps hardware-defined PTE bits

use core::fmt;

use bitflags::bitflags;

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Shift converting a virtual address into its page number.
pub const PAGE_SHIFT: usize = 12;
/// Number of page-table entries per page-directory region.
pub const PAGES_PER_REGION: usize = 1024;

/// Returns the page number containing `va`.
pub const fn page_number(va: usize) -> usize {
    va >> PAGE_SHIFT
}

/// Returns the first virtual address of page `vpn`.
pub const fn page_address(vpn: usize) -> usize {
    vpn << PAGE_SHIFT
}

/// Returns the page-directory region covering page `vpn`.
pub const fn region_of(vpn: usize) -> usize {
    vpn / PAGES_PER_REGION
}

/// Rounds `va` down to the start of its page.
pub const fn page_round_down(va: usize) -> usize {
    va & !(PAGE_SIZE - 1)
}

/// Raw identifier of an execution context.
///
/// The value `0` never names a real context: syscalls interpret it as the
/// calling context, and context creation hands it to the new child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContextId(u32);

impl ContextId {
    /// Refers to the calling context in syscall arguments.
    pub const CURRENT: Self = Self(0);

    /// Wraps a raw identifier.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Returns `true` when this is the calling-context sentinel.
    pub const fn is_current(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling state of an execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RunState {
    /// Slot is unused.
    Free = 0,
    /// Context is being torn down.
    Dying = 1,
    /// Context may be scheduled.
    Runnable = 2,
    /// Context is currently executing.
    Running = 3,
    /// Context exists but must not be scheduled.
    NotRunnable = 4,
}

impl RunState {
    /// Decodes a raw status value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }
}

/// Raw page-table-entry bit values.
pub mod pte {
    /// Entry maps a frame.
    pub const PRESENT: u32 = 0x001;
    /// Hardware allows writes through the entry.
    pub const WRITABLE: u32 = 0x002;
    /// Entry is reachable from user mode.
    pub const USER: u32 = 0x004;
    /// Write-through caching.
    pub const WRITE_THROUGH: u32 = 0x008;
    /// Caching disabled.
    pub const CACHE_DISABLE: u32 = 0x010;
    /// Set by hardware on access.
    pub const ACCESSED: u32 = 0x020;
    /// Set by hardware on write.
    pub const DIRTY: u32 = 0x040;
    /// Large-page mapping (directory entries only).
    pub const HUGE: u32 = 0x080;
    /// Mapping survives address-space switches.
    pub const GLOBAL: u32 = 0x100;
    /// Bits the hardware ignores; reserved for user-level software.
    pub const AVAIL: u32 = 0xE00;

    /// Every bit the hardware assigns a meaning to.
    pub const HARDWARE: u32 = PRESENT
        | WRITABLE
        | USER
        | WRITE_THROUGH
        | CACHE_DISABLE
        | ACCESSED
        | DIRTY
        | HUGE
        | GLOBAL;

    /// Bits a caller may pass to mapping syscalls.
    pub const SYSCALL: u32 = AVAIL | PRESENT | WRITABLE | USER;

    /// Mask selecting the flag portion of an entry.
    pub const FLAGS_MASK: u32 = 0xFFF;
}

bitflags! {
    /// Typed view over the flag bits of a page-table entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        /// Entry maps a frame.
        const PRESENT = pte::PRESENT;
        /// Hardware allows writes.
        const WRITABLE = pte::WRITABLE;
        /// Reachable from user mode.
        const USER = pte::USER;
        /// Write-through caching.
        const WRITE_THROUGH = pte::WRITE_THROUGH;
        /// Caching disabled.
        const CACHE_DISABLE = pte::CACHE_DISABLE;
        /// Accessed by hardware.
        const ACCESSED = pte::ACCESSED;
        /// Written by hardware.
        const DIRTY = pte::DIRTY;
        /// Large-page mapping.
        const HUGE = pte::HUGE;
        /// Global mapping.
        const GLOBAL = pte::GLOBAL;
        /// Software-available range.
        const AVAIL = pte::AVAIL;
    }
}

/// Raw page-table or page-directory entry as read through the `uvpt` window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Pte(u32);

impl Pte {
    /// An entry mapping nothing.
    pub const EMPTY: Self = Self(0);

    /// Wraps a raw entry.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Builds an entry from a frame number and raw flag bits.
    pub const fn new(frame: u32, flags: u32) -> Self {
        Self((frame << PAGE_SHIFT) | (flags & pte::FLAGS_MASK))
    }

    /// Returns the raw entry.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Returns the physical frame number referenced by the entry.
    pub const fn frame(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    /// Returns the raw flag bits.
    pub const fn bits(self) -> u32 {
        self.0 & pte::FLAGS_MASK
    }

    /// Returns the typed flag bits.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.bits())
    }

    /// Returns `true` when the entry maps a frame.
    pub const fn is_present(self) -> bool {
        self.0 & pte::PRESENT != 0
    }
}

bitflags! {
    /// Page-fault error code pushed by the trap path.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// Protection violation on a present page (clear: page not present).
        const PROTECTION = 0x1;
        /// Faulting access was a write.
        const WRITE = 0x2;
        /// Fault happened in user mode.
        const USER = 0x4;
    }
}

/// Trap frame handed to the user-level fault handler by the upcall trampoline.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting virtual address.
    pub fault_va: usize,
    /// Fault error code.
    pub err: FaultCode,
}

impl UTrapframe {
    /// Creates a trap frame for a fault at `fault_va`.
    pub const fn new(fault_va: usize, err: FaultCode) -> Self {
        Self { fault_va, err }
    }
}

/// Address of a user-level upcall entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpcallEntry(pub usize);

/// Errors reported by the kernel primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Unspecified or unknown failure.
    Unspecified,
    /// Context does not exist or the caller may not act on it.
    BadEnv,
    /// Invalid parameter.
    Invalid,
    /// Out of physical memory.
    NoMem,
    /// Context table is full.
    NoFreeEnv,
    /// Memory fault.
    Fault,
}

impl KernelError {
    /// Decodes a negative syscall return into an error.
    pub const fn from_raw(value: isize) -> Option<Self> {
        if value >= 0 {
            return None;
        }
        Some(match -value {
            2 => Self::BadEnv,
            3 => Self::Invalid,
            4 => Self::NoMem,
            5 => Self::NoFreeEnv,
            6 => Self::Fault,
            _ => Self::Unspecified,
        })
    }

    /// Returns the negative code the kernel uses for this error.
    pub const fn code(self) -> i32 {
        match self {
            Self::Unspecified => -1,
            Self::BadEnv => -2,
            Self::Invalid => -3,
            Self::NoMem => -4,
            Self::NoFreeEnv => -5,
            Self::Fault => -6,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unspecified => "unspecified error",
            Self::BadEnv => "bad environment",
            Self::Invalid => "invalid parameter",
            Self::NoMem => "out of memory",
            Self::NoFreeEnv => "out of environments",
            Self::Fault => "segmentation fault",
        };
        write!(f, "{text} ({})", self.code())
    }
}

impl core::error::Error for KernelError {}

/// Result returned by the OS syscall wrappers.
pub type SysResult<T> = core::result::Result<T, KernelError>;

// ——— Syscall wrappers (OS build) ———

/// Returns the identifier of the calling context.
#[cfg(nexus_env = "os")]
pub fn getenvid() -> ContextId {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        const SYSCALL_GETENVID: usize = 2;
        // SAFETY: no arguments; the kernel returns the caller's id.
        let raw = unsafe { ecall0(SYSCALL_GETENVID) };
        ContextId::from_raw(raw as u32)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        ContextId::CURRENT
    }
}

/// Creates an empty, not-runnable child context.
///
/// Returns the child id in the parent and `ContextId::CURRENT` inside the child.
#[cfg(nexus_env = "os")]
pub fn exofork() -> SysResult<ContextId> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        const SYSCALL_EXOFORK: usize = 7;
        // SAFETY: the kernel clones the caller's registers into the child and
        // returns in both contexts; no memory is passed.
        let raw = unsafe { ecall0(SYSCALL_EXOFORK) };
        decode_syscall(raw).map(|id| ContextId::from_raw(id as u32))
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        Err(KernelError::Invalid)
    }
}

/// Allocates a zeroed frame and maps it at `va` in `env` with `perm`.
#[cfg(nexus_env = "os")]
pub fn page_alloc(env: ContextId, va: usize, perm: u32) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        const SYSCALL_PAGE_ALLOC: usize = 9;
        // SAFETY: plain register arguments, validated by the kernel.
        let raw = unsafe { ecall3(SYSCALL_PAGE_ALLOC, env.to_raw() as usize, va, perm as usize) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (env, va, perm);
        Err(KernelError::Invalid)
    }
}

/// Maps the frame behind `src_va` in `src_env` at `dst_va` in `dst_env`.
#[cfg(nexus_env = "os")]
pub fn page_map(
    src_env: ContextId,
    src_va: usize,
    dst_env: ContextId,
    dst_va: usize,
    perm: u32,
) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        const SYSCALL_PAGE_MAP: usize = 10;
        // SAFETY: plain register arguments, validated by the kernel.
        let raw = unsafe {
            ecall5(
                SYSCALL_PAGE_MAP,
                src_env.to_raw() as usize,
                src_va,
                dst_env.to_raw() as usize,
                dst_va,
                perm as usize,
            )
        };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (src_env, src_va, dst_env, dst_va, perm);
        Err(KernelError::Invalid)
    }
}

/// Removes the mapping at `va` in `env`; unmapping nothing succeeds.
#[cfg(nexus_env = "os")]
pub fn page_unmap(env: ContextId, va: usize) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        const SYSCALL_PAGE_UNMAP: usize = 11;
        // SAFETY: plain register arguments, validated by the kernel.
        let raw = unsafe { ecall2(SYSCALL_PAGE_UNMAP, env.to_raw() as usize, va) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (env, va);
        Err(KernelError::Invalid)
    }
}

/// Binds the page-fault upcall of `env` to `entry`.
#[cfg(nexus_env = "os")]
pub fn env_set_pgfault_upcall(env: ContextId, entry: UpcallEntry) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        const SYSCALL_SET_PGFAULT_UPCALL: usize = 13;
        // SAFETY: plain register arguments, validated by the kernel.
        let raw = unsafe { ecall2(SYSCALL_SET_PGFAULT_UPCALL, env.to_raw() as usize, entry.0) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (env, entry);
        Err(KernelError::Invalid)
    }
}

/// Transitions `env` to `status`.
#[cfg(nexus_env = "os")]
pub fn env_set_status(env: ContextId, status: RunState) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        const SYSCALL_SET_STATUS: usize = 12;
        // SAFETY: plain register arguments, validated by the kernel.
        let raw = unsafe {
            ecall2(SYSCALL_SET_STATUS, env.to_raw() as usize, status as u32 as usize)
        };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (env, status);
        Err(KernelError::Invalid)
    }
}

#[cfg(all(nexus_env = "os", target_arch = "riscv64", target_os = "none"))]
fn decode_syscall(value: usize) -> SysResult<usize> {
    match KernelError::from_raw(value as isize) {
        Some(err) => Err(err),
        None => Ok(value),
    }
}

// ——— Architecture-specific ecall helpers (riscv64, OS) ———
#[cfg(all(nexus_env = "os", target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall0(n: usize) -> usize {
    let mut r7 = n;
    let r0: usize;
    core::arch::asm!(
        "ecall",
        inout("a7") r7,
        lateout("a0") r0,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(all(nexus_env = "os", target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall2(n: usize, a0: usize, a1: usize) -> usize {
    let mut r0 = a0;
    let mut r1 = a1;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a1") r1,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(all(nexus_env = "os", target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall3(n: usize, a0: usize, a1: usize, a2: usize) -> usize {
    let mut r0 = a0;
    let mut r1 = a1;
    let mut r2 = a2;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a1") r1,
        inout("a2") r2,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(all(nexus_env = "os", target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall5(n: usize, a0: usize, a1: usize, a2: usize, a3: usize, a4: usize) -> usize {
    let mut r0 = a0;
    let mut r1 = a1;
    let mut r2 = a2;
    let mut r3 = a3;
    let mut r4 = a4;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a1") r1,
        inout("a2") r2,
        inout("a3") r3,
        inout("a4") r4,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}
