// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Permission set carried through duplication and fault handling.

use bitflags::bitflags;
use nexus_abi::{pte, Pte};
use static_assertions::const_assert_eq;

/// Software-defined copy-on-write marker, taken from the AVAIL range.
const COW_BIT: u32 = 0x800;

const_assert_eq!(COW_BIT & pte::AVAIL, COW_BIT);
const_assert_eq!(COW_BIT & pte::HARDWARE, 0);
const_assert_eq!(COW_BIT.count_ones(), 1);

bitflags! {
    /// Page attributes meaningful to the fork protocol.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Perm: u32 {
        /// Page maps a frame.
        const PRESENT = pte::PRESENT;
        /// Hardware permits writes.
        const WRITABLE = pte::WRITABLE;
        /// Reachable from user mode.
        const USER = pte::USER;
        /// Frame is shared; the first write must take a private copy.
        const COPY_ON_WRITE = COW_BIT;
    }
}

impl Perm {
    /// Permissions of a freshly provisioned exception stack.
    pub const EXCEPTION_STACK: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Extracts the protocol-relevant bits of a raw entry.
    ///
    /// Hardware bookkeeping bits and unrelated AVAIL bits are dropped.
    pub const fn from_pte(entry: Pte) -> Self {
        Self::from_bits_truncate(entry.bits() & pte::SYSCALL)
    }

    /// Returns `true` if duplication must share this page copy-on-write.
    pub const fn needs_cow(self) -> bool {
        self.intersects(Self::WRITABLE.union(Self::COPY_ON_WRITE))
    }

    /// Downgrades to the shared copy-on-write form installed in both contexts.
    #[must_use]
    pub const fn cow_downgrade(self) -> Self {
        self.difference(Self::WRITABLE).union(Self::COPY_ON_WRITE)
    }

    /// Upgrades to the private writable form installed after a copy.
    #[must_use]
    pub const fn private_copy(self) -> Self {
        self.difference(Self::COPY_ON_WRITE).union(Self::WRITABLE)
    }

    /// Returns `false` when the page is both hardware-writable and marked COW.
    pub const fn is_sound(self) -> bool {
        !self.contains(Self::WRITABLE.union(Self::COPY_ON_WRITE))
    }
}
