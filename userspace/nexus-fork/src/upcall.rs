// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Registration slot read by the upcall entry point.
//!
//! The trampoline enters without any handle on the runtime, so the handler and
//! layout registered through [`crate::Runtime::set_pgfault_handler`] are
//! published here. The slot lives in the context's own data pages and a child
//! inherits it with the rest of its image.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::layout::Layout;

/// Handler address and layout of the calling context, plus a delivery count.
pub(crate) struct UpcallSlot {
    handler: AtomicUsize,
    uxstacktop: AtomicUsize,
    pftemp: AtomicUsize,
    uvpt: AtomicUsize,
    faults: AtomicU64,
}

impl UpcallSlot {
    pub(crate) const fn new() -> Self {
        Self {
            handler: AtomicUsize::new(0),
            uxstacktop: AtomicUsize::new(0),
            pftemp: AtomicUsize::new(0),
            uvpt: AtomicUsize::new(0),
            faults: AtomicU64::new(0),
        }
    }

    /// Replaces the registration. `handler` is the address of a handler function.
    pub(crate) fn publish(&self, handler: usize, layout: &Layout) {
        self.uxstacktop.store(layout.uxstacktop, Ordering::Relaxed);
        self.pftemp.store(layout.pftemp, Ordering::Relaxed);
        self.uvpt.store(layout.uvpt, Ordering::Relaxed);
        self.handler.store(handler, Ordering::Release);
    }

    /// Current registration, `None` until something was published.
    pub(crate) fn load(&self) -> Option<(usize, Layout)> {
        let handler = self.handler.load(Ordering::Acquire);
        if handler == 0 {
            return None;
        }
        let layout = Layout {
            uxstacktop: self.uxstacktop.load(Ordering::Relaxed),
            pftemp: self.pftemp.load(Ordering::Relaxed),
            uvpt: self.uvpt.load(Ordering::Relaxed),
        };
        Some((handler, layout))
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}
