// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-memory exokernel used to exercise the fork protocol on the host
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! [`HostMachine`] owns frames and contexts behind a shared lock. Each
//! [`HostKernel`] is one context's view of it. The model enforces the kernel
//! contracts the protocol relies on:
//!   - only page-aligned user addresses below `uxstacktop` can be mapped
//!   - permissions must include present and user, and a writable mapping
//!     cannot be made from a source that is not writable
//!   - a frame lives as long as something maps it
//!   - faults are delivered only to contexts with an upcall and a writable
//!     exception stack; anything else destroys the context
//!   - a child first runs once it is runnable, and its first `exofork`
//!     returns [`Forked::Child`]

use std::{collections::BTreeMap, sync::Arc};

use nexus_abi::{
    page_number, page_round_down, ContextId, FaultCode, KernelError, Pte, RunState,
    UTrapframe, UpcallEntry, PAGES_PER_REGION, PAGE_SIZE,
};
use parking_lot::Mutex;

use crate::{fork::Forked, kernel::Kernel, layout::Layout, perm::Perm, runtime::Runtime, Error, Result};

/// Upcall address the host model hands out for the trampoline.
pub const HOST_TRAMPOLINE: UpcallEntry = UpcallEntry(0x0080_0000);

const FIRST_ENV: u32 = 0x1000;
const DEFAULT_FRAME_LIMIT: usize = 1 << 16;
const DEFAULT_ENV_LIMIT: usize = 1024;

/// Kernel primitive selected by a failpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Primitive {
    /// Context creation.
    Exofork,
    /// Frame allocation.
    PageAlloc,
    /// Frame sharing.
    PageMap,
    /// Unmapping.
    PageUnmap,
    /// Upcall binding.
    SetUpcall,
    /// Run-state transition.
    SetStatus,
}

/// One page-table entry of the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Backing frame number.
    pub frame: u32,
    /// Installed permissions.
    pub perm: Perm,
}

struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    refs: usize,
}

struct Context {
    parent: Option<ContextId>,
    pages: BTreeMap<usize, Mapping>,
    status: RunState,
    upcall: Option<UpcallEntry>,
    resume_in_exofork: bool,
}

impl Context {
    fn new(parent: Option<ContextId>, status: RunState) -> Self {
        Self { parent, pages: BTreeMap::new(), status, upcall: None, resume_in_exofork: false }
    }
}

struct Machine {
    layout: Layout,
    frames: BTreeMap<u32, Frame>,
    next_frame: u32,
    frames_allocated: u64,
    frame_limit: usize,
    contexts: BTreeMap<ContextId, Context>,
    next_env: u32,
    env_limit: usize,
    failpoints: Vec<(Primitive, KernelError)>,
}

impl Machine {
    fn fail(&mut self, primitive: Primitive) -> core::result::Result<(), KernelError> {
        match self.failpoints.iter().position(|(p, _)| *p == primitive) {
            Some(idx) => Err(self.failpoints.remove(idx).1),
            None => Ok(()),
        }
    }

    fn create(&mut self, parent: Option<ContextId>, status: RunState) -> core::result::Result<ContextId, KernelError> {
        if self.contexts.len() >= self.env_limit {
            return Err(KernelError::NoFreeEnv);
        }
        let id = ContextId::from_raw(self.next_env);
        self.next_env += 1;
        self.contexts.insert(id, Context::new(parent, status));
        Ok(id)
    }

    /// Resolves `env` as seen by `caller`: itself or one of its children.
    fn resolve(&self, caller: ContextId, env: ContextId) -> core::result::Result<ContextId, KernelError> {
        let env = if env.is_current() { caller } else { env };
        match self.contexts.get(&env) {
            Some(ctx) if env == caller || ctx.parent == Some(caller) => Ok(env),
            _ => Err(KernelError::BadEnv),
        }
    }

    fn check_va(&self, va: usize) -> core::result::Result<usize, KernelError> {
        if va >= self.layout.uxstacktop || va % PAGE_SIZE != 0 {
            return Err(KernelError::Invalid);
        }
        Ok(page_number(va))
    }

    fn alloc_frame(&mut self) -> core::result::Result<u32, KernelError> {
        if self.frames.len() >= self.frame_limit {
            return Err(KernelError::NoMem);
        }
        let frame = self.next_frame;
        self.next_frame += 1;
        self.frames_allocated += 1;
        self.frames.insert(frame, Frame { data: Box::new([0; PAGE_SIZE]), refs: 0 });
        Ok(frame)
    }

    fn release(&mut self, frame: u32) {
        if let Some(entry) = self.frames.get_mut(&frame) {
            entry.refs -= 1;
            if entry.refs == 0 {
                self.frames.remove(&frame);
            }
        }
    }

    fn install(&mut self, env: ContextId, vpn: usize, mapping: Mapping) {
        if let Some(entry) = self.frames.get_mut(&mapping.frame) {
            entry.refs += 1;
        }
        let old = self.contexts.get_mut(&env).and_then(|ctx| ctx.pages.insert(vpn, mapping));
        if let Some(old) = old {
            self.release(old.frame);
        }
    }

    fn remove(&mut self, env: ContextId, vpn: usize) {
        let old = self.contexts.get_mut(&env).and_then(|ctx| ctx.pages.remove(&vpn));
        if let Some(old) = old {
            self.release(old.frame);
        }
    }

    fn mapping(&self, env: ContextId, vpn: usize) -> Option<Mapping> {
        self.contexts.get(&env).and_then(|ctx| ctx.pages.get(&vpn).copied())
    }

    fn destroy(&mut self, env: ContextId) {
        if let Some(ctx) = self.contexts.remove(&env) {
            for mapping in ctx.pages.into_values() {
                self.release(mapping.frame);
            }
        }
    }

    /// Checks a user access; returns the fault code the trap path would push.
    fn check_access(&self, env: ContextId, va: usize, write: bool) -> core::result::Result<Mapping, FaultCode> {
        let mut code = FaultCode::USER;
        if write {
            code |= FaultCode::WRITE;
        }
        match self.mapping(env, page_number(va)) {
            Some(mapping) if mapping.perm.contains(Perm::USER) => {
                if write && !mapping.perm.contains(Perm::WRITABLE) {
                    Err(code | FaultCode::PROTECTION)
                } else {
                    Ok(mapping)
                }
            }
            Some(_) => Err(code | FaultCode::PROTECTION),
            None => Err(code),
        }
    }

    fn can_deliver(&self, env: ContextId) -> bool {
        let Some(ctx) = self.contexts.get(&env) else {
            return false;
        };
        let xstack = ctx.pages.get(&page_number(self.layout.exception_stack()));
        ctx.upcall.is_some() && xstack.is_some_and(|m| m.perm.contains(Perm::EXCEPTION_STACK))
    }
}

/// Shared in-memory exokernel.
#[derive(Clone)]
pub struct HostMachine {
    inner: Arc<Mutex<Machine>>,
}

impl HostMachine {
    /// Creates an empty machine for `layout`.
    pub fn new(layout: Layout) -> Self {
        let machine = Machine {
            layout,
            frames: BTreeMap::new(),
            next_frame: 1,
            frames_allocated: 0,
            frame_limit: DEFAULT_FRAME_LIMIT,
            contexts: BTreeMap::new(),
            next_env: FIRST_ENV,
            env_limit: DEFAULT_ENV_LIMIT,
            failpoints: Vec::new(),
        };
        Self { inner: Arc::new(Mutex::new(machine)) }
    }

    /// Caps the number of frames alive at once.
    #[must_use]
    pub fn with_frame_limit(self, limit: usize) -> Self {
        self.inner.lock().frame_limit = limit;
        self
    }

    /// Caps the number of contexts alive at once.
    #[must_use]
    pub fn with_env_limit(self, limit: usize) -> Self {
        self.inner.lock().env_limit = limit;
        self
    }

    /// Makes the next call to `primitive`, from any context, fail with `err`.
    pub fn fail_next(&self, primitive: Primitive, err: KernelError) {
        self.inner.lock().failpoints.push((primitive, err));
    }

    /// Creates a runnable root context and returns its runtime.
    pub fn boot(&self) -> Result<Runtime<HostKernel>> {
        let (env, layout) = {
            let mut machine = self.inner.lock();
            let env = machine.create(None, RunState::Runnable).map_err(Error::Exofork)?;
            (env, machine.layout)
        };
        log::debug!("host: booted {env}");
        Runtime::new(HostKernel { machine: self.clone(), env, resume_in_exofork: false }, layout)
    }

    /// Schedules `env` for the first time and returns its kernel view.
    ///
    /// Fails with [`KernelError::BadEnv`] unless the context is runnable. A
    /// context created by `exofork` resumes inside that call.
    pub fn resume(&self, env: ContextId) -> core::result::Result<HostKernel, KernelError> {
        let mut machine = self.inner.lock();
        let ctx = machine.contexts.get_mut(&env).ok_or(KernelError::BadEnv)?;
        if ctx.status != RunState::Runnable {
            return Err(KernelError::BadEnv);
        }
        let resume_in_exofork = core::mem::take(&mut ctx.resume_in_exofork);
        Ok(HostKernel { machine: self.clone(), env, resume_in_exofork })
    }

    /// Builds the child's copy of `parent`'s runtime image around `kernel`.
    pub fn inherit(&self, parent: &Runtime<HostKernel>, kernel: HostKernel) -> Runtime<HostKernel> {
        parent.image_for(kernel)
    }

    /// Mapping of `va` in `env`, if any.
    pub fn lookup(&self, env: ContextId, va: usize) -> Option<Mapping> {
        self.inner.lock().mapping(env, page_number(va))
    }

    /// Every mapping of `env` as `(va, mapping)` in ascending order.
    pub fn mappings(&self, env: ContextId) -> Vec<(usize, Mapping)> {
        let machine = self.inner.lock();
        machine
            .contexts
            .get(&env)
            .map(|ctx| ctx.pages.iter().map(|(vpn, m)| (vpn * PAGE_SIZE, *m)).collect())
            .unwrap_or_default()
    }

    /// Run state of `env`, or `None` once it is destroyed.
    pub fn status(&self, env: ContextId) -> Option<RunState> {
        self.inner.lock().contexts.get(&env).map(|ctx| ctx.status)
    }

    /// Upcall bound in `env`.
    pub fn upcall(&self, env: ContextId) -> Option<UpcallEntry> {
        self.inner.lock().contexts.get(&env).and_then(|ctx| ctx.upcall)
    }

    /// Live contexts in creation order.
    pub fn contexts(&self) -> Vec<ContextId> {
        self.inner.lock().contexts.keys().copied().collect()
    }

    /// Number of mappings referencing `frame`.
    pub fn frame_refs(&self, frame: u32) -> usize {
        self.inner.lock().frames.get(&frame).map_or(0, |f| f.refs)
    }

    /// Frames currently alive.
    pub fn frames_in_use(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Frames allocated since the machine was created.
    pub fn frames_allocated(&self) -> u64 {
        self.inner.lock().frames_allocated
    }
}

/// One context's view of a [`HostMachine`].
pub struct HostKernel {
    machine: HostMachine,
    env: ContextId,
    resume_in_exofork: bool,
}

impl HostKernel {
    /// Machine this view belongs to.
    pub fn machine(&self) -> &HostMachine {
        &self.machine
    }
}

impl Kernel for HostKernel {
    fn getenvid(&self) -> ContextId {
        self.env
    }

    fn exofork(&mut self) -> core::result::Result<Forked, KernelError> {
        if core::mem::take(&mut self.resume_in_exofork) {
            return Ok(Forked::Child);
        }
        let mut machine = self.machine.inner.lock();
        machine.fail(Primitive::Exofork)?;
        let child = machine.create(Some(self.env), RunState::NotRunnable)?;
        if let Some(ctx) = machine.contexts.get_mut(&child) {
            ctx.resume_in_exofork = true;
        }
        Ok(Forked::Parent(child))
    }

    fn page_alloc(&mut self, env: ContextId, va: usize, perm: Perm) -> core::result::Result<(), KernelError> {
        let mut machine = self.machine.inner.lock();
        machine.fail(Primitive::PageAlloc)?;
        let env = machine.resolve(self.env, env)?;
        let vpn = machine.check_va(va)?;
        check_perm(perm)?;
        let frame = machine.alloc_frame()?;
        machine.install(env, vpn, Mapping { frame, perm });
        Ok(())
    }

    fn page_map(
        &mut self,
        src_env: ContextId,
        src_va: usize,
        dst_env: ContextId,
        dst_va: usize,
        perm: Perm,
    ) -> core::result::Result<(), KernelError> {
        let mut machine = self.machine.inner.lock();
        machine.fail(Primitive::PageMap)?;
        let src_env = machine.resolve(self.env, src_env)?;
        let dst_env = machine.resolve(self.env, dst_env)?;
        let src_vpn = machine.check_va(src_va)?;
        let dst_vpn = machine.check_va(dst_va)?;
        check_perm(perm)?;
        let src = machine.mapping(src_env, src_vpn).ok_or(KernelError::Invalid)?;
        if perm.contains(Perm::WRITABLE) && !src.perm.contains(Perm::WRITABLE) {
            return Err(KernelError::Invalid);
        }
        machine.install(dst_env, dst_vpn, Mapping { frame: src.frame, perm });
        Ok(())
    }

    fn page_unmap(&mut self, env: ContextId, va: usize) -> core::result::Result<(), KernelError> {
        let mut machine = self.machine.inner.lock();
        machine.fail(Primitive::PageUnmap)?;
        let env = machine.resolve(self.env, env)?;
        let vpn = machine.check_va(va)?;
        machine.remove(env, vpn);
        Ok(())
    }

    fn set_pgfault_upcall(&mut self, env: ContextId, entry: UpcallEntry) -> core::result::Result<(), KernelError> {
        let mut machine = self.machine.inner.lock();
        machine.fail(Primitive::SetUpcall)?;
        let env = machine.resolve(self.env, env)?;
        if let Some(ctx) = machine.contexts.get_mut(&env) {
            ctx.upcall = Some(entry);
        }
        Ok(())
    }

    fn set_status(&mut self, env: ContextId, status: RunState) -> core::result::Result<(), KernelError> {
        let mut machine = self.machine.inner.lock();
        machine.fail(Primitive::SetStatus)?;
        let env = machine.resolve(self.env, env)?;
        if !matches!(status, RunState::Runnable | RunState::NotRunnable) {
            return Err(KernelError::Invalid);
        }
        if let Some(ctx) = machine.contexts.get_mut(&env) {
            ctx.status = status;
        }
        Ok(())
    }

    fn trampoline(&self) -> UpcallEntry {
        HOST_TRAMPOLINE
    }

    fn pde(&self, region: usize) -> Pte {
        let machine = self.machine.inner.lock();
        let first = region * PAGES_PER_REGION;
        let mapped = machine
            .contexts
            .get(&self.env)
            .is_some_and(|ctx| ctx.pages.range(first..first + PAGES_PER_REGION).next().is_some());
        if mapped {
            Pte::new(region as u32, Perm::EXCEPTION_STACK.bits())
        } else {
            Pte::EMPTY
        }
    }

    fn pte(&self, vpn: usize) -> Pte {
        match self.machine.inner.lock().mapping(self.env, vpn) {
            Some(mapping) => Pte::new(mapping.frame, mapping.perm.bits()),
            None => Pte::EMPTY,
        }
    }

    fn copy_page(&mut self, dst_va: usize, src_va: usize) -> core::result::Result<(), KernelError> {
        let mut machine = self.machine.inner.lock();
        let src = machine.mapping(self.env, page_number(src_va)).ok_or(KernelError::Fault)?;
        let dst = machine.mapping(self.env, page_number(dst_va)).ok_or(KernelError::Fault)?;
        if !dst.perm.contains(Perm::WRITABLE) {
            return Err(KernelError::Fault);
        }
        let data = machine.frames.get(&src.frame).map(|f| *f.data).ok_or(KernelError::Fault)?;
        if let Some(frame) = machine.frames.get_mut(&dst.frame) {
            *frame.data = data;
        }
        Ok(())
    }
}

fn check_perm(perm: Perm) -> core::result::Result<(), KernelError> {
    if perm.contains(Perm::PRESENT | Perm::USER) {
        Ok(())
    } else {
        Err(KernelError::Invalid)
    }
}

impl Runtime<HostKernel> {
    /// Stores `bytes` at `va` as a user-mode write.
    ///
    /// Protection faults go through the kernel's delivery rules and then
    /// [`Runtime::dispatch`]; an undeliverable fault destroys the context.
    pub fn write(&mut self, va: usize, bytes: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < bytes.len() {
            let addr = va + done;
            let len = (PAGE_SIZE - addr % PAGE_SIZE).min(bytes.len() - done);
            let mapping = self.access(addr, true)?;
            let mut machine = self.kernel.machine.inner.lock();
            if let Some(frame) = machine.frames.get_mut(&mapping.frame) {
                let offset = addr % PAGE_SIZE;
                frame.data[offset..offset + len].copy_from_slice(&bytes[done..done + len]);
            }
            done += len;
        }
        Ok(())
    }

    /// Loads `len` bytes from `va` as a user-mode read.
    pub fn read(&mut self, va: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let addr = va + out.len();
            let chunk = (PAGE_SIZE - addr % PAGE_SIZE).min(len - out.len());
            let mapping = self.access(addr, false)?;
            let machine = self.kernel.machine.inner.lock();
            if let Some(frame) = machine.frames.get(&mapping.frame) {
                let offset = addr % PAGE_SIZE;
                out.extend_from_slice(&frame.data[offset..offset + chunk]);
            }
        }
        Ok(out)
    }

    fn access(&mut self, va: usize, write: bool) -> Result<Mapping> {
        let env = self.kernel.env;
        let mut delivered = false;
        loop {
            let access = self.kernel.machine.inner.lock().check_access(env, va, write);
            let err = match access {
                Ok(mapping) => return Ok(mapping),
                Err(err) => err,
            };
            let deliverable = !delivered && self.kernel.machine.inner.lock().can_deliver(env);
            if !deliverable {
                self.kernel.machine.inner.lock().destroy(env);
                log::debug!("host: {env} killed by fault at {va:#x} (err {:#x})", err.bits());
                return Err(Error::Killed { env, va: page_round_down(va) });
            }
            self.dispatch(&UTrapframe::new(va, err))?;
            delivered = true;
        }
    }
}
