// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: End-to-end fork scenarios against the host kernel model
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: 9 integration tests
//!
//! TEST_SCOPE:
//!   - Parent/child mappings after fork (copy-on-write, read-only, absent)
//!   - Exception stack provisioning for the child
//!   - Abort before the child becomes runnable when a primitive fails
//!   - Child-side identity fixup and repeated forks
//!   - Shared fork rejection
//!
//! TEST_SCENARIOS:
//!   - writable_and_read_only_pages_after_fork(): two-page address space, child writes page 0
//!   - child_exception_stack_is_private(): fresh frame, plain read/write permissions
//!   - tally_counts_pages_and_skipped_regions(): unmapped regions skipped in one step
//!   - failing_primitive_leaves_child_not_runnable(): each failpoint aborts the fork
//!   - exhausted_context_table_is_reported(): exofork failure surfaces with its code
//!   - child_refreshes_cached_identity(): inherited this_env replaced in the child branch
//!   - child_image_predates_the_forks_tally(): tally recorded after the walk stays parent-only
//!   - grandchild_shares_the_childs_private_copy(): fork from a forked child
//!   - sfork_is_rejected_without_side_effects(): invalid-argument, nothing allocated
#![cfg(feature = "std")]

use nexus_fork::host::{HostKernel, HostMachine, Mapping, Primitive};
use nexus_fork::{
    pgfault, ContextId, Error, Forked, Kernel, KernelError, Layout, Perm, RunState, Runtime,
    PAGE_SIZE,
};

const RW: Perm = Perm::PRESENT.union(Perm::USER).union(Perm::WRITABLE);
const RO: Perm = Perm::PRESENT.union(Perm::USER);
const COW: Perm = Perm::PRESENT.union(Perm::USER).union(Perm::COPY_ON_WRITE);

/// Page 0 writable, page 1 read-only, everything else absent.
fn two_page_space() -> (HostMachine, Runtime<HostKernel>) {
    let machine = HostMachine::new(Layout::DEFAULT);
    let mut rt = machine.boot().expect("boot");
    rt.kernel_mut().page_alloc(ContextId::CURRENT, 0, RW).expect("page 0");
    rt.kernel_mut().page_alloc(ContextId::CURRENT, PAGE_SIZE, RW).expect("page 1");
    rt.write(0, b"parent page zero").expect("fill page 0");
    rt.write(PAGE_SIZE, b"read-only page one").expect("fill page 1");
    rt.kernel_mut()
        .page_map(ContextId::CURRENT, PAGE_SIZE, ContextId::CURRENT, PAGE_SIZE, RO)
        .expect("downgrade page 1");
    (machine, rt)
}

fn parent_side(forked: Forked) -> ContextId {
    match forked {
        Forked::Parent(child) => child,
        Forked::Child => panic!("parent observed the child branch"),
    }
}

fn start_child(machine: &HostMachine, parent: &Runtime<HostKernel>, child: ContextId) -> Runtime<HostKernel> {
    let kernel = machine.resume(child).expect("child is runnable");
    let mut rt = machine.inherit(parent, kernel);
    assert_eq!(rt.fork().expect("child branch"), Forked::Child);
    rt
}

#[test]
fn writable_and_read_only_pages_after_fork() {
    let (machine, mut parent) = two_page_space();
    let parent_env = parent.this_env();
    let f0 = machine.lookup(parent_env, 0).expect("page 0").frame;
    let f1 = machine.lookup(parent_env, PAGE_SIZE).expect("page 1").frame;

    let child = parent_side(parent.fork().expect("fork"));
    assert!(child.to_raw() > 0);
    assert_eq!(machine.status(child), Some(RunState::Runnable));

    assert_eq!(machine.lookup(parent_env, 0), Some(Mapping { frame: f0, perm: COW }));
    assert_eq!(machine.lookup(child, 0), Some(Mapping { frame: f0, perm: COW }));
    assert_eq!(machine.lookup(parent_env, PAGE_SIZE), Some(Mapping { frame: f1, perm: RO }));
    assert_eq!(machine.lookup(child, PAGE_SIZE), Some(Mapping { frame: f1, perm: RO }));
    for page in 2..10 {
        assert_eq!(machine.lookup(child, page * PAGE_SIZE), None, "page {page}");
    }

    let mut child_rt = start_child(&machine, &parent, child);
    let allocated = machine.frames_allocated();
    let faults = child_rt.faults_handled();
    child_rt.write(0, b"child").expect("copy-on-write store");
    assert_eq!(child_rt.faults_handled(), faults + 1);
    assert_eq!(machine.frames_allocated(), allocated + 1);

    let copy = machine.lookup(child, 0).expect("child page 0");
    assert_ne!(copy.frame, f0);
    assert_eq!(copy.perm, RW);
    assert_eq!(child_rt.read(0, 16).expect("child read"), b"childt page zero".to_vec());
    assert_eq!(parent.read(0, 16).expect("parent read"), b"parent page zero".to_vec());
    assert_eq!(machine.lookup(parent_env, 0), Some(Mapping { frame: f0, perm: COW }));
    assert_eq!(machine.frame_refs(f0), 1);
    assert_eq!(machine.frame_refs(f1), 2);
}

#[test]
fn child_exception_stack_is_private() {
    let (machine, mut parent) = two_page_space();
    let xstack = Layout::DEFAULT.exception_stack();
    let child = parent_side(parent.fork().expect("fork"));

    let mine = machine.lookup(parent.this_env(), xstack).expect("parent exception stack");
    let theirs = machine.lookup(child, xstack).expect("child exception stack");
    assert_eq!(theirs.perm, Perm::EXCEPTION_STACK);
    assert!(!theirs.perm.contains(Perm::COPY_ON_WRITE));
    assert_ne!(mine.frame, theirs.frame);
    assert_eq!(machine.frame_refs(theirs.frame), 1);
    assert_eq!(machine.upcall(child), Some(parent.kernel().trampoline()));
}

#[test]
fn tally_counts_pages_and_skipped_regions() {
    let (_machine, mut parent) = two_page_space();
    parent_side(parent.fork().expect("fork"));
    let tally = parent.last_tally().expect("tally recorded");
    assert_eq!(tally.cow, 1);
    assert_eq!(tally.shared, 1);
    // 955 regions below the exception stack; region 0 and the exception
    // stack's own region are mapped.
    assert_eq!(tally.regions_skipped, 953);
}

#[test]
fn failing_primitive_leaves_child_not_runnable() {
    for primitive in [Primitive::PageMap, Primitive::PageAlloc, Primitive::SetUpcall, Primitive::SetStatus] {
        let (machine, mut parent) = two_page_space();
        parent.set_pgfault_handler(pgfault::<HostKernel>).expect("handler");
        machine.fail_next(primitive, KernelError::NoMem);

        let err = parent.fork().expect_err("fork must abort");
        assert_eq!(err.code(), -4, "{primitive:?}");
        let matched = match primitive {
            Primitive::PageMap => matches!(err, Error::PageMap { src_va: 0, .. }),
            Primitive::PageAlloc => matches!(err, Error::PageAlloc { .. }),
            Primitive::SetUpcall => matches!(err, Error::SetUpcall { .. }),
            Primitive::SetStatus => matches!(err, Error::SetStatus { .. }),
            _ => false,
        };
        assert!(matched, "{primitive:?}: {err}");

        let contexts = machine.contexts();
        assert_eq!(contexts.len(), 2);
        let child = contexts[1];
        assert_eq!(machine.status(child), Some(RunState::NotRunnable));
        assert_eq!(machine.resume(child).err(), Some(KernelError::BadEnv));
    }
}

#[test]
fn exhausted_context_table_is_reported() {
    let machine = HostMachine::new(Layout::DEFAULT).with_env_limit(1);
    let mut parent = machine.boot().expect("boot");
    let err = parent.fork().expect_err("no free context");
    assert!(matches!(err, Error::Exofork(KernelError::NoFreeEnv)));
    assert_eq!(err.code(), -5);
    assert_eq!(machine.contexts(), vec![parent.this_env()]);
}

#[test]
fn child_refreshes_cached_identity() {
    let (machine, mut parent) = two_page_space();
    let child = parent_side(parent.fork().expect("fork"));

    let kernel = machine.resume(child).expect("child is runnable");
    let mut child_rt = machine.inherit(&parent, kernel);
    assert_eq!(child_rt.this_env(), parent.this_env());
    assert!(child_rt.handler_installed());

    let forked = child_rt.fork().expect("child branch");
    assert!(forked.is_child());
    assert!(forked.envid().is_current());
    assert_eq!(child_rt.this_env(), child);
    assert_eq!(machine.contexts().len(), 2);
}

#[test]
fn child_image_predates_the_forks_tally() {
    let (machine, mut parent) = two_page_space();
    let first = parent_side(parent.fork().expect("first fork"));
    let first_tally = parent.last_tally().expect("first tally");
    let first_rt = start_child(&machine, &parent, first);
    assert_eq!(first_rt.last_tally(), None);

    parent.kernel_mut().page_alloc(ContextId::CURRENT, 2 * PAGE_SIZE, RW).expect("page 2");
    let second = parent_side(parent.fork().expect("second fork"));
    let second_tally = parent.last_tally().expect("second tally");
    assert_eq!(second_tally.cow, first_tally.cow + 1);
    let second_rt = start_child(&machine, &parent, second);
    assert_eq!(second_rt.last_tally(), Some(first_tally));
}

#[test]
fn grandchild_shares_the_childs_private_copy() {
    let (machine, mut parent) = two_page_space();
    let child = parent_side(parent.fork().expect("fork"));
    let mut child_rt = start_child(&machine, &parent, child);
    child_rt.write(0, b"CHILD").expect("child store");
    let private = machine.lookup(child, 0).expect("child page 0").frame;

    let grandchild = parent_side(child_rt.fork().expect("second fork"));
    assert_eq!(machine.lookup(child, 0), Some(Mapping { frame: private, perm: COW }));
    assert_eq!(machine.lookup(grandchild, 0), Some(Mapping { frame: private, perm: COW }));

    let mut grand_rt = start_child(&machine, &child_rt, grandchild);
    assert_eq!(grand_rt.this_env(), grandchild);
    grand_rt.write(5, b"!").expect("grandchild store");
    assert_eq!(grand_rt.read(0, 6).expect("grandchild read"), b"CHILD!".to_vec());
    assert_eq!(child_rt.read(0, 6).expect("child read"), b"CHILDt".to_vec());
    assert_eq!(parent.read(0, 6).expect("parent read"), b"parent".to_vec());
}

#[test]
fn sfork_is_rejected_without_side_effects() {
    let (machine, mut parent) = two_page_space();
    let frames = machine.frames_in_use();
    let err = parent.sfork().expect_err("unsupported");
    assert!(matches!(err, Error::Unsupported));
    assert_eq!(err.code(), -3);
    assert!(!parent.handler_installed());
    assert_eq!(machine.frames_in_use(), frames);
    assert_eq!(machine.contexts().len(), 1);
}
