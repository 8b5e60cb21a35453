//! End-to-end eviction, fault-in, fork and exit-cleanup behavior.

use crate::harness;
use alloc::vec::Vec;
use keos::{
    KernelError,
    addressing::Va,
    mm::{Page, page_table::{Pte, PteFlags}},
};
use keos_project_swap::{
    controller, page_io,
    process::ProcessTask,
    pte::{self, PteState},
    slot, swap_page_in, swap_page_out, swap_out,
};

/// Evicting a present page and then faulting it back in restores its exact
/// contents and re-accounts it against the process's resident set.
pub fn evict_then_fault_in_round_trip() {
    let task = ProcessTask::default();
    let proc = &task.0;
    let va = Va::new(0x50_0000).unwrap();
    let pa = proc.with_pgdir(|root| harness::map_present(root, va, PteFlags::RW | PteFlags::US, 0xab));
    proc.rss_inc();

    swap_page_out(proc, va, pa).expect("evicting a present page succeeds");
    proc.rss_dec();
    unsafe {
        drop(Page::from_pa(pa));
    }
    proc.with_pgdir(|root| {
        let pte = pte::walk(root, va).expect("entry still exists, now swapped");
        assert!(matches!(pte::decode_state(pte), PteState::Swapped(_)));
    });

    swap_page_in(proc, va).expect("faulting a swapped page back in succeeds");
    assert_eq!(proc.rss(), 1);
    let new_pa = proc.with_pgdir(|root| {
        let pte = pte::walk(root, va).expect("entry present again");
        assert_eq!(pte::decode_state(pte), PteState::Present);
        pte.pa().expect("present entry has a frame")
    });
    let content = harness::read_page(new_pa);
    assert!(content.iter().all(|&b| b == 0xab));

    proc.with_pgdir(|root| unsafe { harness::unmap_present(root, va) });
    proc.rss_dec();
}

/// Faulting in a virtual address with no mapping at all is an error, not a
/// silent no-op: a missing PTE means the access itself was invalid.
pub fn fault_in_absent_pte_is_error() {
    let task = ProcessTask::default();
    let proc = &task.0;
    let va = Va::new(0x60_0000).unwrap();
    assert_eq!(swap_page_in(proc, va), Err(KernelError::InvalidArgument));
}

/// `swap_out` evicts exactly the controller's current batch size when enough
/// victim pages exist, always the lowest-addressed unaccessed pages first.
pub fn batch_eviction_respects_current_batch_size() {
    let task = ProcessTask::default();
    let proc = &task.0;
    let batch = controller::batch();
    let total = batch + 2;

    let vas: Vec<Va> = (0..total)
        .map(|i| Va::new(0x70_0000 + i * 0x1000).unwrap())
        .collect();
    for &va in &vas {
        proc.with_pgdir(|root| harness::map_present(root, va, PteFlags::RW | PteFlags::US, 0x11));
        proc.rss_inc();
    }

    let evicted = swap_out(proc);
    assert_eq!(evicted, batch);
    assert_eq!(proc.rss(), total - batch);

    proc.with_pgdir(|root| {
        for (i, &va) in vas.iter().enumerate() {
            let pte = pte::walk(root, va).expect("still mapped, present or swapped");
            let state = pte::decode_state(pte);
            if i < batch {
                assert!(matches!(state, PteState::Swapped(_)), "page {i} should be evicted");
            } else {
                assert_eq!(state, PteState::Present, "page {i} should still be resident");
            }
        }
    });

    proc.with_pgdir(|root| {
        for &va in vas.iter().skip(batch) {
            unsafe { harness::unmap_present(root, va) };
        }
    });
    for _ in batch..total {
        proc.rss_dec();
    }
}

/// With free frames well above the low-water mark, triggering the controller
/// does not perturb its tunables — adaptation is conditioned on pressure,
/// not on being called.
pub fn controller_noop_when_frames_plentiful() {
    let (before_threshold, before_batch) = (controller::threshold(), controller::batch());
    controller::maybe_swap();
    assert_eq!(controller::threshold(), before_threshold);
    assert_eq!(controller::batch(), before_batch);
}

/// Exiting a process (dropping its [`ProcessTask`]) releases every swap slot
/// it still held.
pub fn exit_cleanup_releases_slots() {
    let baseline = slot::used_count();
    {
        let task = ProcessTask::default();
        let proc = &task.0;
        let va = Va::new(0x80_0000).unwrap();
        let pa = proc.with_pgdir(|root| harness::map_present(root, va, PteFlags::RW | PteFlags::US, 3));
        proc.rss_inc();
        swap_page_out(proc, va, pa).expect("evict succeeds");
        proc.rss_dec();
        unsafe {
            drop(Page::from_pa(pa));
        }
        assert_eq!(slot::used_count(), baseline + 1);
    }
    assert_eq!(slot::used_count(), baseline);
}

/// Forking a process with a swapped page gives the child its own copy of the
/// backing slot instead of sharing the parent's.
pub fn fork_duplicates_swapped_slot() {
    let baseline = slot::used_count();
    let parent_task = ProcessTask::default();
    let parent = &parent_task.0;
    let va = Va::new(0x90_0000).unwrap();
    let pa = parent.with_pgdir(|root| harness::map_present(root, va, PteFlags::RW | PteFlags::US, 5));
    parent.rss_inc();
    swap_page_out(parent, va, pa).expect("evict succeeds");
    parent.rss_dec();
    unsafe {
        drop(Page::from_pa(pa));
    }

    let parent_raw = parent.with_pgdir(|root| pte::walk(root, va).expect("swapped").0);
    let parent_slot = match pte::decode_state(&Pte(parent_raw)) {
        PteState::Swapped(i) => i,
        other => panic!("expected a swapped entry, got {other:?}"),
    };

    let child_task = ProcessTask::default();
    let child = &child_task.0;
    child.with_pgdir(|root| harness::install_raw(root, va, parent_raw));

    keos_project_swap::on_fork(parent, child);

    let child_raw = child.with_pgdir(|root| pte::walk(root, va).expect("still swapped").0);
    let child_slot = match pte::decode_state(&Pte(child_raw)) {
        PteState::Swapped(i) => i,
        other => panic!("expected a swapped entry, got {other:?}"),
    };
    assert_ne!(child_slot, parent_slot);
    assert_eq!(slot::used_count(), baseline + 2);

    let mut parent_contents = Page::new();
    page_io::read_page_from_slot(parent_slot, parent_contents.pa());
    let mut child_contents = Page::new();
    page_io::read_page_from_slot(child_slot, child_contents.pa());
    assert_eq!(parent_contents.inner_mut(), child_contents.inner_mut());

    drop(child_task);
    drop(parent_task);
    assert_eq!(slot::used_count(), baseline);
}
