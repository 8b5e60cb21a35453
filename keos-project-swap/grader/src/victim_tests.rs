//! Victim process and victim page selection policy.

use crate::harness;
use keos::{
    addressing::Va,
    mm::page_table::PteFlags,
};
use keos_project_swap::{
    process::{ProcessState, ProcessTask},
    pte, victim,
};

/// Among two equally loaded runnable processes, the smaller pid wins.
pub fn smaller_pid_breaks_rss_tie() {
    let a = ProcessTask::default();
    let b = ProcessTask::default();
    assert!(a.0.pid < b.0.pid);

    a.0.rss_inc();
    b.0.rss_inc();

    assert_eq!(victim::pick_victim_process(), Some(a.0.pid));
}

/// A process carrying resident pages but already exiting is never picked.
pub fn no_runnable_process_yields_none() {
    let task = ProcessTask::default();
    task.0.rss_inc();
    {
        let mut guard = task.0.state.lock();
        *guard = ProcessState::Exiting;
        guard.unlock();
    }
    assert_eq!(victim::pick_victim_process(), None);
}

/// The clock sweep prefers an unaccessed page without disturbing other
/// pages' accessed bits; only once every present page has been seen does it
/// clear every accessed bit and restart.
pub fn second_chance_clears_accessed_bit() {
    let task = ProcessTask::default();
    let proc = &task.0;
    let va1 = Va::new(0x10_0000).unwrap();
    let va2 = Va::new(0x20_0000).unwrap();
    let pa1 = proc.with_pgdir(|root| harness::map_present(root, va1, PteFlags::RW | PteFlags::US, 1));
    let pa2 = proc.with_pgdir(|root| harness::map_present(root, va2, PteFlags::RW | PteFlags::US, 2));
    proc.rss_inc();
    proc.rss_inc();

    proc.with_pgdir(|root| {
        let pte = pte::walk_mut(root, va1).expect("mapped above");
        unsafe {
            let flags = pte.flags() | PteFlags::A;
            pte.set_flags(flags);
        }
    });

    let (va, pa) = victim::pick_victim_page(proc).expect("two present user pages");
    assert_eq!(va, va2);
    assert_eq!(pa, pa2);
    proc.with_pgdir(|root| {
        let pte = pte::walk(root, va1).expect("mapped above");
        assert!(pte.flags().contains(PteFlags::A));
    });

    proc.with_pgdir(|root| {
        let pte = pte::walk_mut(root, va2).expect("mapped above");
        unsafe {
            let flags = pte.flags() | PteFlags::A;
            pte.set_flags(flags);
        }
    });

    let (va, pa) = victim::pick_victim_page(proc).expect("two present user pages");
    assert_eq!(va, va1);
    assert_eq!(pa, pa1);
    proc.with_pgdir(|root| {
        for va in [va1, va2] {
            let pte = pte::walk(root, va).expect("mapped above");
            assert!(!pte.flags().contains(PteFlags::A));
        }
    });

    proc.with_pgdir(|root| unsafe {
        harness::unmap_present(root, va1);
        harness::unmap_present(root, va2);
    });
    proc.rss_dec();
    proc.rss_dec();
}
