//! Selecting what to evict.
//!
//! Two independent choices, each made without consulting the other: which
//! process gives up a page ([`pick_victim_process`]), and which of that
//! process's pages it gives up ([`pick_victim_page`]). The process policy
//! mirrors the original pager's `findproc()` exactly, including its
//! tie-break; the page policy is a textbook two-pass clock sweep over the
//! process's user-space mappings.

use crate::process::{Pid, Process, ProcessState, ProcessTable};
use keos::{
    addressing::{Pa, Va},
    mm::page_table::{PageTableRoot, PteFlags, tlb_shutdown},
};

/// Picks the live process with the largest resident set, preferring the
/// smaller pid on a tie.
///
/// Processes with `pid < 1` (none exist in this table, but the check is
/// kept to mirror the source policy literally) are skipped outright.
/// Exiting processes are skipped too: there is nothing to evict from a
/// process already tearing down.
pub fn pick_victim_process() -> Option<Pid> {
    let mut victim: Option<(Pid, usize)> = None;
    ProcessTable::for_each(|proc| {
        let guard = proc.state.lock();
        let runnable = *guard == ProcessState::Runnable;
        guard.unlock();
        if proc.pid < 1 || !runnable {
            return;
        }
        let rss = proc.rss();
        let max_rss = victim.map_or(0, |(_, r)| r);
        let take = match victim {
            None => rss > 0,
            Some((vpid, _)) => rss > max_rss || (rss == max_rss && proc.pid < vpid),
        };
        if take {
            victim = Some((proc.pid, rss));
        }
    });
    victim.map(|(pid, _)| pid)
}

fn for_each_user_pte(root: &mut PageTableRoot, mut f: impl FnMut(Va, &mut keos::mm::page_table::Pte) -> bool) -> bool {
    for pml4i in 0..PageTableRoot::KBASE {
        let Ok(pdp) = root[pml4i].into_pdp_mut() else {
            continue;
        };
        for pdpti in 0..512 {
            let Ok(pd) = pdp[pdpti].into_pd_mut() else {
                continue;
            };
            for pdei in 0..512 {
                let Ok(pt) = pd[pdei].into_pt_mut() else {
                    continue;
                };
                for ptei in 0..512 {
                    let pte = &mut pt[ptei];
                    if pte.flags().contains(PteFlags::P) && pte.flags().contains(PteFlags::US) {
                        let addr = (pml4i << 39) | (pdpti << 30) | (pdei << 21) | (ptei << 12);
                        let va = Va::new(addr).expect("user pml4 index yields a valid Va");
                        if f(va, pte) {
                            return true;
                        }
                    }
                }
            }
        }
    }
    false
}

/// Picks a page to evict from `proc`'s address space via second-chance
/// clock: a first pass looks for a present, user, unaccessed page in
/// ascending virtual-address order; if every present user page has been
/// accessed since the last sweep, every accessed bit is cleared, the TLB is
/// flushed once, and a second pass takes the first present user page
/// unconditionally.
///
/// Returns `None` if `proc` has no present user mappings at all.
pub fn pick_victim_page(proc: &Process) -> Option<(Va, Pa)> {
    proc.with_pgdir(|root| {
        let mut found = None;
        let hit = for_each_user_pte(root, |va, pte| {
            if !pte.flags().contains(PteFlags::A) {
                found = Some((va, pte.pa().expect("present entry has a frame")));
                true
            } else {
                false
            }
        });
        if hit {
            return found;
        }

        for_each_user_pte(root, |_va, pte| {
            unsafe {
                let cleared = pte.flags() & !PteFlags::A;
                pte.set_flags(cleared);
            }
            false
        });
        tlb_shutdown(root);

        for_each_user_pte(root, |va, pte| {
            found = Some((va, pte.pa().expect("present entry has a frame")));
            true
        });
        found
    })
}
