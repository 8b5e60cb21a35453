//! Eviction, fault-in, and the adaptive controller tying both to memory
//! pressure.
//!
//! The controller's tunables (`threshold`, `batch`) are a single
//! process-wide singleton, mirroring the slot table's own
//! `SpinLock`-protected static.

use crate::{
    config, page_io,
    process::Process,
    pte::{self, PteState},
    slot, victim,
};
use alloc::vec::Vec;
use keos::{
    KernelError,
    addressing::{Pa, Va},
    mm::{
        free_frame_count,
        page_table::{PageTableRoot, Pte, PteFlags, tlb_shutdown},
    },
    sync::SpinLock,
};

struct Tunables {
    threshold: usize,
    batch: usize,
}

static TUNABLES: SpinLock<Tunables> = SpinLock::new(Tunables {
    threshold: config::THRESHOLD,
    batch: config::BATCH,
});

/// Current free-frame low-water mark. Monotonically non-increasing across
/// the lifetime of the system (see the controller's adaptation policy).
pub fn threshold() -> usize {
    let guard = TUNABLES.lock();
    let t = guard.threshold;
    guard.unlock();
    t
}

/// Current per-trigger eviction batch size. Monotonically non-decreasing
/// across the lifetime of the system.
pub fn batch() -> usize {
    let guard = TUNABLES.lock();
    let b = guard.batch;
    guard.unlock();
    b
}

/// Runs `op`; on failure, calls [`maybe_swap`] and retries, up to
/// `max_retries` times total.
///
/// Shared by [`crate::slot::duplicate`] (two retries) and
/// [`swap_page_in`] (one retry).
pub fn retry_under_pressure<T>(op: impl Fn() -> Option<T>, max_retries: usize) -> Option<T> {
    if let Some(v) = op() {
        return Some(v);
    }
    for _ in 0..max_retries {
        maybe_swap();
        if let Some(v) = op() {
            return Some(v);
        }
    }
    None
}

fn for_each_leaf(root: &mut PageTableRoot, mut f: impl FnMut(Va, &mut Pte)) {
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
                    let addr = (pml4i << 39) | (pdpti << 30) | (pdei << 21) | (ptei << 12);
                    let va = Va::new(addr).expect("user pml4 index yields a valid Va");
                    f(va, &mut pt[ptei]);
                }
            }
        }
    }
}

/// Evicts the present page at `(va, pa)` in `proc`'s address space to a
/// freshly allocated swap slot.
///
/// `pa` must be the frame currently mapped at `va`; the caller (`swap_out`)
/// obtains it from [`victim::pick_victim_page`] in the same pass, so it
/// cannot have gone stale under the process-local page-directory access
/// this subsystem assumes (see the concurrency notes on the crate).
pub fn swap_page_out(proc: &Process, va: Va, pa: Pa) -> Result<(), KernelError> {
    let i = slot::allocate().ok_or(KernelError::NoSpace)?;
    let result = proc.with_pgdir(|root| -> Result<(), KernelError> {
        let pte = pte::walk_mut(root, va)?;
        if pte::decode_state(pte) != PteState::Present {
            return Err(KernelError::InvalidArgument);
        }
        let old_flags = pte.flags();
        slot::set_perm(i, (old_flags.bits() & 0xfff) as u16);
        page_io::write_page_to_slot(i, pa);
        pte.0 = pte::encode_swapped(old_flags, i);
        tlb_shutdown(root);
        Ok(())
    });
    if result.is_err() {
        slot::release(i);
    }
    result
}

/// Evicts up to the controller's current `batch` size from `proc`, stopping
/// early once victim pages run out or twice the batch size has been
/// attempted. Returns the number of pages actually evicted.
pub fn swap_out(proc: &Process) -> usize {
    let guard = TUNABLES.lock();
    let batch = guard.batch;
    guard.unlock();

    let mut successes = 0;
    let mut attempts = 0;
    while successes < batch && attempts < 2 * batch {
        let Some((va, pa)) = victim::pick_victim_page(proc) else {
            break;
        };
        attempts += 1;
        if swap_page_out(proc, va, pa).is_ok() {
            proc.rss_dec();
            unsafe {
                drop(keos::mm::Page::from_pa(pa));
            }
            successes += 1;
        }
    }
    successes
}

/// Services a page fault on a non-present, non-zero PTE by reading its page
/// back in from the swap device.
///
/// Returns `Ok(())` without doing any I/O if another thread already handled
/// the same fault (the PTE is present by the time this runs).
pub fn swap_page_in(proc: &Process, va: Va) -> Result<(), KernelError> {
    let va = va.page_down();

    let slot_index = proc.with_pgdir(|root| -> Result<Option<usize>, KernelError> {
        let pte = pte::walk(root, va)?;
        match pte::decode_state(pte) {
            PteState::Present => Ok(None),
            PteState::Absent => Err(KernelError::InvalidArgument),
            PteState::Swapped(i) => Ok(Some(i)),
        }
    })?;
    let Some(i) = slot_index else {
        return Ok(());
    };
    if i >= slot::NSLOTS || slot::is_free(i) {
        return Err(KernelError::InvalidArgument);
    }

    let Some(page) = retry_under_pressure(keos::mm::Page::try_new, 1) else {
        return Err(KernelError::NoMemory);
    };
    page_io::read_page_from_slot(i, page.pa());
    let perm = slot::perm(i);
    let flags = (PteFlags::from_bits_truncate(perm as usize) | PteFlags::P).bits();

    // `true` means this call installed the mapping; `false` means another
    // thread already raced us to it (the "already handled" fast path of
    // step 3) and `page` was never used.
    let installed = proc.with_pgdir(|root| -> Result<bool, KernelError> {
        let pte = pte::walk_mut(root, va)?;
        if pte::decode_state(pte) == PteState::Present {
            return Ok(false);
        }
        pte.0 = page.pa().into_usize() | flags;
        tlb_shutdown(root);
        Ok(true)
    });

    match installed {
        Ok(true) => {
            core::mem::forget(page);
            slot::release(i);
            proc.rss_inc();
            Ok(())
        }
        Ok(false) => {
            // Someone else already faulted this page in and owns the slot's
            // lifecycle; our frame was never installed, so it must be freed
            // here instead of forgotten.
            drop(page);
            Ok(())
        }
        Err(e) => {
            drop(page);
            Err(e)
        }
    }
}

/// Evicts pages from the highest-RSS process while free frames are at or
/// below `threshold`, then adapts `threshold` down and `batch` up.
///
/// The adaptation runs unconditionally once triggered, even if `swap_out`
/// evicted nothing — sustained pressure should bias future behavior
/// regardless of a single batch's outcome.
pub fn maybe_swap() {
    let (threshold, batch) = {
        let guard = TUNABLES.lock();
        let t = (guard.threshold, guard.batch);
        guard.unlock();
        t
    };
    if free_frame_count() > threshold {
        return;
    }

    keos::info!("swap: threshold={} batch={}", threshold, batch);

    if let Some(pid) = victim::pick_victim_process() {
        if let Some(proc) = crate::process::ProcessTable::get(pid) {
            swap_out(&proc);
        }
    }

    let mut guard = TUNABLES.lock();
    let decay = guard.threshold * config::BETA as usize / 100;
    guard.threshold = (guard.threshold.saturating_sub(decay)).max(1);
    let growth = guard.batch * config::ALPHA as usize / 100;
    guard.batch = (guard.batch + growth).min(config::LIMIT);
    guard.unlock();
}

/// Exit-time cleanup: releases every swap slot still referenced by `proc`'s
/// page table. Present entries are left untouched; the generic teardown
/// path owns those frames.
pub fn swap_free(proc: &Process) {
    proc.with_pgdir(|root| {
        for_each_leaf(root, |_va, pte| {
            if let PteState::Swapped(i) = pte::decode_state(pte) {
                slot::release(i);
            }
        });
    });
}

/// Gives `child` its own copy of every swap slot `parent` currently
/// references, so the two address spaces stop sharing backing storage.
///
/// Assumes the generic fork page-table copy has already mirrored `parent`'s
/// swapped leaf entries onto `child` verbatim (same slot index, same
/// residual flags); this hook only re-points `child`'s copies at freshly
/// duplicated slots.
pub fn on_fork(parent: &Process, child: &Process) {
    let mut swapped: Vec<(Va, usize, usize)> = Vec::new();
    parent.with_pgdir(|root| {
        for_each_leaf(root, |va, pte| {
            if let PteState::Swapped(i) = pte::decode_state(pte) {
                swapped.push((va, i, pte.0 & 0xfff));
            }
        });
    });

    for (va, parent_slot, perm) in swapped {
        let Some(child_slot) = slot::duplicate(parent_slot) else {
            continue;
        };
        child.with_pgdir(|root| {
            if let Ok(pte) = pte::walk_mut(root, va) {
                pte.0 = (child_slot << 12) | perm;
            }
        });
    }
}
