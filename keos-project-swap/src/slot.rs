//! The swap slot table.
//!
//! A swap slot is a fixed 4 KiB window on the swap device, addressed by
//! index. Slot `i` occupies blocks `[BASE + i * 8, BASE + i * 8 + 8)` on
//! device 0 (8 sectors of 512 bytes each make up one page). Slots `0` and
//! `1`'s worth of blocks before `BASE` are reserved for the boot sector and
//! superblock, matching the original pager's block numbering.
//!
//! Each occupied slot also remembers the 12-bit page permission flags the
//! page had when it was evicted, so a later fault-in can restore the PTE
//! without consulting the address space that owned it.

use keos::sync::SpinLock;

/// Number of swap slots backed by the device.
pub const NSLOTS: usize = 800;

/// First block on the swap device used for slot storage.
pub const BASE: usize = 2;

/// 512-byte sectors making up one 4 KiB page.
pub const BLOCKS_PER_SLOT: usize = 8;

#[derive(Clone, Copy)]
struct Slot {
    free: bool,
    /// Permission flags (minus `P`) captured at eviction time.
    perm: u16,
}

struct SlotTable {
    slots: [Slot; NSLOTS],
}

static SLOTS: SpinLock<SlotTable> = SpinLock::new(SlotTable {
    slots: [Slot {
        free: true,
        perm: 0,
    }; NSLOTS],
});

/// Resets the slot table to all-free. Idempotent; call once at boot.
pub fn init() {
    let mut guard = SLOTS.lock();
    for s in guard.slots.iter_mut() {
        s.free = true;
        s.perm = 0;
    }
    guard.unlock();
}

/// Returns the block index of the first sector of slot `i`.
#[inline]
pub fn block_of(i: usize) -> usize {
    BASE + i * BLOCKS_PER_SLOT
}

/// Claims a free slot, returning its index.
///
/// Returns `None` if the table is full; callers retry after applying swap
/// pressure (see [`crate::controller::retry_under_pressure`]).
pub fn allocate() -> Option<usize> {
    let mut guard = SLOTS.lock();
    let found = guard.slots.iter().position(|s| s.free);
    if let Some(i) = found {
        guard.slots[i].free = false;
    }
    guard.unlock();
    found
}

/// Releases slot `i` back to the free pool.
///
/// Out-of-range or already-free indices are a silent no-op: exit-time
/// cleanup (see [`crate::controller::swap_free`]) may race harmlessly with
/// itself across duplicate teardown paths.
pub fn release(i: usize) {
    let mut guard = SLOTS.lock();
    if let Some(s) = guard.slots.get_mut(i) {
        s.free = true;
        s.perm = 0;
    }
    guard.unlock();
}

/// Records the permission flags a slot's page was evicted with.
pub fn set_perm(i: usize, perm: u16) {
    let mut guard = SLOTS.lock();
    if let Some(s) = guard.slots.get_mut(i) {
        s.perm = perm;
    }
    guard.unlock();
}

/// Returns the permission flags slot `i` was last evicted with.
pub fn perm(i: usize) -> u16 {
    let guard = SLOTS.lock();
    let p = guard.slots.get(i).map_or(0, |s| s.perm);
    guard.unlock();
    p
}

/// Returns the number of slots currently marked used.
///
/// Used by the slot-conservation property: across any sequence of
/// allocate/release/duplicate/exit-cleanup calls this must equal the number
/// of live swapped PTEs across all address spaces.
pub fn used_count() -> usize {
    let guard = SLOTS.lock();
    let n = guard.slots.iter().filter(|s| !s.free).count();
    guard.unlock();
    n
}

/// Returns whether slot `i` holds no swapped page. Out-of-range indices
/// count as free.
pub fn is_free(i: usize) -> bool {
    let guard = SLOTS.lock();
    let f = guard.slots.get(i).is_none_or(|s| s.free);
    guard.unlock();
    f
}

/// Duplicates slot `parent`'s contents into a newly allocated slot, for
/// `fork()` of a swapped-out page. Retries twice under memory/slot pressure
/// before giving up, per the documented "try twice after pressure" pattern.
///
/// The block copy goes straight from `parent`'s disk region to `child`'s,
/// sector by sector, without passing through a physical frame — this only
/// needs a slot, not a page of RAM, so it cannot fail for lack of a free
/// frame the way the `fork` path that invokes it otherwise might.
///
/// Returns `None` if `parent` is out of range or not currently occupied.
pub fn duplicate(parent: usize) -> Option<usize> {
    if is_free(parent) {
        return None;
    }
    let child = crate::controller::retry_under_pressure(allocate, 2)?;
    set_perm(child, perm(parent));
    crate::page_io::copy_slot(parent, child);
    Some(child)
}
