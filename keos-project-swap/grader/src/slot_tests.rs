//! Slot table allocation policy and the slot-conservation property.

use keos::{addressing::Pa, mm::Page};
use keos_project_swap::{page_io, slot};

/// Freshly allocated slots come back in ascending index order (first-fit
/// over an all-free table).
pub fn first_fit_allocation() {
    let base = slot::used_count();
    let a = slot::allocate().expect("table has room");
    let b = slot::allocate().expect("table has room");
    let c = slot::allocate().expect("table has room");
    assert!(a < b && b < c);
    assert_eq!(slot::used_count(), base + 3);

    slot::release(a);
    slot::release(b);
    slot::release(c);
    assert_eq!(slot::used_count(), base);
}

/// Releasing a low-index slot makes it the next one `allocate` returns, even
/// if higher-index slots are still occupied.
pub fn release_then_reallocate() {
    let a = slot::allocate().expect("table has room");
    let b = slot::allocate().expect("table has room");
    let c = slot::allocate().expect("table has room");

    slot::release(b);
    let reused = slot::allocate().expect("table has room");
    assert_eq!(reused, b);

    slot::release(a);
    slot::release(c);
    slot::release(reused);
}

/// Releasing an out-of-range or already-free index is a silent no-op, not a
/// panic, matching the documented idempotent-cleanup contract.
pub fn out_of_range_release_is_noop() {
    let before = slot::used_count();
    slot::release(slot::NSLOTS + 7);
    slot::release(usize::MAX);
    assert_eq!(slot::used_count(), before);

    let a = slot::allocate().expect("table has room");
    slot::release(a);
    slot::release(a);
    assert_eq!(slot::used_count(), before);
}

/// Duplicating an occupied slot produces a distinct slot with identical page
/// contents and permission bits.
pub fn duplicate_copies_contents() {
    let parent = slot::allocate().expect("table has room");
    slot::set_perm(parent, 0x7);

    let mut src = Page::new();
    src.inner_mut().fill(0xab);
    page_io::write_page_to_slot(parent, src.pa());

    let child = slot::duplicate(parent).expect("room for a duplicate");
    assert_ne!(child, parent);
    assert_eq!(slot::perm(child), slot::perm(parent));

    let mut dst = Page::new();
    page_io::read_page_from_slot(child, dst.pa());
    assert!(dst.inner_mut().iter().all(|&b| b == 0xab));

    slot::release(parent);
    slot::release(child);
}

/// Across any sequence of allocate/release/duplicate calls, the number of
/// used slots exactly tracks what was handed out and not yet released.
pub fn conservation_across_round_trip() {
    let base = slot::used_count();

    let s = slot::allocate().expect("table has room");
    assert_eq!(slot::used_count(), base + 1);

    let page = Page::new();
    let pa: Pa = page.pa();
    page_io::write_page_to_slot(s, pa);

    let dup = slot::duplicate(s).expect("room for a duplicate");
    assert_eq!(slot::used_count(), base + 2);

    slot::release(s);
    assert_eq!(slot::used_count(), base + 1);
    slot::release(dup);
    assert_eq!(slot::used_count(), base);
}
