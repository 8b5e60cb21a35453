//! Synchronous page I/O against the swap device.
//!
//! The swap device is always device `0`. Each 4 KiB page is moved as 8
//! consecutive 512-byte sectors, matching KeOS's [`abyss::dev::BlockOps`]
//! granularity; there is no separate buffer-cache layer to go through, since
//! `BlockOps::read`/`write` are themselves synchronous.
//!
//! Both functions address the page by raw [`Pa`] rather than an owned
//! [`keos::mm::Page`]: during eviction the frame is still mapped and owned
//! by the victim's address space, so taking a `Page` here would double-free
//! it on drop. The caller is responsible for the frame's lifetime.

use abyss::dev::{Sector, get_bdev};
use keos::addressing::Pa;

const SWAP_DEVICE: usize = 0;

/// Writes the 4 KiB page at `pa` to slot `i` of the swap device.
///
/// Panics if the swap device is not registered or a sector write fails —
/// both indicate a misconfigured kernel, not a recoverable runtime
/// condition, so no `Result` is threaded through this hot path.
pub fn write_page_to_slot(i: usize, pa: Pa) {
    let dev = get_bdev(SWAP_DEVICE).expect("swap device not registered");
    let base = crate::slot::block_of(i);
    let data =
        unsafe { core::slice::from_raw_parts(pa.into_kva().into_usize() as *const u8, 0x1000) };
    for b in 0..crate::slot::BLOCKS_PER_SLOT {
        let mut buf = [0u8; 512];
        buf.copy_from_slice(&data[b * 512..(b + 1) * 512]);
        assert!(
            dev.write(Sector(base + b), &buf),
            "swap write failed at block {}",
            base + b
        );
    }
}

/// Reads slot `i`'s contents on the swap device into the page at `pa`.
pub fn read_page_from_slot(i: usize, pa: Pa) {
    let dev = get_bdev(SWAP_DEVICE).expect("swap device not registered");
    let base = crate::slot::block_of(i);
    let data =
        unsafe { core::slice::from_raw_parts_mut(pa.into_kva().into_usize() as *mut u8, 0x1000) };
    for b in 0..crate::slot::BLOCKS_PER_SLOT {
        let mut buf = [0u8; 512];
        assert!(
            dev.read(Sector(base + b), &mut buf),
            "swap read failed at block {}",
            base + b
        );
        data[b * 512..(b + 1) * 512].copy_from_slice(&buf);
    }
}

/// Copies slot `src`'s 8 blocks directly onto slot `dst`'s, sector by sector
/// through a stack buffer.
///
/// Used by [`crate::slot::duplicate`] for fork-time copying of a swapped
/// page: the copy never needs a physical frame, so it cannot fail for lack
/// of one, matching the original pager's `bread`/`bwrite` block-to-block
/// copy.
pub fn copy_slot(src: usize, dst: usize) {
    let dev = get_bdev(SWAP_DEVICE).expect("swap device not registered");
    let src_base = crate::slot::block_of(src);
    let dst_base = crate::slot::block_of(dst);
    for b in 0..crate::slot::BLOCKS_PER_SLOT {
        let mut buf = [0u8; 512];
        assert!(
            dev.read(Sector(src_base + b), &mut buf),
            "swap read failed at block {}",
            src_base + b
        );
        assert!(
            dev.write(Sector(dst_base + b), &buf),
            "swap write failed at block {}",
            dst_base + b
        );
    }
}
