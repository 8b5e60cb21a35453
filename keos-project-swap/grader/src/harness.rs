//! Page-table scaffolding the grader needs but the swap subsystem itself
//! never does: installing a *new* mapping requires a create-capable walk,
//! and the distilled design explicitly keeps the library's own walker
//! read-only (`walk(pgdir, va, create)` is called with `create = false`
//! only, per spec). A real kernel's mmap/exec path would own the
//! create-capable variant; here the grader stands in for it, the same way
//! `keos-project2`'s unfinished `PageTable::do_map` sketches the
//! allocate-intermediate-tables-as-you-go approach this mirrors.

use keos::{
    addressing::{Pa, Va},
    mm::{
        Page,
        page_table::{PageTableRoot, PdeFlags, PdpeFlags, Pml4eFlags, Pte, PteFlags},
    },
};

fn indices(va: Va) -> (usize, usize, usize, usize) {
    let a = va.into_usize();
    (
        (a >> 39) & 0x1ff,
        (a >> 30) & 0x1ff,
        (a >> 21) & 0x1ff,
        (a >> 12) & 0x1ff,
    )
}

/// Returns a mutable reference to the leaf PTE for `va`, allocating any
/// missing intermediate PDP/PD/PT page along the way.
pub fn ensure_leaf<'a>(root: &'a mut PageTableRoot, va: Va) -> &'a mut Pte {
    let (pml4ei, pdptei, pdei, ptei) = indices(va);

    let pml4e = &mut root[pml4ei];
    if pml4e.pa().is_none() {
        let pa = Page::new().into_raw();
        pml4e.set_pa(pa).expect("fresh table page is page-aligned");
        pml4e.set_flags(Pml4eFlags::P | Pml4eFlags::RW | Pml4eFlags::US);
    }
    let pdpe = &mut pml4e.into_pdp_mut().expect("just ensured present")[pdptei];
    if pdpe.pa().is_none() {
        let pa = Page::new().into_raw();
        pdpe.set_pa(pa).expect("fresh table page is page-aligned");
        pdpe.set_flags(PdpeFlags::P | PdpeFlags::RW | PdpeFlags::US);
    }
    let pde = &mut pdpe.into_pd_mut().expect("just ensured present")[pdei];
    if pde.pa().is_none() {
        let pa = Page::new().into_raw();
        pde.set_pa(pa).expect("fresh table page is page-aligned");
        pde.set_flags(PdeFlags::P | PdeFlags::RW | PdeFlags::US);
    }
    &mut pde.into_pt_mut().expect("just ensured present")[ptei]
}

/// Maps a freshly allocated page at `va` with every byte set to `fill`,
/// returning its physical address. `flags` should include [`PteFlags::P`].
pub fn map_present(root: &mut PageTableRoot, va: Va, flags: PteFlags, fill: u8) -> Pa {
    let mut page = Page::new();
    page.inner_mut().fill(fill);
    let pa = page.into_raw();
    let pte = ensure_leaf(root, va);
    pte.set_pa(pa).expect("fresh page is page-aligned");
    unsafe {
        pte.set_flags(flags | PteFlags::P);
    }
    pa
}

/// Installs a raw PTE bit pattern at `va`, creating intermediate tables as
/// needed. Used to simulate the generic fork page-table copy that the
/// library's `on_fork` hook assumes has already happened.
pub fn install_raw(root: &mut PageTableRoot, va: Va, raw: usize) {
    ensure_leaf(root, va).0 = raw;
}

/// Frees the frame mapped at `va` and zeroes its PTE, standing in for the
/// generic address-space teardown path this crate doesn't own.
///
/// # Safety
/// `va` must currently hold a present mapping created by [`map_present`].
pub unsafe fn unmap_present(root: &mut PageTableRoot, va: Va) {
    let pte = ensure_leaf(root, va);
    let pa = pte.pa().expect("unmap_present called on a non-present entry");
    pte.0 = 0;
    keos::mm::page_table::tlb_shutdown(root);
    drop(unsafe { Page::from_pa(pa) });
}

/// Reads back the contents of the page at `pa` for content-equality checks.
pub fn read_page(pa: Pa) -> [u8; 4096] {
    let slice =
        unsafe { core::slice::from_raw_parts(pa.into_kva().into_usize() as *const u8, 4096) };
    let mut out = [0u8; 4096];
    out.copy_from_slice(slice);
    out
}
