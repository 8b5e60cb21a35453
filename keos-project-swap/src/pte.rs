//! Page-table-entry encoding for the three leaf states this subsystem cares
//! about:
//!
//! - **absent**: the raw entry is `0`. No mapping, no swap slot.
//! - **present**: the `P` flag is set; the upper bits hold a physical frame.
//! - **swapped**: the `P` flag is clear but the entry is non-zero; the upper
//!   bits hold a swap slot index and the low 12 bits retain the permission
//!   flags the page had before eviction (minus `P`), so a fault-in can
//!   restore them verbatim, stale `A`/`D` bits and all.

use keos::{
    KernelError,
    addressing::Va,
    mm::page_table::{PageTableRoot, Pte, PteFlags},
};

/// Builds the raw bit pattern for a swapped-out entry.
///
/// `old_flags` is the entry's flags immediately before eviction (with `P`
/// already clear or about to be cleared); they are folded into the low 12
/// bits verbatim, including a possibly-stale `A` bit, per the documented
/// "don't bother clearing A" policy.
pub fn encode_swapped(old_flags: PteFlags, slot: usize) -> usize {
    ((slot << 12) as usize) | (old_flags.bits() & !PteFlags::P.bits() & 0xfff)
}

/// Extracts the swap slot index from a raw entry already known to be in the
/// swapped state (`decode_state` returned [`PteState::Swapped`]).
pub fn slot_of(raw: usize) -> usize {
    raw >> 12
}

/// The three states a leaf PTE can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteState {
    /// No mapping at all.
    Absent,
    /// Mapped to a physical frame.
    Present,
    /// Evicted to the given swap slot.
    Swapped(usize),
}

/// Classifies a raw PTE bit pattern.
pub fn decode_state(pte: &Pte) -> PteState {
    if pte.0 == 0 {
        PteState::Absent
    } else if pte.flags().contains(PteFlags::P) {
        PteState::Present
    } else {
        PteState::Swapped(slot_of(pte.0))
    }
}

fn indices(va: Va) -> (usize, usize, usize, usize) {
    let a = va.into_usize();
    (
        (a >> 39) & 0x1ff,
        (a >> 30) & 0x1ff,
        (a >> 21) & 0x1ff,
        (a >> 12) & 0x1ff,
    )
}

/// Walks `root` to find the leaf PTE for `va`, without creating any
/// intermediate table.
///
/// Returns [`KernelError::InvalidArgument`] (this subsystem's spelling of
/// the distilled spec's `NoPTE`) if any level of the walk is absent — which
/// only happens for addresses the owning process never mapped at all.
pub fn walk_mut(root: &mut PageTableRoot, va: Va) -> Result<&mut Pte, KernelError> {
    let (pml4ei, pdptei, pdei, ptei) = indices(va);
    let pdp = root[pml4ei]
        .into_pdp_mut()
        .map_err(|_| KernelError::InvalidArgument)?;
    let pd = pdp[pdptei]
        .into_pd_mut()
        .map_err(|_| KernelError::InvalidArgument)?;
    let pt = pd[pdei]
        .into_pt_mut()
        .map_err(|_| KernelError::InvalidArgument)?;
    Ok(&mut pt[ptei])
}

/// Read-only counterpart of [`walk_mut`], used by the victim-page scan.
pub fn walk(root: &PageTableRoot, va: Va) -> Result<&Pte, KernelError> {
    let (pml4ei, pdptei, pdei, ptei) = indices(va);
    let pdp = root[pml4ei]
        .into_pdp()
        .map_err(|_| KernelError::InvalidArgument)?;
    let pd = pdp[pdptei]
        .into_pd()
        .map_err(|_| KernelError::InvalidArgument)?;
    let pt = pd[pdei]
        .into_pt()
        .map_err(|_| KernelError::InvalidArgument)?;
    Ok(&pt[ptei])
}
