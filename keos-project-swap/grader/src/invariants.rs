//! Properties of the PTE encoding that must hold independent of any running
//! process or device: absent, present and swapped never overlap, and
//! encoding a swapped entry is exactly invertible by `decode_state`.

use keos::mm::page_table::{Pte, PteFlags};
use keos_project_swap::pte::{self, PteState};

/// The all-zero entry, any present entry, and any swapped entry always
/// decode to three mutually exclusive states — no bit pattern produced by
/// one constructor is ever misread as another.
pub fn pte_states_are_disjoint() {
    assert_eq!(pte::decode_state(&Pte(0)), PteState::Absent);

    for bits in [
        PteFlags::P.bits(),
        (PteFlags::P | PteFlags::RW).bits(),
        (PteFlags::P | PteFlags::RW | PteFlags::US).bits(),
        PteFlags::P.bits() | (0x1234usize << 12),
    ] {
        assert_eq!(pte::decode_state(&Pte(bits)), PteState::Present);
    }

    // Every swapped entry this subsystem ever produces retains `US`: only
    // user-accessible pages are evicted (spec: pages lacking `U` are never
    // picked as victims), so `perm` is never literally zero in practice.
    // Slot 0 combined with an all-zero permission byte would otherwise
    // collide with the all-zero absent encoding; that combination is not
    // reachable through `swap_page_out` and is excluded here accordingly.
    for slot in [0usize, 1, 799] {
        for perm in [
            PteFlags::US.bits(),
            PteFlags::US.bits() | PteFlags::RW.bits(),
            PteFlags::US.bits() | PteFlags::A.bits(),
        ] {
            let raw = pte::encode_swapped(PteFlags::from_bits_truncate(perm), slot);
            assert_eq!(pte::decode_state(&Pte(raw)), PteState::Swapped(slot));
        }
    }
}

/// `encode_swapped` followed by `decode_state`/`slot_of` recovers the exact
/// slot index and drops `P` from the retained permission bits, regardless of
/// whether `P` was present in the input flags.
pub fn encode_swapped_round_trips_through_decode() {
    for slot in 0..16usize {
        let flags_without_p = PteFlags::RW | PteFlags::US | PteFlags::A;
        let raw = pte::encode_swapped(flags_without_p, slot);
        assert_eq!(pte::slot_of(raw), slot);
        assert_eq!(raw & 0xfff, flags_without_p.bits() & 0xfff);
        assert!(!PteFlags::from_bits_truncate(raw).contains(PteFlags::P));

        // Even if the caller forgot to clear P beforehand, encode_swapped
        // strips it so the result can never be misread as present.
        let flags_with_stale_p = flags_without_p | PteFlags::P;
        let raw2 = pte::encode_swapped(flags_with_stale_p, slot);
        assert_eq!(raw, raw2);
    }
}
