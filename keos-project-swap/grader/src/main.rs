// This is test & bootstrap implementation.
// This file will be overwritten when grading.
#![no_std]
#![no_main]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;
extern crate keos;
extern crate keos_project_swap;

mod harness;
mod invariants;
mod slot_tests;
mod swap_tests;
mod victim_tests;

use keos::SystemConfigurationBuilder;
pub use keos_project_swap::ProcessTask;

#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe fn main(_config_builder: SystemConfigurationBuilder) {
    keos_project_swap::init();
    keos::TestDriver::<ProcessTask>::start([
        // Slot table.
        &slot_tests::first_fit_allocation,
        &slot_tests::release_then_reallocate,
        &slot_tests::out_of_range_release_is_noop,
        &slot_tests::duplicate_copies_contents,
        &slot_tests::conservation_across_round_trip,
        // Victim selection.
        &victim_tests::smaller_pid_breaks_rss_tie,
        &victim_tests::no_runnable_process_yields_none,
        &victim_tests::second_chance_clears_accessed_bit,
        // End-to-end swap behavior.
        &swap_tests::evict_then_fault_in_round_trip,
        &swap_tests::fault_in_absent_pte_is_error,
        &swap_tests::batch_eviction_respects_current_batch_size,
        &swap_tests::controller_noop_when_frames_plentiful,
        &swap_tests::exit_cleanup_releases_slots,
        &swap_tests::fork_duplicates_swapped_slot,
        // Encoding invariants.
        &invariants::pte_states_are_disjoint,
        &invariants::encode_swapped_round_trips_through_decode,
    ]);
}

#[unsafe(no_mangle)]
pub unsafe fn ap_main() {}
