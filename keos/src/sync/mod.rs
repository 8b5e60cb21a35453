//! Synchronization primitives.
//!
//! Re-exports the spinlock, atomic and reader-writer lock wrappers used
//! throughout the kernel.
pub mod atomic;
pub mod rwlock;
pub mod spinlock;

pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
