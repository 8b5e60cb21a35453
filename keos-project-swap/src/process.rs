//! The process table.
//!
//! This binds the distilled design's "process table" external collaborator
//! to a concrete registry: a [`Process`] carries exactly the fields
//! [`crate::victim`] and [`crate::controller`] need (`pid`, `rss`, `state`,
//! `pgdir`), and [`ProcessTable`] is the global, lockable collection of
//! them, following the same `SpinLock<BTreeMap<..>>` registration pattern
//! `keos::thread` uses for its exit-code and thread-state tables.

use alloc::{boxed::Box, collections::btree_map::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicI64, Ordering};
use keos::{
    addressing::{Pa, Va},
    mm::page_table::PageTableRoot,
    sync::{SpinLock, atomic::AtomicUsize},
    syscall::Registers,
    task::{PFErrorCode, Task},
};

/// Process identifier. Live entries always have a positive pid; the victim
/// selector's scan skips anything else.
pub type Pid = i64;

/// Scheduling state of a [`Process`], as seen by the victim selector.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessState {
    /// Eligible for scheduling and for eviction.
    Runnable,
    /// Tearing down; [`crate::swap_free`] has run or is running.
    Exiting,
}

/// A process's resident state, as far as this subsystem is concerned.
pub struct Process {
    pub pid: Pid,
    pub state: SpinLock<ProcessState>,
    pub rss: AtomicUsize,
    pub pgdir: SpinLock<Box<PageTableRoot>>,
}

impl Process {
    fn new(pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            pid,
            state: SpinLock::new(ProcessState::Runnable),
            rss: AtomicUsize::new(0),
            pgdir: SpinLock::new(PageTableRoot::new_boxed_with_kernel_addr()),
        })
    }

    /// Current resident set size.
    pub fn rss(&self) -> usize {
        self.rss.load()
    }

    /// Accounts one newly present user page.
    pub fn rss_inc(&self) {
        self.rss.fetch_add(1);
    }

    /// Accounts one page leaving residency (evicted or unmapped).
    pub fn rss_dec(&self) {
        self.rss.fetch_sub(1);
    }

    /// Runs `f` with exclusive access to this process's page directory.
    pub fn with_pgdir<R>(&self, f: impl FnOnce(&mut PageTableRoot) -> R) -> R {
        let mut guard = self.pgdir.lock();
        let r = f(&mut guard);
        guard.unlock();
        r
    }
}

static TABLE: SpinLock<BTreeMap<Pid, Arc<Process>>> = SpinLock::new(BTreeMap::new());
static NEXT_PID: AtomicI64 = AtomicI64::new(1);

/// The global registry of live processes.
pub struct ProcessTable;

impl ProcessTable {
    fn register(proc: Arc<Process>) {
        let mut guard = TABLE.lock();
        guard.insert(proc.pid, proc);
        guard.unlock();
    }

    fn unregister(pid: Pid) {
        let mut guard = TABLE.lock();
        guard.remove(&pid);
        guard.unlock();
    }

    /// Looks up a process by pid.
    pub fn get(pid: Pid) -> Option<Arc<Process>> {
        let guard = TABLE.lock();
        let found = guard.get(&pid).cloned();
        guard.unlock();
        found
    }

    /// Runs `f` over every live process, under the table lock.
    ///
    /// Matches the distilled contract's "scan the process table under its
    /// lock"; callers (the victim selector) must not block inside `f`.
    pub fn for_each(mut f: impl FnMut(&Arc<Process>)) {
        let guard = TABLE.lock();
        for proc in guard.values() {
            f(proc);
        }
        guard.unlock();
    }
}

/// A [`Process`] wrapped as a schedulable [`Task`].
///
/// Registers a fresh [`Process`] in the [`ProcessTable`] on construction and
/// runs exit cleanup (releasing any swapped slots, then unregistering) on
/// drop, mirroring the thread module's own registration lifecycle.
pub struct ProcessTask(pub Arc<Process>);

impl Default for ProcessTask {
    fn default() -> Self {
        let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
        let proc = Process::new(pid);
        ProcessTable::register(proc.clone());
        ProcessTask(proc)
    }
}

impl Drop for ProcessTask {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        *state = ProcessState::Exiting;
        state.unlock();
        crate::swap_free(&self.0);
        ProcessTable::unregister(self.0.pid);
    }
}

impl Task for ProcessTask {
    fn syscall(&mut self, _registers: &mut Registers) {
        unreachable!("this subsystem does not define a syscall ABI")
    }

    fn page_fault(&mut self, ec: PFErrorCode, cr2: Va) {
        if !ec.contains(PFErrorCode::PRESENT) && crate::swap_page_in(&self.0, cr2).is_ok() {
            return;
        }
        keos::thread::kill_current_thread();
    }

    fn with_page_table_pa(&self, f: &fn(Pa)) {
        f(self.0.with_pgdir(|pt| pt.pa()))
    }
}
