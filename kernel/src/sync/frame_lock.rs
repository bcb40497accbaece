use super::Scheduler;
use crate::mem::Pid;
use core::sync::atomic::{
    AtomicU16,
    Ordering::{AcqRel, Acquire},
};

/// The pin of a physical frame.
///
/// Unlike a [`Mutex`](super::Mutex) it has no guard: a frame is handed back to
/// callers still pinned and unpinned later (possibly from another function,
/// e.g. when a system call finishes copying). It remembers which process holds
/// it, so that unpinning on someone else's behalf is caught.
#[derive(Debug, Default)]
pub struct FrameLock {
    // 0 when free; pids start at 1.
    holder: AtomicU16,
}

impl FrameLock {
    pub const fn new() -> Self {
        Self {
            holder: AtomicU16::new(0),
        }
    }

    /// Pins the frame for `pid` if nobody holds it.
    pub fn try_lock(&self, pid: Pid) -> bool {
        assert_ne!(pid, 0, "pid 0 cannot hold a frame");
        self.holder.compare_exchange(0, pid, AcqRel, Acquire).is_ok()
    }

    /// Waits until the frame can be pinned for `pid`, yielding to the
    /// holder in between attempts.
    ///
    /// Panics if `pid` already holds the pin, since it would wait forever.
    pub fn lock(&self, pid: Pid, scheduler: &dyn Scheduler) {
        assert!(
            !self.is_held_by(pid),
            "process {pid} tried to pin a frame it already holds"
        );
        while !self.try_lock(pid) {
            scheduler.yield_now();
        }
    }

    /// Releases the pin. Only the holder may do this.
    pub fn unlock(&self, pid: Pid) {
        if let Err(holder) = self.holder.compare_exchange(pid, 0, AcqRel, Acquire) {
            panic!("process {pid} unpinned a frame held by {holder}");
        }
    }

    pub fn holder(&self) -> Option<Pid> {
        match self.holder.load(Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn is_held_by(&self, pid: Pid) -> bool {
        self.holder.load(Acquire) == pid
    }

    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }
}
