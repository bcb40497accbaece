//! Physical frames, their pins and the clock hand.

use super::{FrameId, PageKey, Pid};
use crate::swapping::page_replacement::{ClockEviction, PageReplacementPolicy, Verdict};
use crate::sync::{FrameLock, Mutex, Scheduler};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

pub type Frame = [u8; PAGE_FRAME_SIZE];

struct FrameEntry {
    pin: FrameLock,
    resident: Mutex<Option<PageKey>>,
}

/// Every physical frame paging can hand out, fixed at boot.
///
/// The content of a frame may only be touched by whoever holds its pin, and
/// so may the descriptor of the page living in it.
pub struct FrameTable {
    memory: Box<[UnsafeCell<Frame>]>,
    entries: Box<[FrameEntry]>,
    clock: Mutex<ClockEviction>,
    scheduler: Arc<dyn Scheduler>,
}

// SAFETY: frame memory is only accessed through `frame`/`frame_mut`, whose
// callers must hold the frame's pin.
unsafe impl Sync for FrameTable {}

impl FrameTable {
    pub fn new(frames: usize, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            memory: (0..frames).map(|_| UnsafeCell::new([0; PAGE_FRAME_SIZE])).collect(),
            entries: (0..frames)
                .map(|_| FrameEntry {
                    pin: FrameLock::new(),
                    resident: Mutex::new(None),
                })
                .collect(),
            clock: Mutex::new(ClockEviction::new()),
            scheduler,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pins and returns some frame nobody lives in, without waiting.
    pub fn try_claim_free(&self, pid: Pid) -> Option<FrameId> {
        self.entries.iter().enumerate().find_map(|(id, entry)| {
            if !entry.pin.try_lock(pid) {
                return None;
            }
            if entry.resident.lock().is_none() {
                Some(id)
            } else {
                entry.pin.unlock(pid);
                None
            }
        })
    }

    /// Runs the clock over the table and returns a victim pinned for `pid`,
    /// together with the page living in it (`None` if the frame was freed
    /// behind the hand's back).
    ///
    /// `referenced` tests and clears the accessed bit of a page. It is called
    /// with the frame pinned and the clock locked, so it must not block.
    pub fn select_victim(
        &self,
        pid: Pid,
        mut referenced: impl FnMut(PageKey) -> bool,
    ) -> Option<(FrameId, Option<PageKey>)> {
        let mut clock = self.clock.lock();
        let mut resident = None;
        let victim = clock.select_victim(self.len(), &mut |id| {
            let entry = &self.entries[id];
            if !entry.pin.try_lock(pid) {
                return Verdict::Busy;
            }
            let key = *entry.resident.lock();
            match key {
                Some(key) if referenced(key) => {
                    entry.pin.unlock(pid);
                    Verdict::Referenced
                }
                key => {
                    resident = key;
                    Verdict::Victim
                }
            }
        })?;
        Some((victim, resident))
    }

    pub fn resident(&self, id: FrameId) -> Option<PageKey> {
        *self.entries[id].resident.lock()
    }

    /// Records which page lives in a frame. The caller holds the pin.
    pub fn set_resident(&self, id: FrameId, key: Option<PageKey>) {
        debug_assert!(self.entries[id].pin.is_locked());
        *self.entries[id].resident.lock() = key;
    }

    /// Marks a frame free and unpins it.
    pub fn release(&self, id: FrameId, pid: Pid) {
        self.set_resident(id, None);
        self.unpin(id, pid);
    }

    /// Waits for the pin of frame `id`, yielding to whoever holds it.
    pub fn pin(&self, id: FrameId, pid: Pid) {
        self.entries[id].pin.lock(pid, &*self.scheduler);
    }

    pub fn unpin(&self, id: FrameId, pid: Pid) {
        self.entries[id].pin.unlock(pid);
    }

    pub fn is_pinned(&self, id: FrameId) -> bool {
        self.entries[id].pin.is_locked()
    }

    pub fn is_pinned_by(&self, id: FrameId, pid: Pid) -> bool {
        self.entries[id].pin.is_held_by(pid)
    }

    /// # Safety
    ///
    /// The caller must hold the pin of frame `id` for as long as the
    /// reference lives.
    pub unsafe fn frame(&self, id: FrameId) -> &Frame {
        &*self.memory[id].get()
    }

    /// # Safety
    ///
    /// The caller must hold the pin of frame `id` for as long as the
    /// reference lives, and must not hold any other reference to the frame.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_mut(&self, id: FrameId) -> &mut Frame {
        &mut *self.memory[id].get()
    }

    pub fn frames_in_use(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.resident.lock().is_some())
            .count()
    }
}
