//! Per-process virtual-to-physical mappings.

use crate::mem::FrameId;
use crate::sync::Mutex;
use alloc::collections::BTreeMap;
use kidneyos_shared::mem::{page_round_down, PAGE_FRAME_SIZE};
use kidneyos_shared::paging::PageTableEntry;

/// What paging needs from a process's page tables.
///
/// Every address is rounded down to its page. The accessed and dirty bits of
/// a cleared mapping stay readable until the page is mapped again.
pub trait PageMapping: Send + Sync {
    /// Maps the page at `vaddr` to `frame`. Returns `false` if the page is
    /// already mapped.
    fn map(&self, vaddr: usize, frame: FrameId, writable: bool) -> bool;
    fn unmap(&self, vaddr: usize);
    fn translate(&self, vaddr: usize) -> Option<FrameId>;

    fn is_accessed(&self, vaddr: usize) -> bool;
    fn set_accessed(&self, vaddr: usize, accessed: bool);
    fn is_dirty(&self, vaddr: usize) -> bool;
    fn set_dirty(&self, vaddr: usize, dirty: bool);

    /// Performs the bookkeeping the MMU does on a user access: returns
    /// `false` if the access would fault, otherwise sets the accessed bit
    /// (and the dirty bit for writes).
    fn record_access(&self, vaddr: usize, write: bool) -> bool;
}

/// A page directory kept as a sparse map from page number to entry.
#[derive(Default)]
pub struct PageDirectory {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn page_number(vaddr: usize) -> usize {
        page_round_down(vaddr) / PAGE_FRAME_SIZE
    }

    fn entry(&self, vaddr: usize) -> Option<PageTableEntry> {
        self.entries.lock().get(&Self::page_number(vaddr)).copied()
    }

    fn update(&self, vaddr: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(entry) = self.entries.lock().get_mut(&Self::page_number(vaddr)) {
            *entry = f(*entry);
        }
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().values().filter(|e| e.present()).count()
    }
}

impl PageMapping for PageDirectory {
    fn map(&self, vaddr: usize, frame: FrameId, writable: bool) -> bool {
        let Ok(frame) = u32::try_from(frame) else {
            return false;
        };
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(Self::page_number(vaddr))
            .or_insert(PageTableEntry::DEFAULT);
        if entry.present() {
            return false;
        }
        *entry = PageTableEntry::user_mapping(frame, writable);
        true
    }

    fn unmap(&self, vaddr: usize) {
        self.update(vaddr, |e| e.with_present(false));
    }

    fn translate(&self, vaddr: usize) -> Option<FrameId> {
        self.entry(vaddr)
            .filter(|e| e.present())
            .map(|e| e.frame_number() as FrameId)
    }

    fn is_accessed(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|e| e.accessed())
    }

    fn set_accessed(&self, vaddr: usize, accessed: bool) {
        self.update(vaddr, |e| e.with_accessed(accessed));
    }

    fn is_dirty(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|e| e.dirty())
    }

    fn set_dirty(&self, vaddr: usize, dirty: bool) {
        self.update(vaddr, |e| e.with_dirty(dirty));
    }

    fn record_access(&self, vaddr: usize, write: bool) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&Self::page_number(vaddr)) else {
            return false;
        };
        if !entry.present() || (write && !entry.read_write()) {
            return false;
        }
        *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
        true
    }
}
