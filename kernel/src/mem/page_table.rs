//! The supplemental page table: where each page of a process comes from.

use super::{FrameId, Pid, VmError};
use crate::swapping::SwapSlot;
use crate::sync::{Mutex, MutexGuard};
use crate::vfs::File;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// A byte range of a file backing one page. Bytes past `read_bytes` are zero.
#[derive(Clone)]
pub struct FileRegion {
    pub file: Arc<dyn File>,
    pub offset: u64,
    pub read_bytes: usize,
    /// Dirty pages go back to the file instead of to swap.
    pub write_back: bool,
}

impl fmt::Debug for FileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRegion")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("write_back", &self.write_back)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Backing {
    /// Zero-filled on first touch.
    Zero,
    File(FileRegion),
    Swap(SwapSlot),
    /// The content only exists in the frame.
    Anonymous,
}

#[derive(Debug)]
pub struct PageState {
    pub frame: Option<FrameId>,
    pub backing: Backing,
}

#[derive(Debug)]
pub struct PageDescriptor {
    vaddr: usize,
    owner: Pid,
    writable: bool,
    state: Mutex<PageState>,
}

impl PageDescriptor {
    fn new(owner: Pid, vaddr: usize, backing: Backing, writable: bool) -> Self {
        Self {
            vaddr,
            owner,
            writable,
            state: Mutex::new(PageState {
                frame: None,
                backing,
            }),
        }
    }

    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    pub fn owner(&self) -> Pid {
        self.owner
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.state.lock().frame
    }

    pub fn backing(&self) -> Backing {
        self.state.lock().backing.clone()
    }

    /// Only the holder of the page's frame pin (or the owner, while the page
    /// is not resident) may change the state.
    pub fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }
}

/// Page descriptors of one process, keyed by page address.
pub struct SupplementalPageTable {
    owner: Pid,
    pages: Mutex<BTreeMap<usize, Arc<PageDescriptor>>>,
}

impl SupplementalPageTable {
    pub fn new(owner: Pid) -> Self {
        Self {
            owner,
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn lookup(&self, vaddr: usize) -> Option<Arc<PageDescriptor>> {
        self.pages.lock().get(&vaddr).cloned()
    }

    pub fn contains(&self, vaddr: usize) -> bool {
        self.pages.lock().contains_key(&vaddr)
    }

    pub fn insert(
        &self,
        vaddr: usize,
        backing: Backing,
        writable: bool,
    ) -> Result<Arc<PageDescriptor>, VmError> {
        if let Backing::File(region) = &backing {
            if region.read_bytes > PAGE_FRAME_SIZE {
                return Err(VmError::RegionTooLarge);
            }
        }
        let mut pages = self.pages.lock();
        if pages.contains_key(&vaddr) {
            return Err(VmError::AlreadyMapped);
        }
        let page = Arc::new(PageDescriptor::new(self.owner, vaddr, backing, writable));
        pages.insert(vaddr, page.clone());
        Ok(page)
    }

    pub fn remove(&self, vaddr: usize) -> Option<Arc<PageDescriptor>> {
        self.pages.lock().remove(&vaddr)
    }

    /// All descriptors, in address order.
    pub fn pages(&self) -> Vec<Arc<PageDescriptor>> {
        self.pages.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }
}
