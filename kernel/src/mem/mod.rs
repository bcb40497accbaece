//! Demand paging.
//!
//! [`VirtualMemory`] owns the frame table, the swap space and the address
//! spaces of all processes. Pages are brought in on first touch from their
//! [`Backing`] and pushed back out by the clock when frames run out.

pub mod address_space;
pub mod fault;
pub mod frame_table;
pub mod page_table;
pub mod user;

#[cfg(test)]
mod tests;

use crate::block::block_core::Block;
use crate::block::block_error::BlockError;
use crate::swapping::{SwapError, SwapSpace};
use crate::sync::Scheduler;
use crate::vfs;
use address_space::{AddressSpace, AddressSpaceTable};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use frame_table::{Frame, FrameTable};
use kidneyos_shared::mem::{
    is_page_aligned, is_user_vaddr, page_round_down, OFFSET, PAGE_FRAME_SIZE, STACK_MAX,
    STACK_SLACK, USER_STACK_TOP,
};
use log::{debug, info, trace, warn};
use page_table::{Backing, FileRegion, PageDescriptor};
use thiserror::Error;

pub use fault::{Resident, Terminate, EXIT_FAULT};

/// Process identifier. 0 is never a process.
pub type Pid = u16;

/// Index into the frame table.
pub type FrameId = usize;

/// A user page: the owning process and the page's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageKey {
    pub pid: Pid,
    pub vaddr: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("swap space is full")]
    SwapFull,
    #[error("short transfer")]
    ShortTransfer,
    #[error("page is already mapped")]
    AlreadyMapped,
    #[error("file region larger than a page")]
    RegionTooLarge,
    #[error("address is not page aligned")]
    Misaligned,
    #[error("not a user address")]
    NotUserAddress,
    #[error("page is not mapped")]
    NotMapped,
    #[error("page is read-only")]
    ReadOnly,
    #[error("stack overflow")]
    StackOverflow,
    #[error("no address space for pid {0}")]
    NoAddressSpace(Pid),
    #[error("file: {0}")]
    File(#[from] vfs::Error),
    #[error("swap device: {0}")]
    Block(#[from] BlockError),
}

impl From<SwapError> for VmError {
    fn from(err: SwapError) -> Self {
        match err {
            SwapError::Full => VmError::SwapFull,
            SwapError::Block(err) => VmError::Block(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Physical frames available to user pages.
    pub frames: usize,
    /// The stack grows down from here.
    pub user_stack_top: usize,
    /// Largest the stack may grow to, in bytes.
    pub stack_max: usize,
    /// How far below the stack pointer an access still counts as a push.
    pub stack_slack: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            frames: 256,
            user_stack_top: USER_STACK_TOP,
            stack_max: STACK_MAX,
            stack_slack: STACK_SLACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmStats {
    pub frames: usize,
    pub frames_in_use: usize,
    pub swap_slots: usize,
    pub swap_slots_used: usize,
    pub swap_reads: u32,
    pub swap_writes: u32,
    pub evictions: usize,
}

/// The paging service.
///
/// Locks are taken in the order documented in [`crate::sync`].
pub struct VirtualMemory {
    config: VmConfig,
    frames: FrameTable,
    swap: SwapSpace,
    spaces: AddressSpaceTable,
    evictions: AtomicUsize,
}

impl VirtualMemory {
    /// A paging service whose waits yield to the host's threads.
    #[cfg(not(target_os = "none"))]
    pub fn new(config: VmConfig, swap_device: Block) -> Self {
        Self::with_scheduler(config, swap_device, Arc::new(crate::sync::ThreadYield))
    }

    pub fn with_scheduler(
        config: VmConfig,
        swap_device: Block,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        info!(
            "vm: {} frames, user stack at {:#x} (max {} KiB)",
            config.frames,
            config.user_stack_top,
            config.stack_max / 1024
        );
        Self {
            config,
            frames: FrameTable::new(config.frames, scheduler.clone()),
            swap: SwapSpace::new(swap_device, scheduler),
            spaces: AddressSpaceTable::new(),
            evictions: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn create_address_space(&self, pid: Pid) -> Arc<AddressSpace> {
        self.add_address_space(AddressSpace::new(pid))
    }

    pub fn add_address_space(&self, space: AddressSpace) -> Arc<AddressSpace> {
        let space = Arc::new(space);
        self.spaces.add(space.clone());
        space
    }

    pub fn address_space(&self, pid: Pid) -> Result<Arc<AddressSpace>, VmError> {
        self.spaces.get(pid).ok_or(VmError::NoAddressSpace(pid))
    }

    /// Adds a page that is loaded lazily from `backing`.
    pub fn insert_page(
        &self,
        pid: Pid,
        vaddr: usize,
        backing: Backing,
        writable: bool,
    ) -> Result<Arc<PageDescriptor>, VmError> {
        if !is_page_aligned(vaddr) {
            return Err(VmError::Misaligned);
        }
        if !is_user_vaddr(vaddr) {
            return Err(VmError::NotUserAddress);
        }
        self.address_space(pid)?.pages().insert(vaddr, backing, writable)
    }

    /// Maps `len` bytes of `file` from `offset` at `vaddr`, one page at a
    /// time. The tail of the last page is zero.
    ///
    /// Dirty pages of a `shared` mapping are written back to the file,
    /// otherwise they go to swap and the file is never written.
    pub fn map_file(
        &self,
        pid: Pid,
        vaddr: usize,
        file: Arc<dyn vfs::File>,
        offset: u64,
        len: usize,
        writable: bool,
        shared: bool,
    ) -> Result<(), VmError> {
        if !is_page_aligned(vaddr) {
            return Err(VmError::Misaligned);
        }
        let end = vaddr.checked_add(len).ok_or(VmError::NotUserAddress)?;
        if !is_user_vaddr(vaddr) || end > OFFSET {
            return Err(VmError::NotUserAddress);
        }
        let space = self.address_space(pid)?;
        let pages = (vaddr..end).step_by(PAGE_FRAME_SIZE);
        if pages.clone().any(|page| space.pages().contains(page)) {
            return Err(VmError::AlreadyMapped);
        }

        for page in pages {
            let start = page - vaddr;
            let region = FileRegion {
                file: file.clone(),
                offset: offset + start as u64,
                read_bytes: (len - start).min(PAGE_FRAME_SIZE),
                write_back: shared,
            };
            space.pages().insert(page, Backing::File(region), writable)?;
        }
        debug!("pid {pid}: mapped {len} bytes of file at {vaddr:#x}");
        Ok(())
    }

    /// Removes the pages overlapping `[vaddr, vaddr + len)`, writing dirty
    /// shared file pages back first. Pages that were never mapped are
    /// ignored.
    pub fn unmap(&self, pid: Pid, vaddr: usize, len: usize) -> Result<(), VmError> {
        let end = vaddr.checked_add(len).ok_or(VmError::NotUserAddress)?;
        if !is_user_vaddr(vaddr) || end > OFFSET {
            return Err(VmError::NotUserAddress);
        }
        let space = self.address_space(pid)?;
        for page in (page_round_down(vaddr)..end).step_by(PAGE_FRAME_SIZE) {
            if let Some(desc) = space.pages().lookup(page) {
                self.destroy_page(&space, &desc);
            }
        }
        Ok(())
    }

    /// Makes the page at `vaddr` resident and returns it pinned.
    ///
    /// Loading a resident page does no I/O. A page the caller already has
    /// pinned comes back with `newly_pinned` unset, since pins do not nest.
    pub fn load(&self, pid: Pid, vaddr: usize) -> Result<Resident, VmError> {
        let space = self.address_space(pid)?;
        let vaddr = page_round_down(vaddr);
        let desc = space.pages().lookup(vaddr).ok_or(VmError::NotMapped)?;
        self.load_page(&space, &desc)
    }

    pub(crate) fn load_page(
        &self,
        space: &AddressSpace,
        desc: &PageDescriptor,
    ) -> Result<Resident, VmError> {
        let pid = space.pid();
        let resident = |frame, newly_pinned| Resident {
            pid,
            vaddr: desc.vaddr(),
            frame,
            newly_pinned,
        };
        while let Some(frame) = desc.frame() {
            if self.frames.is_pinned_by(frame, pid) {
                return Ok(resident(frame, false));
            }
            self.frames.pin(frame, pid);
            // It may have been evicted while we waited.
            if desc.frame() == Some(frame) {
                return Ok(resident(frame, true));
            }
            self.frames.unpin(frame, pid);
        }

        let key = PageKey {
            pid,
            vaddr: desc.vaddr(),
        };
        let frame = self.acquire_frame(key)?;
        // SAFETY: the frame is pinned by us.
        let page = unsafe { self.frames.frame_mut(frame) };
        let backing = match self.populate(desc.backing(), page) {
            Ok(backing) => backing,
            Err(err) => {
                debug!("pid {pid}: loading {:#x} failed: {err}", key.vaddr);
                self.frames.release(frame, pid);
                return Err(err);
            }
        };

        {
            let mut state = desc.state();
            state.backing = backing;
            state.frame = Some(frame);
        }
        self.frames.set_resident(frame, Some(key));
        let mapped = space.pagedir().map(key.vaddr, frame, desc.writable());
        assert!(mapped, "pid {pid}: {:#x} mapped while not resident", key.vaddr);
        trace!("pid {pid}: {:#x} -> frame {frame}", key.vaddr);
        Ok(resident(frame, true))
    }

    /// Fills a frame from `backing`, returning what backs the page once it is
    /// resident.
    fn populate(&self, backing: Backing, page: &mut Frame) -> Result<Backing, VmError> {
        match backing {
            Backing::Zero => {
                page.fill(0);
                Ok(Backing::Zero)
            }
            Backing::File(region) => {
                let read = region.file.read_at(region.offset, &mut page[..region.read_bytes])?;
                if read != region.read_bytes {
                    return Err(VmError::ShortTransfer);
                }
                page[region.read_bytes..].fill(0);
                Ok(Backing::File(region))
            }
            Backing::Swap(slot) => {
                self.swap.swap_in(slot, page)?;
                Ok(Backing::Anonymous)
            }
            Backing::Anonymous => panic!("anonymous page is not resident"),
        }
    }

    /// Finds a frame for `key`, evicting if there is no free one. The frame
    /// comes back pinned and empty.
    fn acquire_frame(&self, key: PageKey) -> Result<FrameId, VmError> {
        let mut failure = VmError::OutOfMemory;
        for _ in 0..2 {
            if let Some(frame) = self.frames.try_claim_free(key.pid) {
                return Ok(frame);
            }
            match self.evict_one(key.pid) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => failure = VmError::OutOfMemory,
                Err(err) => failure = err,
            }
        }
        warn!("pid {}: no frame for {:#x}: {failure}", key.pid, key.vaddr);
        Err(failure)
    }

    /// Runs the clock and empties the victim, which stays pinned by `pid`.
    fn evict_one(&self, pid: Pid) -> Result<Option<FrameId>, VmError> {
        let victim = self.frames.select_victim(pid, |key| self.test_and_clear_accessed(key));
        let Some((frame, resident)) = victim else {
            return Ok(None);
        };
        if let Some(key) = resident {
            if let Err(err) = self.evict_frame(frame, key) {
                self.frames.unpin(frame, pid);
                return Err(err);
            }
        }
        Ok(Some(frame))
    }

    fn test_and_clear_accessed(&self, key: PageKey) -> bool {
        let Some(space) = self.spaces.get(key.pid) else {
            // Being torn down; leave it to its owner.
            return true;
        };
        let accessed = space.pagedir().is_accessed(key.vaddr);
        if accessed {
            space.pagedir().set_accessed(key.vaddr, false);
        }
        accessed
    }

    /// Moves the page living in `frame` out to its backing store. The caller
    /// holds the frame's pin, which it keeps.
    fn evict_frame(&self, frame: FrameId, key: PageKey) -> Result<(), VmError> {
        let space = self.spaces.get(key.pid);
        let desc = space.as_ref().and_then(|space| space.pages().lookup(key.vaddr));
        let (Some(space), Some(desc)) = (space, desc) else {
            panic!("frame {frame} holds {key:?}, which has no descriptor");
        };
        debug_assert_eq!(desc.frame(), Some(frame));

        let pagedir = space.pagedir();
        pagedir.unmap(key.vaddr);
        let dirty = pagedir.is_dirty(key.vaddr);
        // SAFETY: the caller holds the frame's pin.
        let page = unsafe { self.frames.frame(frame) };
        let backing = match self.persist(desc.backing(), dirty, page) {
            Ok(backing) => backing,
            Err(err) => {
                pagedir.map(key.vaddr, frame, desc.writable());
                pagedir.set_dirty(key.vaddr, dirty);
                warn!("pid {}: evicting {:#x} failed: {err}", key.pid, key.vaddr);
                return Err(err);
            }
        };
        debug!(
            "evicted pid {} {:#x} from frame {frame} ({backing:?})",
            key.pid, key.vaddr
        );

        {
            let mut state = desc.state();
            state.backing = backing;
            state.frame = None;
        }
        self.frames.set_resident(frame, None);
        self.evictions.fetch_add(1, Relaxed);
        Ok(())
    }

    /// Saves a frame's content where it can be loaded from again and returns
    /// the page's new backing.
    fn persist(&self, backing: Backing, dirty: bool, page: &Frame) -> Result<Backing, VmError> {
        match backing {
            Backing::File(region) if region.write_back => {
                if dirty {
                    Self::write_back(&region, page)?;
                }
                Ok(Backing::File(region))
            }
            backing @ (Backing::Zero | Backing::File(_)) if !dirty => Ok(backing),
            _ => Ok(Backing::Swap(self.swap.swap_out(page)?)),
        }
    }

    fn write_back(region: &FileRegion, page: &Frame) -> Result<(), VmError> {
        let written = region.file.write_at(region.offset, &page[..region.read_bytes])?;
        if written != region.read_bytes {
            return Err(VmError::ShortTransfer);
        }
        Ok(())
    }

    /// Evicts the page at `vaddr` if it is resident and not pinned by its
    /// owner. Returns whether it was evicted.
    pub fn evict(&self, pid: Pid, vaddr: usize) -> Result<bool, VmError> {
        let space = self.address_space(pid)?;
        let vaddr = page_round_down(vaddr);
        let desc = space.pages().lookup(vaddr).ok_or(VmError::NotMapped)?;
        let Some(frame) = desc.frame() else {
            return Ok(false);
        };
        if self.frames.is_pinned_by(frame, pid) {
            return Ok(false);
        }
        self.frames.pin(frame, pid);
        if desc.frame() != Some(frame) {
            self.frames.unpin(frame, pid);
            return Ok(false);
        }
        let evicted = self.evict_frame(frame, PageKey { pid, vaddr });
        self.frames.unpin(frame, pid);
        evicted.map(|()| true)
    }

    /// Drops a page, flushing it to its file if needed and giving back its
    /// frame and swap slot.
    fn destroy_page(&self, space: &AddressSpace, desc: &PageDescriptor) {
        let pid = space.pid();
        let vaddr = desc.vaddr();
        let mut frame = None;
        while let Some(id) = desc.frame() {
            let held = self.frames.is_pinned_by(id, pid);
            if !held {
                self.frames.pin(id, pid);
            }
            if desc.frame() == Some(id) {
                frame = Some(id);
                break;
            }
            if !held {
                self.frames.unpin(id, pid);
            }
        }

        if let Some(id) = frame {
            let pagedir = space.pagedir();
            pagedir.unmap(vaddr);
            if let Backing::File(region) = desc.backing() {
                if region.write_back && pagedir.is_dirty(vaddr) {
                    // SAFETY: the frame is pinned by us.
                    let page = unsafe { self.frames.frame(id) };
                    if let Err(err) = Self::write_back(&region, page) {
                        warn!("pid {pid}: lost write-back of {vaddr:#x}: {err}");
                    }
                }
            }
        }

        space.pages().remove(vaddr);
        let backing = {
            let mut state = desc.state();
            state.frame = None;
            core::mem::replace(&mut state.backing, Backing::Zero)
        };
        if let Some(id) = frame {
            self.frames.release(id, pid);
        }
        if let Backing::Swap(slot) = backing {
            self.swap.free_slot(slot);
        }
    }

    /// Frees everything `pid` holds: frames, swap slots and the address
    /// space itself.
    pub fn teardown(&self, pid: Pid) {
        let Some(space) = self.spaces.get(pid) else {
            return;
        };
        let pages = space.pages().pages();
        for desc in &pages {
            self.destroy_page(&space, desc);
        }
        self.spaces.remove(pid);
        debug!("pid {pid}: address space torn down ({} pages)", pages.len());
    }

    pub fn stats(&self) -> VmStats {
        let (swap_reads, swap_writes) = self.swap.device_io();
        VmStats {
            frames: self.frames.len(),
            frames_in_use: self.frames.frames_in_use(),
            swap_slots: self.swap.slots(),
            swap_slots_used: self.swap.used_slots(),
            swap_reads,
            swap_writes,
            evictions: self.evictions.load(Relaxed),
        }
    }
}
