//! Page faults and validation of user addresses handed to system calls.

use super::page_table::Backing;
use super::{FrameId, Pid, VirtualMemory, VmError};
use bitbybit::bitfield;
use kidneyos_shared::mem::{is_user_vaddr, page_round_down};
use log::{trace, warn};
use thiserror::Error;

/// Exit status of a process killed by a bad memory access.
pub const EXIT_FAULT: i32 = -1;

/// The error code pushed by the CPU on a page fault.
#[bitfield(u32, default = 0)]
pub struct PageFaultError {
    /// Clear if the page was not present.
    #[bit(0, rw)]
    protection_violation: bool,
    #[bit(1, rw)]
    write: bool,
    /// The fault happened in user mode.
    #[bit(2, rw)]
    user: bool,
}

/// A page that is resident and pinned by `pid` until [`VirtualMemory::unpin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resident {
    pub pid: Pid,
    /// Page-aligned.
    pub vaddr: usize,
    pub frame: FrameId,
    /// Whether this call took the pin. A page the caller had already pinned
    /// stays pinned through [`VirtualMemory::unpin`].
    pub newly_pinned: bool,
}

/// The process has to be killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("pid {pid} terminated with status {status}: {cause}")]
pub struct Terminate {
    pub pid: Pid,
    pub status: i32,
    pub cause: VmError,
}

impl Terminate {
    pub(super) fn new(pid: Pid, vaddr: usize, cause: VmError) -> Self {
        warn!("pid {pid}: bad access to {vaddr:#x}: {cause}");
        Self {
            pid,
            status: EXIT_FAULT,
            cause,
        }
    }
}

impl VirtualMemory {
    /// Makes `vaddr` resident for an access by `pid`, growing the stack if
    /// the access looks like a push. `esp` is the user stack pointer at the
    /// time of the access.
    ///
    /// The page comes back pinned; the caller unpins it when done.
    pub fn fault_or_validate(
        &self,
        pid: Pid,
        vaddr: usize,
        esp: usize,
        write: bool,
    ) -> Result<Resident, Terminate> {
        self.resolve(pid, vaddr, esp, write)
            .map_err(|cause| Terminate::new(pid, vaddr, cause))
    }

    fn resolve(
        &self,
        pid: Pid,
        vaddr: usize,
        esp: usize,
        write: bool,
    ) -> Result<Resident, VmError> {
        if !is_user_vaddr(vaddr) {
            return Err(VmError::NotUserAddress);
        }
        let space = self.address_space(pid)?;
        let page = page_round_down(vaddr);
        let desc = match space.pages().lookup(page) {
            Some(desc) => desc,
            None => {
                self.check_stack_access(vaddr, esp)?;
                space.pages().insert(page, Backing::Zero, true)?
            }
        };
        if write && !desc.writable() {
            return Err(VmError::ReadOnly);
        }
        self.load_page(&space, &desc)
    }

    /// Accepts accesses at most `stack_slack` bytes below `esp` that keep the
    /// stack within `stack_max`.
    fn check_stack_access(&self, vaddr: usize, esp: usize) -> Result<(), VmError> {
        let config = self.config();
        if vaddr < esp.saturating_sub(config.stack_slack) || vaddr >= config.user_stack_top {
            return Err(VmError::NotMapped);
        }
        if config.user_stack_top - page_round_down(vaddr) > config.stack_max {
            return Err(VmError::StackOverflow);
        }
        Ok(())
    }

    /// Handles a fault taken by `pid` in user mode. The faulting access is
    /// replayed against the new mapping before the page is unpinned.
    pub fn handle_page_fault(
        &self,
        pid: Pid,
        vaddr: usize,
        esp: usize,
        write: bool,
    ) -> Result<(), Terminate> {
        let resident = self.fault_or_validate(pid, vaddr, esp, write)?;
        if let Ok(space) = self.address_space(pid) {
            space.pagedir().record_access(vaddr, write);
        }
        self.unpin(resident);
        Ok(())
    }

    /// Entry point for the page fault interrupt. `cr2` is the faulting
    /// address and `esp` the user stack pointer, which for a fault taken in
    /// kernel mode is the one saved on entry to the system call.
    pub fn page_fault_interrupt(
        &self,
        pid: Pid,
        cr2: usize,
        esp: usize,
        error: PageFaultError,
    ) -> Result<(), Terminate> {
        trace!(
            "pid {pid}: page fault at {cr2:#x} ({:#x}, user: {})",
            error.raw_value(),
            error.user()
        );
        self.handle_page_fault(pid, cr2, esp, error.write())
    }

    /// Pins an already mapped page for a system call. Unlike a fault this
    /// never grows the stack.
    pub fn pin_page(&self, pid: Pid, vaddr: usize, write: bool) -> Result<Resident, VmError> {
        if !is_user_vaddr(vaddr) {
            return Err(VmError::NotUserAddress);
        }
        let space = self.address_space(pid)?;
        let desc = space
            .pages()
            .lookup(page_round_down(vaddr))
            .ok_or(VmError::NotMapped)?;
        if write && !desc.writable() {
            return Err(VmError::ReadOnly);
        }
        self.load(pid, vaddr)
    }

    /// Releases the pin `resident` took, if any.
    pub fn unpin(&self, resident: Resident) {
        if resident.newly_pinned {
            self.frames().unpin(resident.frame, resident.pid);
        }
    }
}
