use super::{Pid, Terminate, VirtualMemory, VmError};
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use kidneyos_shared::mem::{page_offset, PAGE_FRAME_SIZE};

impl VirtualMemory {
    /// Copies `buf.len()` bytes of user memory at `src` into `buf`.
    ///
    /// Each page is validated (and brought in) before it is read, and stays
    /// pinned while it is being copied.
    pub fn copy_from_user(
        &self,
        pid: Pid,
        esp: usize,
        src: usize,
        buf: &mut [u8],
    ) -> Result<(), Terminate> {
        self.for_each_user_chunk(pid, esp, src, buf.len(), false, |page, range| {
            buf[range].copy_from_slice(page);
        })
    }

    /// Like [`Self::copy_from_user`] but allocates the buffer.
    pub fn read_user(
        &self,
        pid: Pid,
        esp: usize,
        src: usize,
        count: usize,
    ) -> Result<Vec<u8>, Terminate> {
        let mut bytes = vec![0; count];
        self.copy_from_user(pid, esp, src, &mut bytes)?;
        Ok(bytes)
    }

    /// Copies `data` to user memory at `dst`, dirtying the pages it touches.
    pub fn copy_to_user(
        &self,
        pid: Pid,
        esp: usize,
        dst: usize,
        data: &[u8],
    ) -> Result<(), Terminate> {
        self.for_each_user_chunk(pid, esp, dst, data.len(), true, |page, range| {
            page.copy_from_slice(&data[range]);
        })
    }

    fn for_each_user_chunk(
        &self,
        pid: Pid,
        esp: usize,
        start: usize,
        count: usize,
        write: bool,
        mut copy: impl FnMut(&mut [u8], Range<usize>),
    ) -> Result<(), Terminate> {
        if start.checked_add(count).is_none() {
            return Err(Terminate::new(pid, start, VmError::NotUserAddress));
        }
        let mut done = 0;
        while done < count {
            let vaddr = start + done;
            let at = page_offset(vaddr);
            let len = (PAGE_FRAME_SIZE - at).min(count - done);

            let resident = self.fault_or_validate(pid, vaddr, esp, write)?;
            if let Ok(space) = self.address_space(pid) {
                space.pagedir().record_access(vaddr, write);
            }
            // SAFETY: the page stays pinned by `pid` until `unpin` below.
            let frame = unsafe { self.frames().frame_mut(resident.frame) };
            copy(&mut frame[at..at + len], done..done + len);
            self.unpin(resident);

            done += len;
        }
        Ok(())
    }
}
