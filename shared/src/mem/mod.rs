use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

#[allow(clippy::cast_possible_truncation)]
pub const SECTORS_PER_PAGE: u32 = PAGE_FRAME_SIZE as u32 / SECTOR_SIZE;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

// User stacks grow down from just below the kernel.
pub const USER_STACK_TOP: usize = OFFSET;
pub const STACK_MAX: usize = 8 * MB;

// A push may touch memory this far below the stack pointer before the stack
// pointer itself is moved (`pusha` writes 32 bytes).
pub const STACK_SLACK: usize = 32;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

/// Returns whether `addr` may be touched by a user program: it has to be
/// below the kernel and outside of the never-mapped null page.
#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr >= PAGE_FRAME_SIZE && addr < OFFSET
}
