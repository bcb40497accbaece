// https://wiki.osdev.org/Paging

use arbitrary_int::u20;
use bitbybit::bitfield;

/// A 32-bit x86 page table entry.
///
/// The hardware sets `accessed` whenever the page is read or written through
/// this entry and `dirty` whenever it is written. Clearing `present` leaves
/// both bits readable, which is what the evictor relies on.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user mapping of frame number `frame`.
    pub fn user_mapping(frame: u32, writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(u20::new(frame))
    }

    pub fn frame_number(&self) -> u32 {
        self.page_frame_address().value()
    }
}
