//! The swap store: page-sized slots on a block device.

pub mod page_replacement;

use crate::block::block_core::{Block, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::sync::{Mutex, MutexGuard, Scheduler};
use alloc::sync::Arc;
use kidneyos_shared::bit_array::Bitmap;
use kidneyos_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};
use log::{info, warn};
use thiserror::Error;

/// Index of a page-sized region of the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn first_sector(self) -> BlockSector {
        // The bitmap is sized from a `BlockSector`, so this cannot overflow.
        self.0 as BlockSector * SECTORS_PER_PAGE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SwapError {
    #[error("swap space is full")]
    Full,
    #[error("swap device: {0}")]
    Block(#[from] BlockError),
}

/// Swap space on a block device.
///
/// The bitmap lock only covers slot bookkeeping; transfers are ordered by the
/// device lock, so a long transfer does not hold up allocation or release of
/// other slots. A slot belongs to exactly one page between `swap_out` and
/// `swap_in`/`free_slot`, which is what makes it safe to touch its sectors
/// without the bitmap lock.
pub struct SwapSpace {
    bitmap: Mutex<Bitmap>,
    device: Mutex<Block>,
    scheduler: Arc<dyn Scheduler>,
}

impl SwapSpace {
    pub fn new(device: Block, scheduler: Arc<dyn Scheduler>) -> Self {
        if device.get_type() != BlockType::Swap {
            warn!("using {} device \"{}\" for swap", device.get_type(), device.get_name());
        }
        let slots = (device.get_size() / SECTORS_PER_PAGE) as usize;
        info!("swap: {device}, {slots} page slots");

        Self {
            bitmap: Mutex::new(Bitmap::new(slots)),
            device: Mutex::new(device),
            scheduler,
        }
    }

    /// The device is held across transfers, so waiters yield instead of
    /// spinning.
    fn device(&self) -> MutexGuard<'_, Block> {
        self.device.lock_or_wait(|| self.scheduler.yield_now())
    }

    pub fn alloc_slot(&self) -> Result<SwapSlot, SwapError> {
        self.bitmap
            .lock()
            .scan_and_flip()
            .map(SwapSlot)
            .ok_or(SwapError::Full)
    }

    /// Returns a slot whose content is no longer needed.
    pub fn free_slot(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        assert!(bitmap.test(slot.0), "freeing unused swap slot {}", slot.0);
        bitmap.set(slot.0, false);
    }

    /// Reads the page stored in `slot` into `page` and frees the slot.
    ///
    /// On failure the slot still holds the page.
    pub fn swap_in(
        &self,
        slot: SwapSlot,
        page: &mut [u8; PAGE_FRAME_SIZE],
    ) -> Result<(), SwapError> {
        assert!(self.is_slot_used(slot), "swap slot {} holds no page", slot.0);
        {
            let mut device = self.device();
            for (sector, buf) in (slot.first_sector()..).zip(page.chunks_mut(BLOCK_SECTOR_SIZE)) {
                device.read(sector, buf)?;
            }
        }
        self.free_slot(slot);
        Ok(())
    }

    /// Writes `page` to a newly allocated slot.
    pub fn swap_out(&self, page: &[u8; PAGE_FRAME_SIZE]) -> Result<SwapSlot, SwapError> {
        let slot = self.alloc_slot()?;
        let written = {
            let mut device = self.device();
            (slot.first_sector()..)
                .zip(page.chunks(BLOCK_SECTOR_SIZE))
                .try_for_each(|(sector, buf)| device.write(sector, buf))
        };
        if let Err(err) = written {
            self.free_slot(slot);
            return Err(err.into());
        }
        Ok(slot)
    }

    pub fn is_slot_used(&self, slot: SwapSlot) -> bool {
        self.bitmap.lock().test(slot.0)
    }

    pub fn slots(&self) -> usize {
        self.bitmap.lock().len()
    }

    pub fn used_slots(&self) -> usize {
        self.bitmap.lock().count_ones()
    }

    /// `(reads, writes)` of whole sectors done by the swap device.
    pub fn device_io(&self) -> (u32, u32) {
        let device = self.device();
        (device.read_count(), device.write_count())
    }
}
