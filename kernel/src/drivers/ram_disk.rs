use crate::block::block_core::{Block, BlockOp, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::{boxed::Box, vec, vec::Vec};
use kidneyos_shared::sizes::SWAP_SECTORS;

/// A block device kept entirely in kernel memory. Used as the swap device
/// when no disk is attached, and by the tests.
pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
        }
    }

    /// A swap device of the default size.
    pub fn swap_block() -> Block {
        Block::new(
            BlockType::Swap,
            "ramswap",
            SWAP_SECTORS,
            Box::new(Self::new(SWAP_SECTORS)),
        )
    }

    fn range(&self, sector: BlockSector) -> Result<core::ops::Range<usize>, BlockError> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        if start + BLOCK_SECTOR_SIZE > self.data.len() {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(start..start + BLOCK_SECTOR_SIZE)
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}
