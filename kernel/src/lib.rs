#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod vfs;

use alloc::boxed::Box;
use alloc::sync::Arc;
use block::block_core::Block;
use log::info;
use mem::{VirtualMemory, VmConfig};
use once_cell::race::OnceBox;
use sync::Scheduler;

static VM: OnceBox<VirtualMemory> = OnceBox::new();

/// Sets up the kernel's paging service. Only the first call does anything;
/// later calls get the existing service back and drop their arguments.
pub fn init(
    config: VmConfig,
    swap_device: Block,
    scheduler: Arc<dyn Scheduler>,
) -> &'static VirtualMemory {
    VM.get_or_init(|| {
        info!("initializing virtual memory");
        Box::new(VirtualMemory::with_scheduler(config, swap_device, scheduler))
    })
}

/// Boot path on bare metal: brings up the serial log, then paging.
///
/// # Safety
///
/// Must be called once, during early boot, before any other thread runs.
#[cfg(target_os = "none")]
pub unsafe fn boot(
    config: VmConfig,
    swap_device: Block,
    scheduler: Arc<dyn Scheduler>,
    max_level: log::LevelFilter,
) -> &'static VirtualMemory {
    // A logger installed earlier stays in place.
    let _ = kidneyos_shared::logger::SerialLogger::init(max_level);
    init(config, swap_device, scheduler)
}

/// The paging service, if [`init`] has run.
pub fn vm() -> Option<&'static VirtualMemory> {
    VM.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use block::block_core::BlockType;
    use drivers::ram_disk::RamDisk;
    use kidneyos_shared::mem::SECTORS_PER_PAGE;
    use sync::ThreadYield;

    fn swap_device() -> Block {
        let sectors = 4 * SECTORS_PER_PAGE;
        Block::new(BlockType::Swap, "swap", sectors, Box::new(RamDisk::new(sectors)))
    }

    #[test]
    fn init_only_once() {
        let config = VmConfig {
            frames: 8,
            ..VmConfig::default()
        };
        let first = init(config, swap_device(), Arc::new(ThreadYield));
        let again = init(VmConfig::default(), swap_device(), Arc::new(ThreadYield));
        assert!(core::ptr::eq(first, again));
        assert_eq!(again.config().frames, 8);
        assert!(vm().is_some_and(|vm| core::ptr::eq(vm, first)));
    }
}
