use super::fault::PageFaultError;
use super::page_table::{Backing, FileRegion};
use super::*;
use crate::block::block_core::test::block_from_file;
use crate::block::block_core::{BlockOp, BlockSector, BlockType};
use crate::drivers::ram_disk::RamDisk;
use crate::vfs::mem_file::MemFile;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::AtomicBool;
use kidneyos_shared::mem::SECTORS_PER_PAGE;
use std::io::{Cursor, Read};

const DATA: usize = 0x0804_8000;
const ESP: usize = USER_STACK_TOP - 0x100;

fn vm_with(frames: usize, swap_slots: u32) -> VirtualMemory {
    let sectors = swap_slots * SECTORS_PER_PAGE;
    let swap = Block::new(
        BlockType::Swap,
        "swap",
        sectors,
        Box::new(RamDisk::new(sectors)),
    );
    VirtualMemory::new(
        VmConfig {
            frames,
            ..VmConfig::default()
        },
        swap,
    )
}

fn page(n: usize) -> usize {
    DATA + n * PAGE_FRAME_SIZE
}

fn pattern(seed: u8) -> Vec<u8> {
    (0..PAGE_FRAME_SIZE)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Open a gzip-compressed program image.
fn open_img_gz(path: &str) -> Vec<u8> {
    let file = std::fs::File::open(path).unwrap();
    let mut gz_decoder = flate2::read::GzDecoder::new(file);
    let mut buf = vec![];
    gz_decoder.read_to_end(&mut buf).unwrap();
    buf
}

/// Every resident descriptor names a frame that names it back, and the
/// other way around.
fn assert_consistent(vm: &VirtualMemory) {
    let mut resident = 0;
    for pid in vm.spaces.pids() {
        let space = vm.address_space(pid).unwrap();
        for desc in space.pages().pages() {
            let Some(frame) = desc.frame() else {
                assert_eq!(space.pagedir().translate(desc.vaddr()), None);
                continue;
            };
            resident += 1;
            let key = PageKey {
                pid,
                vaddr: desc.vaddr(),
            };
            assert_eq!(vm.frames.resident(frame), Some(key));
            assert_eq!(space.pagedir().translate(desc.vaddr()), Some(frame));
        }
    }
    for frame in 0..vm.frames.len() {
        if let Some(key) = vm.frames.resident(frame) {
            let space = vm.address_space(key.pid).unwrap();
            let desc = space.pages().lookup(key.vaddr).unwrap();
            assert_eq!(desc.frame(), Some(frame));
        }
    }
    assert_eq!(vm.frames.frames_in_use(), resident);
}

fn backing_of(vm: &VirtualMemory, pid: Pid, vaddr: usize) -> Backing {
    vm.address_space(pid)
        .unwrap()
        .pages()
        .lookup(vaddr)
        .unwrap()
        .backing()
}

#[test]
fn zero_page_on_first_touch() {
    let vm = vm_with(4, 4);
    vm.create_address_space(1);
    vm.insert_page(1, page(0), Backing::Zero, true).unwrap();

    assert_eq!(vm.read_user(1, ESP, page(0) + 7, 64).unwrap(), vec![0; 64]);
    assert_eq!(vm.stats().frames_in_use, 1);
    assert_consistent(&vm);
}

#[test]
fn insert_checks_address() {
    let vm = vm_with(1, 1);
    vm.create_address_space(1);
    assert_eq!(
        vm.insert_page(1, page(0) + 1, Backing::Zero, true).err(),
        Some(VmError::Misaligned)
    );
    assert_eq!(
        vm.insert_page(1, OFFSET, Backing::Zero, true).err(),
        Some(VmError::NotUserAddress)
    );
    assert_eq!(
        vm.insert_page(1, 0, Backing::Zero, true).err(),
        Some(VmError::NotUserAddress)
    );
    assert_eq!(
        vm.insert_page(2, page(0), Backing::Zero, true).err(),
        Some(VmError::NoAddressSpace(2))
    );
    vm.insert_page(1, page(0), Backing::Zero, true).unwrap();
    assert_eq!(
        vm.insert_page(1, page(0), Backing::Anonymous, true).err(),
        Some(VmError::AlreadyMapped)
    );
}

#[test]
fn loading_a_resident_page_does_nothing() {
    let vm = vm_with(2, 2);
    let file = Arc::new(MemFile::new(pattern(3)));
    vm.create_address_space(1);
    vm.map_file(1, page(0), file.clone(), 0, PAGE_FRAME_SIZE, false, false)
        .unwrap();

    let first = vm.load(1, page(0)).unwrap();
    vm.unpin(first);
    let before = vm.stats();
    assert_eq!(file.reads(), 1);

    let second = vm.load(1, page(0) + 123).unwrap();
    assert_eq!(second, first);
    assert_eq!(file.reads(), 1);
    assert_eq!(vm.stats(), before);
    vm.unpin(second);
}

#[test]
fn dirty_anonymous_page_round_trips_through_swap() {
    let vm = vm_with(1, 4);
    vm.create_address_space(1);
    vm.insert_page(1, page(0), Backing::Zero, true).unwrap();
    vm.insert_page(1, page(1), Backing::Zero, true).unwrap();

    vm.copy_to_user(1, ESP, page(0), &pattern(1)).unwrap();
    // Only one frame, so this pushes page 0 out.
    assert_eq!(vm.read_user(1, ESP, page(1), 16).unwrap(), vec![0; 16]);
    assert!(matches!(backing_of(&vm, 1, page(0)), Backing::Swap(_)));
    assert_eq!(vm.stats().swap_slots_used, 1);
    assert_eq!(vm.stats().swap_writes, SECTORS_PER_PAGE);
    assert_consistent(&vm);

    assert_eq!(
        vm.read_user(1, ESP, page(0), PAGE_FRAME_SIZE).unwrap(),
        pattern(1)
    );
    assert!(matches!(backing_of(&vm, 1, page(0)), Backing::Anonymous));
    // Page 1 was clean zero-fill and was dropped; page 0's slot was consumed.
    assert!(matches!(backing_of(&vm, 1, page(1)), Backing::Zero));
    let stats = vm.stats();
    assert_eq!(stats.swap_slots_used, 0);
    assert_eq!(stats.swap_reads, SECTORS_PER_PAGE);
    assert_eq!(stats.evictions, 2);
    assert_consistent(&vm);
}

#[test]
fn swapped_in_page_goes_back_to_swap_even_when_clean() {
    let vm = vm_with(1, 4);
    vm.create_address_space(1);
    vm.insert_page(1, page(0), Backing::Zero, true).unwrap();
    vm.insert_page(1, page(1), Backing::Zero, true).unwrap();

    vm.copy_to_user(1, ESP, page(0), b"only copy").unwrap();
    assert!(vm.evict(1, page(0)).unwrap());
    assert_eq!(vm.read_user(1, ESP, page(0), 9).unwrap(), b"only copy");

    // Not written since it came back, but swap no longer has it.
    assert!(vm.evict(1, page(0)).unwrap());
    assert!(matches!(backing_of(&vm, 1, page(0)), Backing::Swap(_)));
    assert_eq!(vm.read_user(1, ESP, page(0), 9).unwrap(), b"only copy");
}

#[test]
fn clean_file_page_is_read_again() {
    let vm = vm_with(1, 4);
    let file = Arc::new(MemFile::new(pattern(9)));
    vm.create_address_space(1);
    vm.map_file(1, page(0), file.clone(), 0, PAGE_FRAME_SIZE, false, false)
        .unwrap();
    vm.insert_page(1, page(1), Backing::Zero, true).unwrap();

    assert_eq!(vm.read_user(1, ESP, page(0), 32).unwrap(), pattern(9)[..32]);
    vm.copy_to_user(1, ESP, page(1), b"evict").unwrap();
    assert_eq!(vm.stats().swap_slots_used, 0);
    assert!(matches!(backing_of(&vm, 1, page(0)), Backing::File(_)));

    assert_eq!(
        vm.read_user(1, ESP, page(0), PAGE_FRAME_SIZE).unwrap(),
        pattern(9)
    );
    assert_eq!(file.reads(), 2);
    assert_eq!(file.writes(), 0);
    // Page 1 was dirty, so it is in swap now.
    assert_eq!(vm.stats().swap_slots_used, 1);
}

#[test]
fn stack_grows_near_the_stack_pointer() {
    let vm = vm_with(4, 4);
    vm.create_address_space(1);

    let resident = vm.fault_or_validate(1, ESP - 32, ESP, true).unwrap();
    assert_eq!(resident.vaddr, page_round_down(ESP - 32));
    assert!(matches!(backing_of(&vm, 1, resident.vaddr), Backing::Zero));
    vm.unpin(resident);

    let far = ESP - PAGE_FRAME_SIZE - 33;
    let err = vm.fault_or_validate(1, far, ESP - PAGE_FRAME_SIZE, true).unwrap_err();
    assert_eq!(err.status, EXIT_FAULT);
    assert_eq!(err.cause, VmError::NotMapped);
}

#[test]
fn stack_stops_at_its_limit() {
    let vm = vm_with(4, 4);
    vm.create_address_space(1);

    let lowest = USER_STACK_TOP - STACK_MAX;
    vm.handle_page_fault(1, lowest, lowest, true).unwrap();

    let below = lowest - 1;
    let err = vm.handle_page_fault(1, below, below, true).unwrap_err();
    assert_eq!(err.cause, VmError::StackOverflow);
    assert_eq!(err.status, -1);
}

#[test]
fn bad_addresses_terminate() {
    let vm = vm_with(2, 2);
    vm.create_address_space(1);

    for vaddr in [0, 0x10, OFFSET, OFFSET + 0x1000, usize::MAX] {
        let err = vm.fault_or_validate(1, vaddr, ESP, false).unwrap_err();
        assert_eq!(err.cause, VmError::NotUserAddress);
        assert_eq!(err.pid, 1);
    }
    let err = vm.handle_page_fault(1, page(5), ESP, false).unwrap_err();
    assert_eq!(err.cause, VmError::NotMapped);
    assert!(vm.copy_to_user(1, ESP, usize::MAX - 2, b"wrap").is_err());
    assert_eq!(vm.stats().frames_in_use, 0);
}

#[test]
fn writing_read_only_page_terminates() {
    let vm = vm_with(2, 2);
    let file = Arc::new(MemFile::new(pattern(0)));
    vm.create_address_space(1);
    vm.map_file(1, page(0), file, 0, PAGE_FRAME_SIZE, false, false)
        .unwrap();

    let err = vm.copy_to_user(1, ESP, page(0), b"no").unwrap_err();
    assert_eq!(err.cause, VmError::ReadOnly);
    assert_eq!(err.status, EXIT_FAULT);
    assert_eq!(vm.pin_page(1, page(0), true), Err(VmError::ReadOnly));
}

#[test]
fn file_region_larger_than_a_page_is_refused() {
    let vm = vm_with(1, 1);
    let file: Arc<dyn vfs::File> = Arc::new(MemFile::new(pattern(2)));
    vm.create_address_space(1);
    let region = FileRegion {
        file,
        offset: 0,
        read_bytes: PAGE_FRAME_SIZE + 1,
        write_back: false,
    };
    assert_eq!(
        vm.insert_page(1, page(0), Backing::File(region), false).err(),
        Some(VmError::RegionTooLarge)
    );
    assert!(vm.address_space(1).unwrap().pages().is_empty());
}

#[test]
fn copies_keep_a_system_call_pin() {
    let vm = vm_with(2, 2);
    vm.create_address_space(1);
    vm.insert_page(1, page(0), Backing::Zero, true).unwrap();

    let pinned = vm.pin_page(1, page(0), true).unwrap();
    assert!(pinned.newly_pinned);
    vm.copy_to_user(1, ESP, page(0), b"buffer").unwrap();
    assert!(vm.frames.is_pinned_by(pinned.frame, 1));
    vm.handle_page_fault(1, page(0) + 8, ESP, true).unwrap();
    assert!(vm.frames.is_pinned_by(pinned.frame, 1));
    assert_eq!(vm.read_user(1, ESP, page(0), 6).unwrap(), b"buffer");
    assert!(vm.frames.is_pinned_by(pinned.frame, 1));
    assert!(!vm.evict(1, page(0)).unwrap());

    let again = vm.load(1, page(0)).unwrap();
    assert!(!again.newly_pinned);
    vm.unpin(again);
    assert!(vm.frames.is_pinned_by(pinned.frame, 1));

    vm.unpin(pinned);
    assert!(!vm.frames.is_pinned(pinned.frame));
    assert!(vm.evict(1, page(0)).unwrap());
    assert_eq!(vm.read_user(1, ESP, page(0), 6).unwrap(), b"buffer");
}

#[test]
fn pinned_frames_are_never_evicted() {
    let vm = vm_with(2, 4);
    vm.create_address_space(1);
    for n in 0..3 {
        vm.insert_page(1, page(n), Backing::Zero, true).unwrap();
    }
    vm.copy_to_user(1, ESP, page(0), &pattern(1)).unwrap();
    vm.copy_to_user(1, ESP, page(1), &pattern(2)).unwrap();

    let a = vm.pin_page(1, page(0), false).unwrap();
    let b = vm.pin_page(1, page(1), false).unwrap();
    let err = vm.fault_or_validate(1, page(2), ESP, false).unwrap_err();
    assert_eq!(err.cause, VmError::OutOfMemory);
    assert!(!vm.evict(1, page(0)).unwrap());
    assert_eq!(vm.stats().swap_slots_used, 0);
    assert_consistent(&vm);

    // SAFETY: both frames are pinned by this test.
    unsafe {
        assert_eq!(vm.frames.frame(a.frame)[..], pattern(1)[..]);
        assert_eq!(vm.frames.frame(b.frame)[..], pattern(2)[..]);
    }
    vm.unpin(a);
    vm.unpin(b);

    vm.handle_page_fault(1, page(2), ESP, true).unwrap();
    assert_eq!(vm.stats().swap_slots_used, 1);
    assert_consistent(&vm);
}

#[test]
fn other_processes_pages_are_evicted() {
    let vm = vm_with(3, 8);
    let image = Arc::new(MemFile::new(open_img_gz("tests/vm/program.img.gz")));
    let expected = image.contents();
    assert_eq!(expected.len(), 2 * PAGE_FRAME_SIZE + PAGE_FRAME_SIZE / 2);

    vm.create_address_space(1);
    vm.map_file(1, page(0), image.clone(), 0, expected.len(), false, false)
        .unwrap();
    for n in 0..3 {
        vm.handle_page_fault(1, page(n), ESP, false).unwrap();
    }
    assert_eq!(image.reads(), 3);
    let last = vm.read_user(1, ESP, page(2), PAGE_FRAME_SIZE).unwrap();
    assert_eq!(last[..PAGE_FRAME_SIZE / 2], expected[2 * PAGE_FRAME_SIZE..]);
    assert!(last[PAGE_FRAME_SIZE / 2..].iter().all(|&b| b == 0));
    assert_consistent(&vm);

    vm.create_address_space(2);
    for n in 0..3 {
        vm.insert_page(2, page(n), Backing::Zero, true).unwrap();
        vm.copy_to_user(2, ESP, page(n), &pattern(n as u8)).unwrap();
    }
    // A's pages were clean file pages: dropped without touching swap.
    let stats = vm.stats();
    assert_eq!(stats.swap_slots_used, 0);
    assert_eq!(stats.swap_writes, 0);
    assert_eq!(stats.evictions, 3);
    for n in 0..3 {
        assert_eq!(vm.address_space(1).unwrap().pages().lookup(page(n)).unwrap().frame(), None);
    }
    assert_consistent(&vm);

    // A comes back and pushes out one of B's dirty pages.
    assert_eq!(
        vm.read_user(1, ESP, page(0), PAGE_FRAME_SIZE).unwrap(),
        expected[..PAGE_FRAME_SIZE]
    );
    assert_eq!(image.reads(), 4);
    assert_eq!(vm.stats().swap_slots_used, 1);
    assert_consistent(&vm);

    for n in 0..3 {
        assert_eq!(
            vm.read_user(2, ESP, page(n), PAGE_FRAME_SIZE).unwrap(),
            pattern(n as u8)
        );
    }
    assert_consistent(&vm);
    assert_eq!(image.writes(), 0);

    vm.teardown(1);
    vm.teardown(2);
    assert_eq!(vm.stats().swap_slots_used, 0);
    assert_eq!(vm.stats().frames_in_use, 0);
}

#[test]
fn short_file_read_aborts_the_load() {
    let vm = vm_with(2, 2);
    let file: Arc<dyn vfs::File> = Arc::new(MemFile::new(vec![7; 100]));
    vm.create_address_space(1);
    let region = FileRegion {
        file,
        offset: 0,
        read_bytes: 200,
        write_back: false,
    };
    vm.insert_page(1, page(0), Backing::File(region), false)
        .unwrap();

    let err = vm.fault_or_validate(1, page(0), ESP, false).unwrap_err();
    assert_eq!(err.cause, VmError::ShortTransfer);
    assert_eq!(vm.stats().frames_in_use, 0);
    // The frame was given back unpinned.
    assert!((0..2).all(|frame| !vm.frames.is_pinned(frame)));
    assert_consistent(&vm);
}

/// A RAM disk whose reads fail while `fail_reads` is set.
struct FlakyDisk {
    disk: RamDisk,
    fail_reads: Arc<AtomicBool>,
}

impl BlockOp for FlakyDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.fail_reads.load(Relaxed) {
            return Err(BlockError::ReadError);
        }
        self.disk.read(sector, buf)
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.disk.write(sector, buf)
    }
}

#[test]
fn failed_swap_read_keeps_the_slot() {
    let fail_reads = Arc::new(AtomicBool::new(false));
    let sectors = 2 * SECTORS_PER_PAGE;
    let disk = FlakyDisk {
        disk: RamDisk::new(sectors),
        fail_reads: fail_reads.clone(),
    };
    let swap = Block::new(BlockType::Swap, "flaky", sectors, Box::new(disk));
    let vm = VirtualMemory::new(
        VmConfig {
            frames: 1,
            ..VmConfig::default()
        },
        swap,
    );
    vm.create_address_space(1);
    vm.insert_page(1, page(0), Backing::Zero, true).unwrap();
    vm.insert_page(1, page(1), Backing::Zero, true).unwrap();
    vm.copy_to_user(1, ESP, page(0), &pattern(8)).unwrap();
    vm.copy_to_user(1, ESP, page(1), &pattern(9)).unwrap();
    let Backing::Swap(slot) = backing_of(&vm, 1, page(0)) else {
        panic!("page 0 is not in swap");
    };

    fail_reads.store(true, Relaxed);
    let err = vm.handle_page_fault(1, page(0), ESP, false).unwrap_err();
    assert_eq!(err.cause, VmError::Block(BlockError::ReadError));
    assert_eq!(err.status, EXIT_FAULT);
    // Page 1 made room and went to swap; the frame went back unpinned.
    let stats = vm.stats();
    assert_eq!(stats.frames_in_use, 0);
    assert_eq!(stats.swap_slots_used, 2);
    assert!(vm.swap.is_slot_used(slot));
    assert!(matches!(backing_of(&vm, 1, page(0)), Backing::Swap(s) if s == slot));
    assert!(!vm.frames.is_pinned(0));
    assert_consistent(&vm);

    fail_reads.store(false, Relaxed);
    assert_eq!(
        vm.read_user(1, ESP, page(0), PAGE_FRAME_SIZE).unwrap(),
        pattern(8)
    );
    assert!(!vm.swap.is_slot_used(slot));
    assert_eq!(
        vm.read_user(1, ESP, page(1), PAGE_FRAME_SIZE).unwrap(),
        pattern(9)
    );
    assert_consistent(&vm);
}

#[test]
fn full_swap_keeps_the_page_resident() {
    let vm = vm_with(1, 1);
    vm.create_address_space(1);
    for n in 0..3 {
        vm.insert_page(1, page(n), Backing::Zero, true).unwrap();
    }
    vm.copy_to_user(1, ESP, page(0), b"first").unwrap();
    vm.copy_to_user(1, ESP, page(1), b"second").unwrap();
    assert_eq!(vm.stats().swap_slots_used, 1);

    let err = vm.copy_to_user(1, ESP, page(2), b"third").unwrap_err();
    assert_eq!(err.cause, VmError::SwapFull);

    let space = vm.address_space(1).unwrap();
    assert!(space.pagedir().translate(page(1)).is_some());
    assert!(space.pagedir().is_dirty(page(1)));
    assert_eq!(vm.read_user(1, ESP, page(1), 6).unwrap(), b"second");
    assert_consistent(&vm);
}

#[test]
fn shared_mapping_writes_back_to_the_file() {
    let vm = vm_with(2, 2);
    let file = Arc::new(MemFile::new(pattern(4)));
    vm.create_address_space(1);
    vm.map_file(1, page(0), file.clone(), 0, PAGE_FRAME_SIZE, true, true)
        .unwrap();

    vm.copy_to_user(1, ESP, page(0) + 10, b"hello").unwrap();
    assert!(vm.evict(1, page(0)).unwrap());
    assert_eq!(file.writes(), 1);
    assert_eq!(&file.contents()[10..15], b"hello");
    assert_eq!(vm.stats().swap_slots_used, 0);
    assert!(matches!(backing_of(&vm, 1, page(0)), Backing::File(_)));

    // Clean now: evicting again writes nothing.
    assert_eq!(vm.read_user(1, ESP, page(0) + 10, 5).unwrap(), b"hello");
    assert!(vm.evict(1, page(0)).unwrap());
    assert_eq!(file.writes(), 1);

    vm.copy_to_user(1, ESP, page(0), b"bye").unwrap();
    vm.teardown(1);
    assert_eq!(file.writes(), 2);
    assert_eq!(&file.contents()[..3], b"bye");
}

#[test]
fn private_mapping_never_writes_the_file() {
    let vm = vm_with(2, 2);
    let file = Arc::new(MemFile::new(pattern(4)));
    vm.create_address_space(1);
    vm.map_file(1, page(0), file.clone(), 0, PAGE_FRAME_SIZE, true, false)
        .unwrap();

    vm.copy_to_user(1, ESP, page(0), b"mine").unwrap();
    assert!(vm.evict(1, page(0)).unwrap());
    assert!(matches!(backing_of(&vm, 1, page(0)), Backing::Swap(_)));
    assert_eq!(vm.read_user(1, ESP, page(0), 4).unwrap(), b"mine");

    vm.teardown(1);
    assert_eq!(file.writes(), 0);
    assert_eq!(file.contents(), pattern(4));
}

#[test]
fn map_file_rejects_overlaps() {
    let vm = vm_with(2, 2);
    let file = Arc::new(MemFile::new(pattern(0)));
    vm.create_address_space(1);
    vm.insert_page(1, page(1), Backing::Zero, true).unwrap();

    let overlapping = vm.map_file(1, page(0), file.clone(), 0, 2 * PAGE_FRAME_SIZE, false, false);
    assert_eq!(overlapping, Err(VmError::AlreadyMapped));
    assert!(vm.address_space(1).unwrap().pages().lookup(page(0)).is_none());

    let start = OFFSET - PAGE_FRAME_SIZE;
    let past_kernel = vm.map_file(1, start, file, 0, 2 * PAGE_FRAME_SIZE, false, false);
    assert_eq!(past_kernel, Err(VmError::NotUserAddress));
}

#[test]
fn unmap_gives_back_frames_and_slots() {
    let vm = vm_with(1, 2);
    vm.create_address_space(1);
    vm.insert_page(1, page(0), Backing::Zero, true).unwrap();
    vm.insert_page(1, page(1), Backing::Zero, true).unwrap();
    vm.copy_to_user(1, ESP, page(0), b"swapped").unwrap();
    vm.copy_to_user(1, ESP, page(1), b"resident").unwrap();
    assert_eq!(vm.stats().swap_slots_used, 1);

    vm.unmap(1, page(0), 2 * PAGE_FRAME_SIZE).unwrap();
    let stats = vm.stats();
    assert_eq!((stats.frames_in_use, stats.swap_slots_used), (0, 0));
    assert!(vm.address_space(1).unwrap().pages().is_empty());

    let err = vm.handle_page_fault(1, page(0), ESP, false).unwrap_err();
    assert_eq!(err.cause, VmError::NotMapped);
}

#[test]
fn teardown_frees_frames_and_slots() {
    let vm = vm_with(2, 4);
    vm.create_address_space(1);
    vm.create_address_space(2);
    for n in 0..4 {
        vm.insert_page(1, page(n), Backing::Zero, true).unwrap();
        vm.copy_to_user(1, ESP, page(n), &pattern(n as u8)).unwrap();
    }
    vm.insert_page(2, page(0), Backing::Zero, true).unwrap();
    vm.copy_to_user(2, ESP, page(0), b"survivor").unwrap();
    // Teardown also drops pages the process still has pinned.
    vm.pin_page(1, page(3), false).unwrap();

    assert!(vm.stats().swap_slots_used > 0);
    vm.teardown(1);
    let stats = vm.stats();
    assert_eq!(stats.swap_slots_used, 0);
    assert_eq!(stats.frames_in_use, 1);
    assert!(matches!(vm.address_space(1), Err(VmError::NoAddressSpace(1))));
    assert!((0..2).all(|frame| !vm.frames.is_pinned(frame)));

    assert_eq!(vm.read_user(2, ESP, page(0), 8).unwrap(), b"survivor");
    assert_consistent(&vm);
}

#[test]
fn swap_on_a_disk_image() {
    let swap = block_from_file(
        BlockType::Swap,
        Cursor::new(vec![0u8; 2 * PAGE_FRAME_SIZE]),
    );
    let vm = VirtualMemory::new(
        VmConfig {
            frames: 1,
            ..VmConfig::default()
        },
        swap,
    );
    vm.create_address_space(7);
    vm.insert_page(7, page(0), Backing::Zero, true).unwrap();
    vm.insert_page(7, page(1), Backing::Zero, true).unwrap();

    vm.copy_to_user(7, ESP, page(0), &pattern(5)).unwrap();
    vm.copy_to_user(7, ESP, page(1), &pattern(6)).unwrap();
    assert_eq!(
        vm.read_user(7, ESP, page(0), PAGE_FRAME_SIZE).unwrap(),
        pattern(5)
    );
    assert_eq!(
        vm.read_user(7, ESP, page(1), PAGE_FRAME_SIZE).unwrap(),
        pattern(6)
    );
    assert_eq!(vm.stats().swap_slots, 2);
}

#[test]
fn copies_span_pages() {
    let vm = vm_with(2, 4);
    vm.create_address_space(1);
    vm.insert_page(1, page(0), Backing::Zero, true).unwrap();
    vm.insert_page(1, page(1), Backing::Zero, true).unwrap();

    let data: Vec<u8> = (0..100).collect();
    let start = page(1) - 40;
    vm.copy_to_user(1, ESP, start, &data).unwrap();
    assert_eq!(vm.read_user(1, ESP, start, 100).unwrap(), data);

    let space = vm.address_space(1).unwrap();
    assert!(space.pagedir().is_dirty(page(0)));
    assert!(space.pagedir().is_dirty(page(1)));
    assert!((0..2).all(|frame| !vm.frames.is_pinned(frame)));
}

#[test]
fn processes_fault_concurrently() {
    use std::thread;

    let vm = Arc::new(vm_with(4, 16));
    let pids: [Pid; 2] = [1, 2];
    for pid in pids {
        vm.create_address_space(pid);
        for n in 0..4 {
            vm.insert_page(pid, page(n), Backing::Zero, true).unwrap();
        }
    }

    let workers: Vec<_> = pids
        .into_iter()
        .map(|pid| {
            let vm = vm.clone();
            thread::spawn(move || {
                for round in 0..50u8 {
                    for n in 0..4 {
                        let seed = round ^ (n as u8) ^ (pid as u8 * 16);
                        vm.copy_to_user(pid, ESP, page(n), &pattern(seed)).unwrap();
                        let back = vm.read_user(pid, ESP, page(n), PAGE_FRAME_SIZE).unwrap();
                        assert_eq!(back, pattern(seed));
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_consistent(&vm);
    for pid in pids {
        vm.teardown(pid);
    }
    assert_eq!(vm.stats().swap_slots_used, 0);
    assert_eq!(vm.stats().frames_in_use, 0);
}

#[test]
fn page_fault_error_code() {
    let vm = vm_with(2, 2);
    let file = Arc::new(MemFile::new(pattern(8)));
    vm.create_address_space(1);
    vm.map_file(1, page(0), file, 0, PAGE_FRAME_SIZE, false, false)
        .unwrap();

    // Not present, read, user mode.
    let read = PageFaultError::new_with_raw_value(0b100);
    vm.page_fault_interrupt(1, page(0) + 8, ESP, read).unwrap();
    let space = vm.address_space(1).unwrap();
    assert!(space.pagedir().is_accessed(page(0)));
    assert!(!space.pagedir().is_dirty(page(0)));

    // Present, write, user mode.
    let write = PageFaultError::new_with_raw_value(0b111);
    let err = vm.page_fault_interrupt(1, page(0) + 8, ESP, write).unwrap_err();
    assert_eq!(err.cause, VmError::ReadOnly);
}
