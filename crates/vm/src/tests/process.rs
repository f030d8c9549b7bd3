extern crate std;

use alloc::vec;

use super::*;
use crate::address::Vaddr;
use crate::config::PHYS_BASE;
use crate::error::VmError;
use crate::spt::PageDescriptor;

const DATA: usize = 0x1000_0000;
const MAP: usize = 0x2000_0000;

fn top() -> Vaddr {
    Vaddr::new(PHYS_BASE)
}

fn page(i: usize) -> Vaddr {
    Vaddr::new(DATA + i * PAGE_SIZE)
}

#[test]
fn test_setup_stack_maps_top_page() {
    let (vm, _disk) = vm_with(4, 4);
    let sp = space(1, "init");
    let esp = sp.setup_stack(&vm).unwrap();
    assert_eq!(esp, top());
    let info = sp.page_info(Vaddr::new(PHYS_BASE - 1)).unwrap();
    assert!(info.resident);
    assert!(info.writable);
    assert!(!info.pinned);

    let mut word = [0xFFu8; 4];
    sp.read_user(&vm, Vaddr::new(PHYS_BASE - 4), &mut word, esp).unwrap();
    assert_eq!(word, [0; 4]);
}

#[test]
fn test_exit_releases_frames_and_swap_slots() {
    const SLOTS: usize = 3;
    let (vm, _disk) = vm_with(1, SLOTS);
    let first = space(1, "first");
    for i in 0..=SLOTS {
        first.register_page(page(i), PageDescriptor::zero(true)).unwrap();
        first.write_user(&vm, page(i), &[i as u8 + 1], top()).unwrap();
    }
    assert_eq!(vm.stats().swap_used, SLOTS);
    assert_eq!(vm.stats().frames_used, 1);

    first.exit(&vm, 0);
    assert_eq!(first.exit_status(), Some(0));
    assert_eq!(first.page_count(), 0);
    assert_eq!(first.resident_pages(), 0);
    let stats = vm.stats();
    assert_eq!(stats.swap_used, 0);
    assert_eq!(stats.frames_used, 0);

    // 整个交换区可以再次被填满，之后才会耗尽
    let second = space(2, "second");
    for i in 0..=SLOTS + 1 {
        second.register_page(page(i), PageDescriptor::zero(true)).unwrap();
    }
    for i in 0..=SLOTS {
        second.write_user(&vm, page(i), &[0x40 + i as u8], top()).unwrap();
    }
    assert_eq!(vm.stats().swap_used, SLOTS);
    assert_eq!(
        second.write_user(&vm, page(SLOTS + 1), &[0xFF], top()),
        Err(VmError::SwapFull)
    );
    assert_eq!(second.kill_reason(), Some(VmError::SwapFull));
}

#[test]
fn test_exit_is_idempotent() {
    let (vm, _disk) = vm_with(2, 2);
    let sp = space(1, "twice");
    sp.setup_stack(&vm).unwrap();
    sp.exit(&vm, 3);
    sp.exit(&vm, 4);
    assert_eq!(sp.exit_status(), Some(3));
    assert_eq!(sp.kill_reason(), None);
    assert!(!sp.killed_by_violation());
    assert_eq!(
        sp.register_page(page(0), PageDescriptor::zero(true)),
        Err(VmError::ProcessExited)
    );
}

#[test]
fn test_exit_writes_back_dirty_mappings() {
    let (vm, _disk) = vm_with(4, 4);
    let file = MockFile::new(file_bytes(2 * PAGE_SIZE));
    let sp = space(1, "mapper");
    sp.mmap(&vm, Arc::new(file.reopen()), Vaddr::new(MAP), 2 * PAGE_SIZE)
        .unwrap();
    sp.write_user(&vm, Vaddr::new(MAP + PAGE_SIZE + 1), b"xy", top())
        .unwrap();

    sp.exit(&vm, 0);
    assert_eq!(file.writes(), vec![(PAGE_SIZE, PAGE_SIZE)]);
    assert_eq!(&file.contents()[PAGE_SIZE + 1..PAGE_SIZE + 3], b"xy");
    assert_eq!(file.open_handles(), 1);
    assert!(sp.mappings().is_empty());
    assert_eq!(vm.stats().frames_used, 0);
}

#[test]
fn test_killed_process_frame_is_zeroed_for_next_owner() {
    let (vm, _disk) = vm_with(1, 2);
    let victim = space(1, "victim");
    victim.register_page(page(0), PageDescriptor::zero(true)).unwrap();
    victim.write_user(&vm, page(0), &pattern_page(9), top()).unwrap();
    let frame = victim.page_info(page(0)).unwrap().frame;
    assert_eq!(
        victim.handle_page_fault(&vm, Vaddr::new(0x10), top(), false),
        Err(VmError::InvalidAddress)
    );

    let next = space(2, "next");
    next.register_page(page(0), PageDescriptor::zero(true)).unwrap();
    let mut buf = vec![0xFFu8; PAGE_SIZE];
    next.read_user(&vm, page(0), &mut buf, top()).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    assert_eq!(next.page_info(page(0)).unwrap().frame, frame);
}

#[test]
fn test_stats_track_usage() {
    let (vm, _disk) = vm_with(3, 2);
    let sp = space(1, "stats");
    let stats = vm.stats();
    assert_eq!(stats.frames_total, 3);
    assert_eq!(stats.swap_total, 2);
    assert_eq!(stats.frames_used, 0);

    sp.setup_stack(&vm).unwrap();
    sp.register_page(page(0), PageDescriptor::zero(true)).unwrap();
    sp.write_user(&vm, page(0), &[1], top()).unwrap();
    assert_eq!(vm.stats().frames_used, 2);
    let frame = sp.page_info(page(0)).unwrap().frame.unwrap();
    assert_eq!(vm.frames().owner_of(frame), Some((sp.pid(), page(0).floor())));
}

#[test]
fn test_exit_during_swap_out_frees_orphaned_slot() {
    let disk = Arc::new(GatedDisk::new(2));
    let vm = vm_on(1, Arc::clone(&disk));
    let owner = space(1, "owner");
    let requester = space(2, "requester");
    owner.register_page(page(0), PageDescriptor::zero(true)).unwrap();
    requester.register_page(page(0), PageDescriptor::zero(true)).unwrap();
    owner.write_user(&vm, page(0), &pattern_page(4), top()).unwrap();
    let frame = owner.page_info(page(0)).unwrap().frame.unwrap();

    disk.arm(GateOp::Write);
    std::thread::scope(|s| {
        let fault = s.spawn(|| requester.write_user(&vm, page(0), &[1], top()));
        disk.wait_until_blocked();
        // 写回进行中：页处于在途状态，退出不碰它
        assert!(owner.page_info(page(0)).unwrap().in_transit);
        owner.exit(&vm, 0);
        assert_eq!(vm.stats().swap_used, 1);
        disk.release();
        assert_eq!(fault.join().unwrap(), Ok(()));
    });

    let stats = vm.stats();
    assert_eq!(stats.swap_used, 0);
    assert_eq!(stats.frames_used, 1);
    assert_eq!(vm.frames().owner_of(frame), Some((requester.pid(), page(0).floor())));
    assert!(requester.page_info(page(0)).unwrap().resident);
    let mut byte = [0u8; 1];
    requester.read_user(&vm, page(0), &mut byte, top()).unwrap();
    assert_eq!(byte, [1]);
}

#[test]
fn test_exit_during_swap_in_releases_loading_frame() {
    let disk = Arc::new(GatedDisk::new(2));
    let vm = vm_on(1, Arc::clone(&disk));
    let owner = space(1, "owner");
    for i in 0..2 {
        owner.register_page(page(i), PageDescriptor::zero(true)).unwrap();
    }
    owner.write_user(&vm, page(0), &pattern_page(5), top()).unwrap();
    owner.write_user(&vm, page(1), &pattern_page(6), top()).unwrap();
    assert!(owner.page_info(page(0)).unwrap().swap_slot.is_some());

    disk.arm(GateOp::Read);
    std::thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = vec![0u8; PAGE_SIZE];
            owner.read_user(&vm, page(0), &mut buf, top())
        });
        disk.wait_until_blocked();
        owner.exit(&vm, 0);
        disk.release();
        assert_eq!(reader.join().unwrap(), Err(VmError::ProcessExited));
    });

    let stats = vm.stats();
    assert_eq!(stats.frames_used, 0);
    assert_eq!(stats.swap_used, 0);
    assert_eq!(owner.exit_status(), Some(0));
}
