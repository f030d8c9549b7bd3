use alloc::vec;

use uapi::wait::EXIT_MEMORY_VIOLATION;

use super::*;
use crate::address::Vaddr;
use crate::config::PHYS_BASE;
use crate::error::VmError;
use crate::spt::{PageDescriptor, PageKind};

const CODE: usize = 0x0804_8000;
const DATA: usize = 0x1000_0000;

fn top() -> Vaddr {
    Vaddr::new(PHYS_BASE)
}

#[test]
fn test_unregistered_address_kills_process() {
    let (vm, _disk) = vm_with(4, 4);
    let sp = space(1, "wild");
    let esp = sp.setup_stack(&vm).unwrap();
    assert_eq!(vm.stats().frames_used, 1);

    let r = sp.handle_page_fault(&vm, Vaddr::new(CODE), esp, false);
    assert_eq!(r, Err(VmError::InvalidAddress));
    assert!(!sp.is_alive());
    assert_eq!(sp.exit_status(), Some(EXIT_MEMORY_VIOLATION));
    assert!(sp.killed_by_violation());
    assert_eq!(vm.stats().frames_used, 0);

    // 已退出的进程不会被再次终止
    let again = sp.handle_page_fault(&vm, Vaddr::new(CODE), esp, false);
    assert_eq!(again, Err(VmError::ProcessExited));
    assert_eq!(sp.kill_reason(), Some(VmError::InvalidAddress));
}

#[test]
fn test_null_and_kernel_addresses_kill_process() {
    let (vm, _disk) = vm_with(4, 4);
    for (pid, addr) in [(1, 0usize), (2, PHYS_BASE), (3, PHYS_BASE + 0x1234)] {
        let sp = space(pid, "stray");
        let esp = sp.setup_stack(&vm).unwrap();
        assert_eq!(
            sp.handle_page_fault(&vm, Vaddr::new(addr), esp, false),
            Err(VmError::InvalidAddress)
        );
        assert_eq!(sp.exit_status(), Some(EXIT_MEMORY_VIOLATION));
    }
    assert_eq!(vm.stats().frames_used, 0);
}

#[test]
fn test_stack_grows_within_window() {
    let (vm, _disk) = vm_with(8, 8);
    let sp = space(1, "stack");
    let top = sp.setup_stack(&vm).unwrap();
    assert_eq!(top, Vaddr::new(PHYS_BASE));
    assert_eq!(sp.page_count(), 1);

    // PUSH 在 esp 下方 4 字节处写入
    let esp = Vaddr::new(PHYS_BASE - PAGE_SIZE);
    let push = Vaddr::new(esp.as_usize() - 4);
    sp.handle_page_fault(&vm, push, esp, true).unwrap();
    let info = sp.page_info(push).unwrap();
    assert_eq!(info.kind, PageKind::ZeroFill);
    assert!(info.writable);
    assert!(info.resident);
    assert!(!info.pinned);

    // PUSHA 在 esp 下方 32 字节处写入
    let esp = Vaddr::new(PHYS_BASE - 2 * PAGE_SIZE);
    sp.handle_page_fault(&vm, Vaddr::new(esp.as_usize() - 32), esp, true)
        .unwrap();
    assert_eq!(sp.page_count(), 3);

    // esp 之上、尚未登记的栈页同样属于栈
    let esp = Vaddr::new(PHYS_BASE - 6 * PAGE_SIZE);
    sp.handle_page_fault(&vm, Vaddr::new(PHYS_BASE - 5 * PAGE_SIZE), esp, true)
        .unwrap();
    assert_eq!(sp.page_count(), 4);
    assert!(sp.is_alive());
}

#[test]
fn test_access_far_below_esp_kills_process() {
    let (vm, _disk) = vm_with(8, 8);
    let sp = space(1, "stack");
    sp.setup_stack(&vm).unwrap();
    let esp = Vaddr::new(PHYS_BASE - PAGE_SIZE);
    let r = sp.handle_page_fault(&vm, Vaddr::new(esp.as_usize() - 64), esp, true);
    assert_eq!(r, Err(VmError::InvalidAddress));
    assert!(sp.killed_by_violation());
}

#[test]
fn test_stack_limit_bounds_growth() {
    let config = VmConfig::new(8).with_stack_limit(2 * PAGE_SIZE);
    let (vm, _disk) = vm_with_config(config, 8);
    let sp = space(1, "deep");
    sp.setup_stack(&vm).unwrap();

    let esp = Vaddr::new(PHYS_BASE - PAGE_SIZE);
    sp.handle_page_fault(&vm, Vaddr::new(esp.as_usize() - 4), esp, true)
        .unwrap();

    let esp = Vaddr::new(PHYS_BASE - 2 * PAGE_SIZE);
    let r = sp.handle_page_fault(&vm, Vaddr::new(esp.as_usize() - 4), esp, true);
    assert_eq!(r, Err(VmError::StackLimitExceeded));
    assert!(sp.killed_by_violation());
}

#[test]
fn test_segment_is_loaded_lazily_with_zero_tail() {
    let (vm, _disk) = vm_with(4, 4);
    let data = file_bytes(5000);
    let (file, handle) = shared_file(data.clone());
    let sp = space(1, "exec");
    sp.load_segment(&vm, handle, 0, Vaddr::new(CODE), 5000, 2 * PAGE_SIZE - 5000, false)
        .unwrap();
    assert_eq!(sp.page_count(), 2);
    assert_eq!(sp.resident_pages(), 0);
    assert_eq!(vm.stats().frames_used, 0);

    let mut buf = vec![0xFFu8; 2 * PAGE_SIZE];
    sp.read_user(&vm, Vaddr::new(CODE), &mut buf, top()).unwrap();
    assert_eq!(&buf[..5000], &data[..]);
    assert!(buf[5000..].iter().all(|&b| b == 0));
    assert_eq!(sp.resident_pages(), 2);

    let info = sp.page_info(Vaddr::new(CODE + PAGE_SIZE)).unwrap();
    assert_eq!(info.kind, PageKind::FileReadOnly);
    assert!(!info.writable);
    assert!(info.accessed);
    assert!(!info.dirty);
    assert!(file.writes().is_empty());
}

#[test]
fn test_segment_pages_without_file_bytes_are_zero_fill() {
    let (vm, _disk) = vm_with(4, 4);
    let (_file, handle) = shared_file(file_bytes(100));
    let sp = space(1, "bss");
    sp.load_segment(&vm, handle, 0, Vaddr::new(CODE), 100, 3 * PAGE_SIZE - 100, true)
        .unwrap();
    let first = sp.page_info(Vaddr::new(CODE)).unwrap();
    assert_eq!(first.kind, PageKind::FileReadOnly);
    assert!(first.writable);
    for i in 1..3 {
        let info = sp.page_info(Vaddr::new(CODE + i * PAGE_SIZE)).unwrap();
        assert_eq!(info.kind, PageKind::ZeroFill);
    }
}

#[test]
fn test_bad_segments_are_rejected() {
    let (vm, _disk) = vm_with(4, 4);
    let (_file, handle) = shared_file(file_bytes(PAGE_SIZE));
    let sp = space(1, "loader");
    assert_eq!(
        sp.load_segment(&vm, handle.clone(), 0, Vaddr::new(CODE + 1), PAGE_SIZE, 0, false),
        Err(VmError::MisalignedAddress)
    );
    assert_eq!(
        sp.load_segment(&vm, handle.clone(), 0, Vaddr::new(CODE), 100, 100, false),
        Err(VmError::MisalignedAddress)
    );
    assert_eq!(
        sp.load_segment(&vm, handle.clone(), 0, Vaddr::new(PHYS_BASE - PAGE_SIZE), 0, 2 * PAGE_SIZE, true),
        Err(VmError::InvalidAddress)
    );
    sp.load_segment(&vm, handle.clone(), 0, Vaddr::new(CODE), PAGE_SIZE, PAGE_SIZE, false)
        .unwrap();
    // 与已有段重叠时整段都不登记
    assert_eq!(
        sp.load_segment(&vm, handle, 0, Vaddr::new(CODE + PAGE_SIZE), 0, 2 * PAGE_SIZE, true),
        Err(VmError::AlreadyMapped)
    );
    assert_eq!(sp.page_count(), 2);
    assert!(sp.is_alive());
}

#[test]
fn test_write_to_read_only_page_kills_process() {
    let (vm, _disk) = vm_with(4, 4);
    let (_file, handle) = shared_file(file_bytes(PAGE_SIZE));
    let sp = space(1, "ro");
    sp.load_segment(&vm, handle, 0, Vaddr::new(CODE), PAGE_SIZE, 0, false)
        .unwrap();
    let mut byte = [0u8; 1];
    sp.read_user(&vm, Vaddr::new(CODE + 7), &mut byte, top()).unwrap();
    assert_eq!(byte[0], 7);

    let r = sp.write_user(&vm, Vaddr::new(CODE), &[1, 2, 3], top());
    assert_eq!(r, Err(VmError::WriteToReadOnly));
    assert!(sp.killed_by_violation());
    assert_eq!(vm.stats().frames_used, 0);
}

#[test]
fn test_write_fault_on_read_only_page_is_checked_before_loading() {
    let (vm, _disk) = vm_with(4, 4);
    let (_file, handle) = shared_file(file_bytes(PAGE_SIZE));
    let sp = space(1, "ro");
    sp.load_segment(&vm, handle, 0, Vaddr::new(CODE), PAGE_SIZE, 0, false)
        .unwrap();
    let r = sp.resolve(&vm, Vaddr::new(CODE), top(), true);
    assert_eq!(r, Err(VmError::WriteToReadOnly));
    assert_eq!(vm.stats().frames_used, 0);
}

#[test]
fn test_resolve_pins_until_unpinned() {
    let (vm, _disk) = vm_with(4, 4);
    let sp = space(1, "pin");
    sp.register_page(Vaddr::new(DATA), PageDescriptor::zero(true)).unwrap();
    let vpn = sp.resolve(&vm, Vaddr::new(DATA + 12), top(), true).unwrap();
    assert_eq!(vpn, Vaddr::new(DATA).floor());
    let info = sp.page_info(Vaddr::new(DATA)).unwrap();
    assert!(info.resident);
    assert!(info.pinned);

    // 已驻留的页再次 resolve 只增加 pin 计数
    let again = sp.resolve(&vm, Vaddr::new(DATA), top(), false).unwrap();
    sp.unpin(again);
    assert!(sp.page_info(Vaddr::new(DATA)).unwrap().pinned);
    sp.unpin(vpn);
    assert!(!sp.page_info(Vaddr::new(DATA)).unwrap().pinned);
}

#[test]
fn test_pin_buffer_spanning_two_pages() {
    let (vm, _disk) = vm_with(4, 4);
    let sp = space(1, "buf");
    sp.register_page(Vaddr::new(DATA), PageDescriptor::zero(true)).unwrap();
    sp.register_page(Vaddr::new(DATA + PAGE_SIZE), PageDescriptor::zero(true))
        .unwrap();

    let pins = sp
        .pin_buffer(&vm, Vaddr::new(DATA + PAGE_SIZE - 8), 16, top(), true)
        .unwrap();
    assert_eq!(pins.len(), 2);
    assert_eq!(sp.resident_pages(), 2);
    assert!(sp.page_info(Vaddr::new(DATA)).unwrap().pinned);
    assert!(sp.page_info(Vaddr::new(DATA + PAGE_SIZE)).unwrap().pinned);
    drop(pins);
    assert!(!sp.page_info(Vaddr::new(DATA)).unwrap().pinned);
    assert!(!sp.page_info(Vaddr::new(DATA + PAGE_SIZE)).unwrap().pinned);

    let empty = sp.pin_buffer(&vm, Vaddr::new(0), 0, top(), true).unwrap();
    assert!(empty.is_empty());
    assert!(sp.is_alive());
}

#[test]
fn test_pin_buffer_reaching_unmapped_page_kills_process() {
    let (vm, _disk) = vm_with(4, 4);
    let sp = space(1, "buf");
    sp.register_page(Vaddr::new(DATA), PageDescriptor::zero(true)).unwrap();
    let r = sp.pin_buffer(&vm, Vaddr::new(DATA), PAGE_SIZE + 1, top(), false);
    assert_eq!(r.err(), Some(VmError::InvalidAddress));
    assert!(sp.killed_by_violation());
    assert_eq!(vm.stats().frames_used, 0);
}

#[test]
fn test_pin_buffer_address_overflow_kills_process() {
    let (vm, _disk) = vm_with(4, 4);
    let sp = space(1, "wrap");
    let r = sp.pin_buffer(&vm, Vaddr::new(usize::MAX - 10), 100, top(), false);
    assert_eq!(r.err(), Some(VmError::InvalidAddress));
    assert!(sp.killed_by_violation());
}

#[test]
fn test_pin_string_across_page_boundary() {
    let (vm, _disk) = vm_with(4, 4);
    let sp = space(1, "str");
    sp.register_page(Vaddr::new(DATA), PageDescriptor::zero(true)).unwrap();
    sp.register_page(Vaddr::new(DATA + PAGE_SIZE), PageDescriptor::zero(true))
        .unwrap();
    let start = Vaddr::new(DATA + PAGE_SIZE - 2);
    sp.write_user(&vm, start, b"hello\0", top()).unwrap();

    let (bytes, pins) = sp.pin_string(&vm, start, top()).unwrap();
    assert_eq!(bytes, b"hello");
    assert_eq!(pins.len(), 2);
    drop(pins);
    assert!(!sp.page_info(start).unwrap().pinned);

    // 以页内第一个字节结尾的空串只 pin 一页
    let (bytes, pins) = sp.pin_string(&vm, Vaddr::new(DATA + 100), top()).unwrap();
    assert!(bytes.is_empty());
    assert_eq!(pins.len(), 1);
}

#[test]
fn test_unterminated_string_kills_process() {
    let (vm, _disk) = vm_with(4, 4);
    let sp = space(1, "str");
    sp.register_page(Vaddr::new(DATA), PageDescriptor::zero(true)).unwrap();
    let tail = Vaddr::new(DATA + PAGE_SIZE - 4);
    sp.write_user(&vm, tail, b"abcd", top()).unwrap();
    let r = sp.pin_string(&vm, tail, top());
    assert_eq!(r.err(), Some(VmError::InvalidAddress));
    assert!(sp.killed_by_violation());
}

#[test]
fn test_write_user_sets_dirty_bit() {
    let (vm, _disk) = vm_with(4, 4);
    let sp = space(1, "dirty");
    sp.register_page(Vaddr::new(DATA), PageDescriptor::zero(true)).unwrap();
    let mut buf = [0u8; 4];
    sp.read_user(&vm, Vaddr::new(DATA), &mut buf, top()).unwrap();
    assert_eq!(buf, [0; 4]);
    assert!(!sp.page_info(Vaddr::new(DATA)).unwrap().dirty);

    sp.write_user(&vm, Vaddr::new(DATA + 4), &[9, 8, 7], top()).unwrap();
    let info = sp.page_info(Vaddr::new(DATA)).unwrap();
    assert!(info.dirty);
    assert!(info.accessed);
    sp.read_user(&vm, Vaddr::new(DATA + 3), &mut buf, top()).unwrap();
    assert_eq!(buf, [0, 9, 8, 7]);
}
