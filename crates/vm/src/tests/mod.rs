// 跨模块的场景测试
//
// 单个模块的单元测试留在各自文件的 `mod tests` 中；这里放需要完整 `Vm`、
// 多个地址空间或多线程的场景。`test-support` 中的 Mock 不依赖本 crate，
// 它们的 trait 实现集中在此处。

extern crate std;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use sync::ArchOps;
use test_support::mock::arch::MOCK_ARCH_OPS;
use test_support::mock::device::MockDisk;
use test_support::mock::fs::{MockConsole, MockFile, MockFileSystem};

use crate::block::BlockDevice;
use crate::config::{PAGE_SIZE, SECTOR_SIZE, VmConfig};
use crate::file::{Console, FileSystem, VmFile};
use crate::space::{AddressSpace, Pid};
use crate::system::Vm;

mod fault;
mod process;

// ============================================================================
// Mock 的 trait 实现
// ============================================================================

impl VmFile for MockFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        Ok(MockFile::read_at(self, offset, buf))
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize> {
        Ok(MockFile::write_at(self, offset, buf))
    }

    fn length(&self) -> usize {
        self.len()
    }

    fn reopen(&self) -> Result<Arc<dyn VmFile>, isize> {
        Ok(Arc::new(MockFile::reopen(self)))
    }
}

impl BlockDevice for MockDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> bool {
        MockDisk::read_block(self, block_id, buf)
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> bool {
        MockDisk::write_block(self, block_id, buf)
    }

    fn block_size(&self) -> usize {
        MockDisk::block_size(self)
    }

    fn total_blocks(&self) -> usize {
        MockDisk::total_blocks(self)
    }
}

impl FileSystem for MockFileSystem {
    fn open(&self, name: &str) -> Option<Arc<dyn VmFile>> {
        MockFileSystem::open(self, name).map(|f| Arc::new(f) as Arc<dyn VmFile>)
    }

    fn create(&self, name: &str, initial_size: usize) -> bool {
        MockFileSystem::create(self, name, initial_size)
    }

    fn remove(&self, name: &str) -> bool {
        MockFileSystem::remove(self, name)
    }
}

impl Console for MockConsole {
    fn write(&self, bytes: &[u8]) {
        MockConsole::write(self, bytes)
    }
}

// ============================================================================
// 公共辅助
// ============================================================================

struct MockArch;

impl ArchOps for MockArch {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        unsafe { MOCK_ARCH_OPS.read_and_disable_interrupts() }
    }

    unsafe fn restore_interrupts(&self, flags: usize) {
        unsafe { MOCK_ARCH_OPS.restore_interrupts(flags) }
    }

    fn intr_enable_bit(&self) -> usize {
        MOCK_ARCH_OPS.intr_enable_bit()
    }
}

static MOCK_ARCH: MockArch = MockArch;
// 0 = uninit, 1 = initializing, 2 = ready
static SYNC_INIT: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn init_sync_arch_ops() {
    match SYNC_INIT.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            // Safety: tests use a single global mock ArchOps.
            unsafe { sync::register_arch_ops(&MOCK_ARCH) };
            SYNC_INIT.store(2, Ordering::Release);
        }
        Err(_) => {
            while SYNC_INIT.load(Ordering::Acquire) != 2 {
                core::hint::spin_loop();
            }
        }
    }
}

/// 一页由 `seed` 派生的非零内容
pub(crate) fn pattern_page(seed: u8) -> Vec<u8> {
    (0..PAGE_SIZE)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) | 1)
        .collect()
}

/// `frames` 个用户帧、`swap_slots` 个交换槽的子系统
fn vm_with(frames: usize, swap_slots: usize) -> (Vm, Arc<MockDisk>) {
    vm_with_config(VmConfig::new(frames), swap_slots)
}

fn vm_with_config(config: VmConfig, swap_slots: usize) -> (Vm, Arc<MockDisk>) {
    init_sync_arch_ops();
    let disk = Arc::new(MockDisk::new(SECTOR_SIZE, swap_slots * PAGE_SIZE / SECTOR_SIZE));
    let vm = Vm::new(config, disk.clone()).unwrap();
    (vm, disk)
}

fn vm_on(frames: usize, disk: Arc<GatedDisk>) -> Vm {
    init_sync_arch_ops();
    Vm::new(VmConfig::new(frames), disk).unwrap()
}

fn space(pid: usize, name: &str) -> Arc<AddressSpace> {
    AddressSpace::new(Pid::new(pid), name)
}

/// 长度为 `len`、第 `i` 字节为 `i % 251` 的文件内容
fn file_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn shared_file(data: Vec<u8>) -> (MockFile, Arc<dyn VmFile>) {
    let file = MockFile::new(data);
    let handle: Arc<dyn VmFile> = Arc::new(file.reopen());
    (file, handle)
}

// ============================================================================
// GatedDisk
// ============================================================================

/// 被拦截的块操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateOp {
    Read,
    Write,
}

#[derive(Default)]
struct GateState {
    armed: Option<GateOp>,
    blocked: bool,
}

/// 可以让某次块 I/O 停在半途的交换设备
///
/// `arm(op)` 之后第一个 `op` 类型的块操作会阻塞，直到 `release`。
/// 用来在 VM 锁全部放开、I/O 尚未完成的窗口里安排其他执行流。
pub(crate) struct GatedDisk {
    disk: MockDisk,
    state: Mutex<GateState>,
    cond: Condvar,
}

impl GatedDisk {
    pub(crate) fn new(swap_slots: usize) -> Self {
        GatedDisk {
            disk: MockDisk::new(SECTOR_SIZE, swap_slots * PAGE_SIZE / SECTOR_SIZE),
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn arm(&self, op: GateOp) {
        let mut state = self.state.lock().unwrap();
        state.armed = Some(op);
        state.blocked = false;
    }

    /// 等到有执行流停在闸门上
    pub(crate) fn wait_until_blocked(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.blocked {
            state = self.cond.wait(state).unwrap();
        }
    }

    pub(crate) fn release(&self) {
        self.state.lock().unwrap().armed = None;
        self.cond.notify_all();
    }

    fn pass(&self, op: GateOp) {
        let mut state = self.state.lock().unwrap();
        if state.armed != Some(op) {
            return;
        }
        state.blocked = true;
        self.cond.notify_all();
        while state.armed == Some(op) {
            state = self.cond.wait(state).unwrap();
        }
    }
}

impl BlockDevice for GatedDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> bool {
        self.pass(GateOp::Read);
        self.disk.read_block(block_id, buf)
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> bool {
        self.pass(GateOp::Write);
        self.disk.write_block(block_id, buf)
    }

    fn block_size(&self) -> usize {
        self.disk.block_size()
    }

    fn total_blocks(&self) -> usize {
        self.disk.total_blocks()
    }
}

#[test]
fn test_pattern_page_is_nonzero() {
    let page = pattern_page(0);
    assert_eq!(page.len(), PAGE_SIZE);
    assert!(page.iter().all(|&b| b != 0));
    assert_ne!(pattern_page(1), page);
}
