//! 设备相关操作的 Mock 实现
//!
//! 注意：这里不直接依赖 `vm` crate（避免循环依赖）。
//! `vm` crate 在 `cfg(test)` 下为这些类型实现其 trait（例如 `BlockDevice`）。

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 基于内存的块设备，用作交换区
pub struct MockDisk {
    data: Mutex<Vec<u8>>,
    block_size: usize,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MockDisk {
    /// 创建一个 `total_blocks` 个块、每块 `block_size` 字节的设备
    pub fn new(block_size: usize, total_blocks: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; block_size * total_blocks]),
            block_size,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn read_block(&self, block_id: usize, buf: &mut [u8]) -> bool {
        let data = self.data.lock().unwrap();
        let start = block_id * self.block_size;
        if buf.len() < self.block_size || start + self.block_size > data.len() {
            return false;
        }
        buf[..self.block_size].copy_from_slice(&data[start..start + self.block_size]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn write_block(&self, block_id: usize, buf: &[u8]) -> bool {
        if self.fail_writes.load(Ordering::Relaxed) {
            return false;
        }
        let mut data = self.data.lock().unwrap();
        let start = block_id * self.block_size;
        if buf.len() < self.block_size || start + self.block_size > data.len() {
            return false;
        }
        data[start..start + self.block_size].copy_from_slice(&buf[..self.block_size]);
        self.writes.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.data.lock().unwrap().len() / self.block_size
    }

    /// 成功读取的块数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 成功写入的块数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 让之后的所有写操作失败
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}
