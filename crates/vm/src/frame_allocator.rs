//! 用户帧池
//!
//! 本模块提供帧表所消费的物理帧分配原语：
//!
//! - [`FrameAllocator`]：位图分配器，跟踪每个用户帧是否空闲。
//!   本身不加锁，由帧表在自己的锁内调用。
//! - [`PhysMemory`]：帧的实际内容，每个帧一把叶子锁。
//!
//! 帧在每次分配时都会被清零，新所有者读不到前任的任何字节。

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use sync::SpinLock;

use crate::address::FrameId;
use crate::bitmap::Bitmap;
use crate::config::PAGE_SIZE;

// ============================================================================
// FrameAllocator
// ============================================================================

/// 位图帧分配器
pub struct FrameAllocator {
    bitmap: Bitmap,
}

impl FrameAllocator {
    /// 创建管理 `total` 个帧的分配器
    pub fn new(total: usize) -> Self {
        FrameAllocator {
            bitmap: Bitmap::new(total),
        }
    }

    /// 分配一个空闲帧
    pub fn alloc(&mut self) -> Option<FrameId> {
        self.bitmap.alloc().map(FrameId::new)
    }

    /// 归还一个帧
    pub fn dealloc(&mut self, frame: FrameId) {
        self.bitmap.free(frame.index());
    }

    /// 帧是否已分配
    pub fn is_allocated(&self, frame: FrameId) -> bool {
        self.bitmap.is_set(frame.index())
    }

    /// 总帧数
    pub fn total(&self) -> usize {
        self.bitmap.len()
    }

    /// 已分配帧数
    pub fn allocated(&self) -> usize {
        self.bitmap.used()
    }
}

// ============================================================================
// PhysMemory
// ============================================================================

/// 用户帧池的物理内容
pub struct PhysMemory {
    frames: Vec<SpinLock<Box<[u8]>>>,
}

impl PhysMemory {
    /// 创建 `total` 个全零帧
    pub fn new(total: usize) -> Self {
        let frames = (0..total)
            .map(|_| SpinLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()))
            .collect();
        PhysMemory { frames }
    }

    /// 帧数
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// 是否没有帧
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 持有帧锁访问帧内容
    ///
    /// `f` 内不得获取任何其他锁。
    pub fn with_frame<R>(&self, frame: FrameId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.frames[frame.index()].lock();
        f(&mut data[..])
    }

    /// 将帧清零
    pub fn zero(&self, frame: FrameId) {
        self.with_frame(frame, |data| data.fill(0));
    }

    /// 复制出帧的完整内容
    pub fn snapshot(&self, frame: FrameId) -> Box<[u8]> {
        self.with_frame(frame, |data| Box::from(&*data))
    }

    /// 用 `page` 覆盖帧内容，不足一页的部分补零
    pub fn fill(&self, frame: FrameId, page: &[u8]) {
        self.with_frame(frame, |data| {
            let n = page.len().min(PAGE_SIZE);
            data[..n].copy_from_slice(&page[..n]);
            data[n..].fill(0);
        });
    }
}
