//! 交换区
//!
//! 把块设备划分为页大小的槽位，每个槽位保存一页被驱逐的内容。
//! 空闲槽位由位图跟踪，位图有自己的锁，与帧表锁相互独立；
//! 设备 I/O 在位图锁之外进行。
//!
//! 槽位的生命周期：
//! - 驱逐脏的匿名页（或不允许改写后备文件的脏页）时分配；
//! - 页被换回时，[`SwapArea::read_in`] 读完即释放；
//! - 进程在页仍被换出时退出，直接 [`SwapArea::free`]。

use alloc::sync::Arc;

use sync::SpinLock;

use crate::bitmap::Bitmap;
use crate::block::BlockDevice;
use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};

/// 交换槽下标
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// 由下标创建
    pub const fn new(index: usize) -> Self {
        SwapSlot(index)
    }

    /// 槽位下标
    pub const fn index(self) -> usize {
        self.0
    }
}

/// 交换区
pub struct SwapArea {
    device: Arc<dyn BlockDevice>,
    /// 每个槽位占用的块数
    blocks_per_slot: usize,
    slots: SpinLock<Bitmap>,
}

impl SwapArea {
    /// 在 `device` 上创建交换区
    ///
    /// 块大小必须整除页大小，否则返回 [`VmError::Io`]。
    pub fn new(device: Arc<dyn BlockDevice>) -> VmResult<Self> {
        let block_size = device.block_size();
        if block_size == 0 || PAGE_SIZE % block_size != 0 {
            log::error!("swap: block size {} does not divide page size", block_size);
            return Err(VmError::Io);
        }
        let blocks_per_slot = PAGE_SIZE / block_size;
        let capacity = device.total_blocks() / blocks_per_slot;
        Ok(SwapArea {
            device,
            blocks_per_slot,
            slots: SpinLock::new(Bitmap::new(capacity)),
        })
    }

    /// 槽位总数
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// 已占用的槽位数
    pub fn used(&self) -> usize {
        self.slots.lock().used()
    }

    /// 槽位是否被占用
    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        self.slots.lock().is_set(slot.index())
    }

    /// 分配一个空闲槽位
    pub fn allocate(&self) -> VmResult<SwapSlot> {
        self.slots.lock().alloc().map(SwapSlot).ok_or(VmError::SwapFull)
    }

    /// 将一页内容写入已分配的 `slot`
    pub fn write(&self, slot: SwapSlot, page: &[u8]) -> VmResult<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let block_size = self.device.block_size();
        let first = slot.index() * self.blocks_per_slot;
        for (i, chunk) in page.chunks(block_size).take(self.blocks_per_slot).enumerate() {
            if !self.device.write_block(first + i, chunk) {
                log::error!("swap: write of slot {} failed at block {}", slot.index(), first + i);
                return Err(VmError::Io);
            }
        }
        Ok(())
    }

    /// 分配槽位并写入一页，写入失败时释放槽位
    pub fn write_out(&self, page: &[u8]) -> VmResult<SwapSlot> {
        let slot = self.allocate()?;
        if let Err(e) = self.write(slot, page) {
            self.free(slot);
            return Err(e);
        }
        Ok(slot)
    }

    /// 读回 `slot` 中的一页并释放该槽位
    ///
    /// 读取完成之前槽位保持占用，不会被分配给别人。
    /// 读取失败时槽位同样被释放：内容已不可恢复。
    pub fn read_in(&self, slot: SwapSlot, page: &mut [u8]) -> VmResult<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let block_size = self.device.block_size();
        let first = slot.index() * self.blocks_per_slot;
        let mut result = Ok(());
        for (i, chunk) in page
            .chunks_mut(block_size)
            .take(self.blocks_per_slot)
            .enumerate()
        {
            if !self.device.read_block(first + i, chunk) {
                log::error!("swap: read of slot {} failed at block {}", slot.index(), first + i);
                result = Err(VmError::Io);
                break;
            }
        }
        self.free(slot);
        result
    }

    /// 不读取内容直接释放槽位
    pub fn free(&self, slot: SwapSlot) {
        self.slots.lock().free(slot.index());
    }
}
