//! 虚拟内存子系统的全局状态
//!
//! [`Vm`] 把帧表、物理帧内容、交换区和全局文件系统锁集中在一起，
//! 由内核显式创建并按引用传给每个需要它的组件。

use alloc::sync::Arc;

use crate::block::BlockDevice;
use crate::config::VmConfig;
use crate::error::VmResult;
use crate::file::FsLock;
use crate::frame_allocator::PhysMemory;
use crate::frame_table::FrameTable;
use crate::swap::SwapArea;

/// 虚拟内存子系统
pub struct Vm {
    config: VmConfig,
    frames: FrameTable,
    memory: PhysMemory,
    swap: SwapArea,
    fs_lock: FsLock,
}

/// 资源使用快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    /// 帧池大小
    pub frames_total: usize,
    /// 在用帧数
    pub frames_used: usize,
    /// 交换槽总数
    pub swap_total: usize,
    /// 已占用交换槽数
    pub swap_used: usize,
}

impl Vm {
    /// 按 `config` 创建子系统，以 `swap_device` 作为交换区
    pub fn new(config: VmConfig, swap_device: Arc<dyn BlockDevice>) -> VmResult<Self> {
        let swap = SwapArea::new(swap_device)?;
        log::debug!(
            "vm: {} user frames, {} swap slots",
            config.user_frames,
            swap.capacity()
        );
        Ok(Vm {
            config,
            frames: FrameTable::new(config.user_frames),
            memory: PhysMemory::new(config.user_frames),
            swap,
            fs_lock: FsLock::new(),
        })
    }

    /// 配置
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// 帧表
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// 物理帧内容
    pub fn memory(&self) -> &PhysMemory {
        &self.memory
    }

    /// 交换区
    pub fn swap(&self) -> &SwapArea {
        &self.swap
    }

    /// 全局文件系统锁
    pub fn fs_lock(&self) -> &FsLock {
        &self.fs_lock
    }

    /// 资源使用快照
    pub fn stats(&self) -> VmStats {
        VmStats {
            frames_total: self.frames.capacity(),
            frames_used: self.frames.live_entries(),
            swap_total: self.swap.capacity(),
            swap_used: self.swap.used(),
        }
    }
}
