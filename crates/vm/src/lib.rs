//! 虚拟内存子系统
//!
//! 按需为每个用户进程的虚拟页提供物理帧，在内存紧张时驱逐帧，
//! 将被驱逐的内容保存到交换区，并支持内存映射文件。
//!
//! # 组成
//!
//! - [`frame_table`]：全局物理帧清单与时钟置换
//! - [`swap`]：页大小槽位的交换区
//! - [`spt`]：每进程的补充页表，缺页处理的权威元数据
//! - [`mmap`]：每进程的内存映射文件表
//! - [`fault`]：缺页处理与系统调用使用的 pin 协议
//! - [`syscall`]：依赖 pin 协议的文件与映射系统调用
//!
//! 全局状态集中在 [`Vm`] 中，由调用者显式持有并按引用传递。
//!
//! # 锁顺序
//!
//! | 外层 → 内层 | 说明 |
//! |------------|------|
//! | 帧表锁 | 选择牺牲帧、分配/回收帧、安装映射 |
//! | 单个 [`AddressSpace`] 的锁 | SPT、页目录、映射表 |
//! | 帧数据锁 / 交换区位图锁 | 叶子锁，持有期间不获取其他锁 |
//!
//! 文件系统锁 [`FsLock`] 只在不持有上述任何锁时获取，且只覆盖单次 I/O。
//! 持有地址空间锁时绝不获取帧表锁。

#![no_std]

extern crate alloc;

mod bitmap;
mod block;
mod config;
mod error;
mod evict;
mod file;
mod system;

pub mod address;
pub mod fault;
pub mod frame_allocator;
pub mod frame_table;
pub mod mmap;
pub mod page_table;
pub mod space;
pub mod spt;
pub mod swap;
pub mod syscall;

#[cfg(test)]
mod tests;

pub use address::{FrameId, Vaddr, Vpn, VpnRange};
pub use block::BlockDevice;
pub use config::{
    DEFAULT_STACK_LIMIT, DEFAULT_USER_FRAMES, PAGE_SIZE, PHYS_BASE, SECTOR_SIZE, STACK_SLACK,
    VmConfig,
};
pub use error::{VmError, VmResult};
pub use fault::PinnedPages;
pub use file::{Console, FileSystem, FsLock, VmFile};
pub use page_table::{PageDir, PageTableEntry, PagingError, PteFlags};
pub use space::{AddressSpace, PageInfo, Pid};
pub use spt::{FileBacking, PageDescriptor, PageKind};
pub use swap::{SwapArea, SwapSlot};
pub use system::{Vm, VmStats};
