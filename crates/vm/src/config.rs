//! 内存布局常量与运行时配置

/// 页大小
pub const PAGE_SIZE: usize = 4096;

/// 块设备扇区大小
pub const SECTOR_SIZE: usize = 512;

/// 用户地址空间上界（不含），其上为内核空间
pub const PHYS_BASE: usize = 0xC000_0000;

/// 用户栈的最大尺寸
pub const DEFAULT_STACK_LIMIT: usize = 8 * 1024 * 1024;

/// 允许访问的栈指针下方距离
///
/// x86 的 `PUSHA` 会在修改 esp 之前写入 esp 下方 32 字节。
pub const STACK_SLACK: usize = 32;

/// 默认的用户帧池大小
pub const DEFAULT_USER_FRAMES: usize = 256;

/// 虚拟内存子系统的运行时配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// 用户帧池中的物理帧数
    pub user_frames: usize,
    /// 用户地址空间上界（不含）
    pub phys_base: usize,
    /// 栈最大尺寸，栈底为 `phys_base - stack_limit`
    pub stack_limit: usize,
    /// 栈指针下方仍视为栈访问的字节数
    pub stack_slack: usize,
}

impl VmConfig {
    /// 以默认布局、指定帧数创建配置
    pub const fn new(user_frames: usize) -> Self {
        VmConfig {
            user_frames,
            phys_base: PHYS_BASE,
            stack_limit: DEFAULT_STACK_LIMIT,
            stack_slack: STACK_SLACK,
        }
    }

    /// 修改栈最大尺寸
    pub const fn with_stack_limit(mut self, stack_limit: usize) -> Self {
        self.stack_limit = stack_limit;
        self
    }

    /// 栈区最低地址
    pub const fn stack_bottom(&self) -> usize {
        self.phys_base.saturating_sub(self.stack_limit)
    }

    /// 地址是否位于用户空间（非空且低于 `phys_base`）
    pub const fn is_user_vaddr(&self, addr: usize) -> bool {
        addr != 0 && addr < self.phys_base
    }

    /// 地址是否落在栈增长窗口内：不低于 `esp - stack_slack`，且位于栈区内
    pub const fn is_stack_access(&self, addr: usize, esp: usize) -> bool {
        self.in_stack_window(addr, esp) && addr >= self.stack_bottom()
    }

    /// 只检查与栈指针的距离，不检查栈区下界
    pub(crate) const fn in_stack_window(&self, addr: usize, esp: usize) -> bool {
        addr < self.phys_base && addr >= esp.saturating_sub(self.stack_slack)
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new(DEFAULT_USER_FRAMES)
    }
}
