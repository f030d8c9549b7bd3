//! 中断保护器
//!
//! 基于 RAII 实现中断保护，在创建时禁用中断，销毁时恢复。
//!
//! 注意：禁用中断只能阻止本地 CPU 上"任务 vs 中断处理"的交错，
//! 并不能阻止其他执行流在锁外访问共享数据。

use crate::arch_ops;
use core::ops::Drop;

/// 中断保护器，基于 RAII 实现中断保护。
///
/// 在创建时原子地禁用中断并保存之前的状态；
/// 在销毁时自动恢复之前的中断状态。
///
/// # 示例
/// ```ignore
/// {
///     let guard = IntrGuard::new(); // 禁用中断
///     // 临界区代码
/// } // 离开作用域，自动恢复中断状态
/// ```
pub struct IntrGuard {
    flags: usize,
}

impl IntrGuard {
    /// 原子地禁用中断并返回一个 IntrGuard 实例。
    pub fn new() -> Self {
        // SAFETY: 保存的 flags 只会在 Drop 或 from_raw 中原样恢复
        let flags = unsafe { arch_ops().read_and_disable_interrupts() };
        IntrGuard { flags }
    }

    /// 检查进入临界区前，中断是否处于启用状态。
    pub fn was_enabled(&self) -> bool {
        self.flags & arch_ops().intr_enable_bit() != 0
    }

    /// 放弃 RAII，交出保存的中断状态。
    ///
    /// 调用者必须之后用 [`IntrGuard::from_raw`] 重建并销毁它。
    pub fn into_raw(self) -> usize {
        let flags = self.flags;
        core::mem::forget(self);
        flags
    }

    /// 用 [`IntrGuard::into_raw`] 交出的状态重建保护器。
    ///
    /// # Safety
    /// `flags` 必须来自同一 CPU 上尚未恢复的 `into_raw`。
    pub unsafe fn from_raw(flags: usize) -> Self {
        IntrGuard { flags }
    }
}

impl Default for IntrGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IntrGuard {
    /// 当 IntrGuard 离开作用域时，自动恢复中断状态。
    fn drop(&mut self) {
        // SAFETY: flags 是在创建 IntrGuard 时保存的
        unsafe { arch_ops().restore_interrupts(self.flags) };
    }
}
