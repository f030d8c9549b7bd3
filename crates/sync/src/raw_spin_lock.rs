//! 自旋锁实现
//!
//! 基于原子操作实现自旋锁机制，结合 IntrGuard 实现中断保护，
//! 并以 [`lock_api::RawMutex`] 的形式暴露给上层。

use crate::intr_guard::IntrGuard;
use core::{
    hint,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use lock_api::{GuardNoSend, RawMutex};

/// 原始自旋锁，不携带数据。
///
/// 加锁时先禁用本地中断，再自旋获取锁标志；
/// 进入前的中断状态保存在锁内部，解锁时恢复。
/// 不可重入 (即不能嵌套获取同一把锁)。
///
/// 嵌套持有多把锁时必须按相反顺序释放，否则恢复的中断状态会错位。
#[derive(Debug)]
pub struct RawSpinLock {
    lock: AtomicBool,
    /// 持有者进入前的中断状态，只在持有锁期间有效
    saved_flags: AtomicUsize,
}

impl RawSpinLock {
    /// 创建一个新的 RawSpinLock 实例。
    pub const fn new() -> Self {
        RawSpinLock {
            lock: AtomicBool::new(false),
            saved_flags: AtomicUsize::new(0),
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock::new();

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        let guard = IntrGuard::new();

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }

        self.saved_flags.store(guard.into_raw(), Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        let guard = IntrGuard::new();

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.saved_flags.store(guard.into_raw(), Ordering::Relaxed);
            true
        } else {
            // guard 在此 Drop，立即恢复中断状态
            false
        }
    }

    unsafe fn unlock(&self) {
        let flags = self.saved_flags.load(Ordering::Relaxed);
        self.lock.store(false, Ordering::Release);
        // SAFETY: flags 由本锁的持有者在 lock/try_lock 中通过 into_raw 交出
        drop(unsafe { IntrGuard::from_raw(flags) });
    }

    fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}
