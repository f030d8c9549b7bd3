//! 架构相关操作的 Mock 实现

use std::sync::atomic::{AtomicBool, Ordering};

/// Mock 架构操作
pub struct MockArchOps {
    pub interrupt_state: AtomicBool,
}

impl MockArchOps {
    pub const fn new() -> Self {
        Self {
            interrupt_state: AtomicBool::new(true),
        }
    }

    pub unsafe fn read_and_disable_interrupts(&self) -> usize {
        let was = self.interrupt_state.swap(false, Ordering::SeqCst);
        if was { self.intr_enable_bit() } else { 0 }
    }

    pub unsafe fn restore_interrupts(&self, flags: usize) {
        self.interrupt_state
            .store(flags & self.intr_enable_bit() != 0, Ordering::SeqCst);
    }

    pub fn intr_enable_bit(&self) -> usize {
        0x200 // EFLAGS.IF
    }
}

impl Default for MockArchOps {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_ARCH_OPS: MockArchOps = MockArchOps::new();
