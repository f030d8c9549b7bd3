//! 页目录
//!
//! 进程页目录的软件模型：记录每个已安装页的帧与硬件标志位。
//! 访问位和脏位由 [`PageDir::touch`] 在每次用户访问时置位，
//! 与 MMU 的行为一致；置换算法读取并清除访问位。

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::address::{FrameId, Vpn};

bitflags! {
    /// 页表项标志位（与 x86 PTE 的位布局一致）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// 页存在
        const PRESENT = 1 << 0;
        /// 可写
        const WRITABLE = 1 << 1;
        /// 用户态可访问
        const USER = 1 << 2;
        /// 自上次清除以来被访问过
        const ACCESSED = 1 << 5;
        /// 自安装以来被写过
        const DIRTY = 1 << 6;
    }
}

/// 分页操作中可能发生的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// 虚拟页未被映射
    NotMapped,
    /// 虚拟页已被映射
    AlreadyMapped,
}

/// 页表项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    frame: FrameId,
    flags: PteFlags,
}

impl PageTableEntry {
    /// 映射到的帧
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// 标志位
    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    /// 是否可写
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITABLE)
    }

    /// 是否被写过
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PteFlags::DIRTY)
    }

    /// 是否被访问过
    pub fn is_accessed(&self) -> bool {
        self.flags.contains(PteFlags::ACCESSED)
    }
}

/// 进程页目录
#[derive(Debug, Default)]
pub struct PageDir {
    entries: BTreeMap<Vpn, PageTableEntry>,
}

impl PageDir {
    /// 创建空页目录
    pub fn new() -> Self {
        Self::default()
    }

    /// 安装 `vpn → frame` 映射
    pub fn map(&mut self, vpn: Vpn, frame: FrameId, writable: bool) -> Result<(), PagingError> {
        if self.entries.contains_key(&vpn) {
            return Err(PagingError::AlreadyMapped);
        }
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        flags.set(PteFlags::WRITABLE, writable);
        self.entries.insert(vpn, PageTableEntry { frame, flags });
        Ok(())
    }

    /// 移除映射，返回原页表项
    pub fn unmap(&mut self, vpn: Vpn) -> Result<PageTableEntry, PagingError> {
        self.entries.remove(&vpn).ok_or(PagingError::NotMapped)
    }

    /// 查询映射
    pub fn translate(&self, vpn: Vpn) -> Option<PageTableEntry> {
        self.entries.get(&vpn).copied()
    }

    /// 模拟一次硬件访问：置访问位，写访问再置脏位
    ///
    /// 返回页表项（置位之后），未映射时返回 `None`。
    pub fn touch(&mut self, vpn: Vpn, write: bool) -> Option<PageTableEntry> {
        let pte = self.entries.get_mut(&vpn)?;
        pte.flags.insert(PteFlags::ACCESSED);
        if write {
            pte.flags.insert(PteFlags::DIRTY);
        }
        Some(*pte)
    }

    /// 是否被访问过
    pub fn is_accessed(&self, vpn: Vpn) -> bool {
        self.translate(vpn).is_some_and(|pte| pte.is_accessed())
    }

    /// 设置或清除访问位
    pub fn set_accessed(&mut self, vpn: Vpn, accessed: bool) {
        if let Some(pte) = self.entries.get_mut(&vpn) {
            pte.flags.set(PteFlags::ACCESSED, accessed);
        }
    }

    /// 是否被写过
    pub fn is_dirty(&self, vpn: Vpn) -> bool {
        self.translate(vpn).is_some_and(|pte| pte.is_dirty())
    }

    /// 设置或清除脏位
    pub fn set_dirty(&mut self, vpn: Vpn, dirty: bool) {
        if let Some(pte) = self.entries.get_mut(&vpn) {
            pte.flags.set(PteFlags::DIRTY, dirty);
        }
    }

    /// 已安装的页数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否没有任何映射
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 清空所有映射
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
