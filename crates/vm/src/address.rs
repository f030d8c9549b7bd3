//! 地址抽象
//!
//! 虚拟地址 [`Vaddr`]、虚拟页号 [`Vpn`]、页号范围 [`VpnRange`]
//! 以及物理帧句柄 [`FrameId`]。
//!
//! 所有会越过地址空间边界的算术都是显式检查的，返回 `Option`。

use core::fmt;
use core::ops::Range;

use crate::config::PAGE_SIZE;

// ============================================================================
// Vaddr
// ============================================================================

/// 用户虚拟地址
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vaddr(usize);

impl Vaddr {
    /// 由原始数值创建
    pub const fn new(addr: usize) -> Self {
        Vaddr(addr)
    }

    /// 原始数值
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// 是否为空地址
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// 页内偏移
    pub const fn page_offset(self) -> usize {
        self.0 % PAGE_SIZE
    }

    /// 是否按页对齐
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// 所在页的页号（向下取整）
    pub const fn floor(self) -> Vpn {
        Vpn(self.0 / PAGE_SIZE)
    }

    /// 覆盖该地址所需的最小页号上界（向上取整）
    pub const fn ceil(self) -> Vpn {
        Vpn(self.0.div_ceil(PAGE_SIZE))
    }

    /// 加上偏移，溢出时返回 `None`
    pub const fn checked_add(self, offset: usize) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Vaddr(addr)),
            None => None,
        }
    }
}

impl fmt::Debug for Vaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vaddr({:#x})", self.0)
    }
}

impl fmt::Display for Vaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ============================================================================
// Vpn
// ============================================================================

/// 虚拟页号
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vpn(usize);

impl Vpn {
    /// 由页号创建
    pub const fn new(vpn: usize) -> Self {
        Vpn(vpn)
    }

    /// 原始页号
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// 页的起始地址
    pub const fn start_addr(self) -> Vaddr {
        Vaddr(self.0 * PAGE_SIZE)
    }

    /// 向后移动 `pages` 页，溢出时返回 `None`
    pub const fn checked_step(self, pages: usize) -> Option<Self> {
        match self.0.checked_add(pages) {
            Some(vpn) => Some(Vpn(vpn)),
            None => None,
        }
    }
}

impl fmt::Debug for Vpn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vpn({:#x})", self.0)
    }
}

// ============================================================================
// VpnRange
// ============================================================================

/// 左闭右开的页号范围
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VpnRange {
    start: Vpn,
    end: Vpn,
}

impl VpnRange {
    /// 创建 `[start, end)`，`end < start` 时视为空范围
    pub fn new(start: Vpn, end: Vpn) -> Self {
        let end = if end < start { start } else { end };
        VpnRange { start, end }
    }

    /// 覆盖 `[addr, addr + len)` 的最小页范围，地址溢出时返回 `None`
    pub fn covering(addr: Vaddr, len: usize) -> Option<Self> {
        let end = addr.checked_add(len)?;
        Some(VpnRange::new(addr.floor(), end.ceil()))
    }

    /// 起始页号
    pub fn start(&self) -> Vpn {
        self.start
    }

    /// 结束页号（不含）
    pub fn end(&self) -> Vpn {
        self.end
    }

    /// 页数
    pub fn len(&self) -> usize {
        self.end.0 - self.start.0
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否包含给定页号
    pub fn contains(&self, vpn: Vpn) -> bool {
        self.start <= vpn && vpn < self.end
    }

    /// 逐页迭代
    pub fn iter(&self) -> <Self as IntoIterator>::IntoIter {
        (*self).into_iter()
    }
}

impl IntoIterator for VpnRange {
    type Item = Vpn;
    type IntoIter = core::iter::Map<Range<usize>, fn(usize) -> Vpn>;

    fn into_iter(self) -> Self::IntoIter {
        (self.start.0..self.end.0).map(Vpn as fn(usize) -> Vpn)
    }
}

// ============================================================================
// FrameId
// ============================================================================

/// 用户帧池中的帧索引
///
/// 帧表与 SPT 之间只通过索引互相引用，每次解引用时都要校验对方仍然指回自己。
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

impl FrameId {
    /// 由索引创建
    pub const fn new(index: usize) -> Self {
        FrameId(index)
    }

    /// 在帧池中的索引
    pub const fn index(self) -> usize {
        self.0
    }
}
