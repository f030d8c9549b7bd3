//! 补充页表（SPT）
//!
//! 每个进程一张，记录每个已知虚拟页的后备来源与驻留状态，
//! 是缺页处理查询的权威元数据。
//!
//! # 驻留状态
//!
//! ```text
//!             resolve                 安装完成
//! NotPresent ─────────▶ Loading ─────────────▶ Resident(frame)
//!     ▲                                            │
//!     │        写回完成                 选为牺牲帧  │
//!     └──────────────── Evicting(frame) ◀──────────┘
//! ```
//!
//! `Loading` 与 `Evicting` 是在途状态：对应的帧正在做阻塞 I/O，
//! 其他执行流遇到时必须放开所有锁后重试。
//!
//! # 不变式
//!
//! - 每个页号在表中至多出现一次；
//! - `Resident(f)` 时帧表中恰有一个条目指回本条目；
//! - 交换槽只在 `NotPresent` 且类型为 [`PageKind::Swapped`] 时有效；
//! - pin 计数非零时页一定驻留。

use alloc::sync::Arc;
use core::fmt;

use hashbrown::HashMap;
use uapi::mm::MapId;

use crate::address::{FrameId, Vpn};
use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::file::VmFile;
use crate::swap::SwapSlot;

// ============================================================================
// 页类型与文件后备
// ============================================================================

/// 页的后备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// 从文件加载，修改后的内容不写回文件（可执行文件段）
    FileReadOnly,
    /// 从文件加载，脏页写回文件（内存映射文件）
    FileWritable,
    /// 首次访问时清零（栈、bss）
    ZeroFill,
    /// 内容在交换区中
    Swapped,
}

/// 文件后备：从 `offset` 开始读 `read_bytes` 字节，页内其余部分补零
#[derive(Clone)]
pub struct FileBacking {
    /// 文件句柄
    pub file: Arc<dyn VmFile>,
    /// 页内容在文件中的偏移
    pub offset: usize,
    /// 从文件读取的字节数，范围 `[0, PAGE_SIZE]`
    pub read_bytes: usize,
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .finish()
    }
}

// ============================================================================
// PageEntry
// ============================================================================

/// 页的驻留状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Residency {
    NotPresent,
    Loading,
    Resident(FrameId),
    Evicting(FrameId),
}

/// SPT 条目
#[derive(Debug)]
pub struct PageEntry {
    vpn: Vpn,
    kind: PageKind,
    writable: bool,
    pub(crate) residency: Residency,
    pin_count: usize,
    backing: Option<FileBacking>,
    swap_slot: Option<SwapSlot>,
    mapping: Option<MapId>,
}

impl PageEntry {
    /// 页号
    pub fn vpn(&self) -> Vpn {
        self.vpn
    }

    /// 后备类型
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    /// 是否可写
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// 是否驻留（在途状态不算驻留）
    pub fn is_resident(&self) -> bool {
        matches!(self.residency, Residency::Resident(_))
    }

    /// 驻留时所在的帧
    pub fn frame(&self) -> Option<FrameId> {
        match self.residency {
            Residency::Resident(f) => Some(f),
            _ => None,
        }
    }

    /// 是否被 pin
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    /// 文件后备
    pub fn backing(&self) -> Option<&FileBacking> {
        self.backing.as_ref()
    }

    /// 交换槽
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.swap_slot
    }

    /// 所属映射
    pub fn mapping(&self) -> Option<MapId> {
        self.mapping
    }

    pub(crate) fn pin(&mut self) {
        debug_assert!(self.is_resident(), "spt: pinning a non-resident page");
        self.pin_count += 1;
    }

    pub(crate) fn unpin(&mut self) {
        self.pin_count = self.pin_count.saturating_sub(1);
    }

    /// 安装完成：页驻留在 `frame` 中
    pub(crate) fn mark_resident(&mut self, frame: FrameId) {
        self.residency = Residency::Resident(frame);
        self.swap_slot = None;
    }

    /// 被选为牺牲帧，内容正在写回
    pub(crate) fn begin_eviction(&mut self) {
        if let Residency::Resident(f) = self.residency {
            self.residency = Residency::Evicting(f);
        }
    }

    /// 写回失败：页仍驻留在原来的帧中
    pub(crate) fn abort_eviction(&mut self) {
        if let Residency::Evicting(f) = self.residency {
            self.residency = Residency::Resident(f);
        }
    }

    /// 写回完成：页不再驻留，内容在 `slot` 中（若有）
    pub(crate) fn mark_evicted(&mut self, slot: Option<SwapSlot>) {
        self.residency = Residency::NotPresent;
        self.pin_count = 0;
        if let Some(slot) = slot {
            self.kind = PageKind::Swapped;
            self.swap_slot = Some(slot);
        }
    }

    /// 开始加载：取走交换槽，由加载方负责读入并释放
    pub(crate) fn begin_load(&mut self) -> Option<SwapSlot> {
        self.residency = Residency::Loading;
        self.swap_slot.take()
    }

    /// 加载失败：恢复到加载前的状态
    pub(crate) fn abort_load(&mut self, slot: Option<SwapSlot>) {
        self.residency = Residency::NotPresent;
        self.swap_slot = slot;
    }
}

// ============================================================================
// PageDescriptor
// ============================================================================

/// 插入 SPT 时的页描述
#[derive(Debug, Clone)]
pub struct PageDescriptor {
    kind: PageKind,
    writable: bool,
    backing: Option<FileBacking>,
    mapping: Option<MapId>,
}

impl PageDescriptor {
    /// 首次访问时清零的页
    pub fn zero(writable: bool) -> Self {
        PageDescriptor {
            kind: PageKind::ZeroFill,
            writable,
            backing: None,
            mapping: None,
        }
    }

    /// 可执行文件段中的页，修改过的内容进交换区
    ///
    /// `read_bytes` 超过一页时截断为一页。
    pub fn file(file: Arc<dyn VmFile>, offset: usize, read_bytes: usize, writable: bool) -> Self {
        PageDescriptor {
            kind: PageKind::FileReadOnly,
            writable,
            backing: Some(FileBacking {
                file,
                offset,
                read_bytes: read_bytes.min(PAGE_SIZE),
            }),
            mapping: None,
        }
    }

    /// 内存映射文件中的页，可写，脏页写回文件
    pub fn mapped(file: Arc<dyn VmFile>, offset: usize, read_bytes: usize, id: MapId) -> Self {
        PageDescriptor {
            kind: PageKind::FileWritable,
            writable: true,
            backing: Some(FileBacking {
                file,
                offset,
                read_bytes: read_bytes.min(PAGE_SIZE),
            }),
            mapping: Some(id),
        }
    }

    /// 后备类型
    pub fn kind(&self) -> PageKind {
        self.kind
    }
}

// ============================================================================
// SupplementalPageTable
// ============================================================================

/// 补充页表
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    entries: HashMap<Vpn, PageEntry>,
}

impl SupplementalPageTable {
    /// 创建空表
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询条目
    pub fn lookup(&self, vpn: Vpn) -> Option<&PageEntry> {
        self.entries.get(&vpn)
    }

    pub(crate) fn lookup_mut(&mut self, vpn: Vpn) -> Option<&mut PageEntry> {
        self.entries.get_mut(&vpn)
    }

    /// 是否已有条目
    pub fn contains(&self, vpn: Vpn) -> bool {
        self.entries.contains_key(&vpn)
    }

    /// 插入新条目，地址已有条目时失败
    pub fn insert(&mut self, vpn: Vpn, desc: PageDescriptor) -> VmResult<&mut PageEntry> {
        match self.entries.entry(vpn) {
            hashbrown::hash_map::Entry::Occupied(_) => Err(VmError::AlreadyMapped),
            hashbrown::hash_map::Entry::Vacant(slot) => Ok(slot.insert(PageEntry {
                vpn,
                kind: desc.kind,
                writable: desc.writable,
                residency: Residency::NotPresent,
                pin_count: 0,
                backing: desc.backing,
                swap_slot: None,
                mapping: desc.mapping,
            })),
        }
    }

    /// 移除条目
    pub(crate) fn remove(&mut self, vpn: Vpn) -> Option<PageEntry> {
        self.entries.remove(&vpn)
    }

    /// 条目数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 遍历所有条目
    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }

    /// 取出全部条目，表变为空
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = PageEntry> + '_ {
        self.entries.drain().map(|(_, entry)| entry)
    }
}
