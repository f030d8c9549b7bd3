//! 内存映射文件
//!
//! 每个进程一张 [`MmapTable`]，记录活动的映射。一个映射是一段连续的
//! SPT 条目，全部由同一个打开的文件句柄提供后备，并作为整体拆除。
//!
//! 建立映射时为文件的每一页（向上取整）登记一个可写、惰性加载的
//! 文件页；最后一页只读取文件剩余的字节，其余补零。
//! 拆除映射时逐页处理：驻留且被写过的页先写回文件对应偏移，
//! 然后移除 SPT 条目并归还帧；最后一页拆除后文件句柄随映射一起关闭。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use uapi::mm::MapId;

use crate::address::{Vaddr, Vpn, VpnRange};
use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::file::VmFile;
use crate::frame_table::FrameState;
use crate::space::AddressSpace;
use crate::spt::{PageDescriptor, Residency};
use crate::system::Vm;

// ============================================================================
// MmapRegion / MmapTable
// ============================================================================

/// 一个活动的映射
pub struct MmapRegion {
    id: MapId,
    file: Arc<dyn VmFile>,
    pages: VpnRange,
    length: usize,
}

impl MmapRegion {
    /// 映射标识符
    pub fn id(&self) -> MapId {
        self.id
    }

    /// 覆盖的页
    pub fn pages(&self) -> VpnRange {
        self.pages
    }

    /// 起始地址
    pub fn start(&self) -> Vaddr {
        self.pages.start().start_addr()
    }

    /// 映射的文件字节数
    pub fn length(&self) -> usize {
        self.length
    }

    /// 后备文件
    pub fn file(&self) -> &Arc<dyn VmFile> {
        &self.file
    }
}

// 手动实现 Debug，因为 dyn VmFile 没有实现 Debug
impl fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapRegion")
            .field("id", &self.id)
            .field("file", &"<dyn VmFile>")
            .field("pages", &self.pages)
            .field("length", &self.length)
            .finish()
    }
}

/// 进程的映射表
#[derive(Debug, Default)]
pub struct MmapTable {
    regions: BTreeMap<MapId, MmapRegion>,
    next_id: MapId,
}

impl MmapTable {
    /// 创建空表
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配下一个映射标识符，标识符不复用
    fn allocate_id(&mut self) -> MapId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// 查询映射
    pub fn get(&self, id: MapId) -> Option<&MmapRegion> {
        self.regions.get(&id)
    }

    /// 所有映射的标识符，按建立顺序
    pub fn ids(&self) -> Vec<MapId> {
        self.regions.keys().copied().collect()
    }

    /// 映射数
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// 是否没有映射
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn insert(&mut self, region: MmapRegion) {
        self.regions.insert(region.id, region);
    }

    fn remove(&mut self, id: MapId) -> Option<MmapRegion> {
        self.regions.remove(&id)
    }

    pub(crate) fn clear(&mut self) {
        self.regions.clear();
    }
}

// ============================================================================
// 映射与拆除
// ============================================================================

impl AddressSpace {
    /// 把 `file` 的前 `length` 字节映射到 `addr`
    ///
    /// 映射持有 `file` 直到被拆除；调用者通常传入一个新打开的句柄。
    ///
    /// # 错误
    /// - `addr` 为空或未按页对齐：[`VmError::MisalignedAddress`]
    /// - `length` 为零：[`VmError::EmptyFile`]
    /// - 范围超出用户空间：[`VmError::InvalidAddress`]
    /// - 范围内任一页已有 SPT 条目：[`VmError::AlreadyMapped`]
    pub fn mmap(&self, vm: &Vm, file: Arc<dyn VmFile>, addr: Vaddr, length: usize) -> VmResult<MapId> {
        if addr.is_null() || !addr.is_page_aligned() {
            return Err(VmError::MisalignedAddress);
        }
        if length == 0 {
            return Err(VmError::EmptyFile);
        }
        let pages = VpnRange::covering(addr, length).ok_or(VmError::InvalidAddress)?;
        if pages.end().as_usize() > vm.config().phys_base / PAGE_SIZE {
            return Err(VmError::InvalidAddress);
        }

        let mut inner = self.lock_inner();
        if inner.status.is_some() {
            return Err(VmError::ProcessExited);
        }
        if pages.iter().any(|vpn| inner.spt.contains(vpn)) {
            return Err(VmError::AlreadyMapped);
        }
        let id = inner.mmaps.allocate_id();
        for (i, vpn) in pages.iter().enumerate() {
            let offset = i * PAGE_SIZE;
            let read_bytes = (length - offset).min(PAGE_SIZE);
            inner
                .spt
                .insert(vpn, PageDescriptor::mapped(Arc::clone(&file), offset, read_bytes, id))?;
        }
        inner.mmaps.insert(MmapRegion {
            id,
            file,
            pages,
            length,
        });
        log::debug!(
            "{}: mapping {} at {} ({} bytes, {} pages)",
            self.name(),
            id,
            addr,
            length,
            pages.len()
        );
        Ok(id)
    }

    /// 拆除映射 `id`，脏页写回文件
    ///
    /// 写回失败时映射仍被拆除，返回第一个错误。
    pub fn munmap(&self, vm: &Vm, id: MapId) -> VmResult<()> {
        if !self.is_alive() {
            return Err(VmError::ProcessExited);
        }
        self.unmap_region(vm, id)
    }

    /// 当前所有映射的标识符
    pub fn mappings(&self) -> Vec<MapId> {
        self.lock_inner().mmaps.ids()
    }

    pub(crate) fn unmap_region(&self, vm: &Vm, id: MapId) -> VmResult<()> {
        let pages = {
            let inner = self.lock_inner();
            inner.mmaps.get(id).map(MmapRegion::pages)
        }
        .ok_or(VmError::BadMapId)?;

        let mut result = Ok(());
        for vpn in pages {
            if let Err(e) = self.unmap_page(vm, vpn) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        // 映射与其文件句柄在此一同释放
        let region = self.lock_inner().mmaps.remove(id);
        drop(region);
        log::debug!("{}: unmapped {}", self.name(), id);
        result
    }

    /// 拆除映射中的一页
    fn unmap_page(&self, vm: &Vm, vpn: Vpn) -> VmResult<()> {
        loop {
            let mut ft = vm.frames().lock();
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            let Some(page) = inner.spt.lookup(vpn) else {
                return Ok(());
            };
            match page.residency {
                Residency::Loading | Residency::Evicting(_) => {
                    drop(guard);
                    drop(ft);
                    core::hint::spin_loop();
                }
                Residency::NotPresent => {
                    if let Some(slot) = page.swap_slot() {
                        vm.swap().free(slot);
                    }
                    inner.spt.remove(vpn);
                    return Ok(());
                }
                Residency::Resident(frame) => {
                    let backing = page.backing().cloned();
                    let dirty = inner.page_dir.is_dirty(vpn);
                    let _ = inner.page_dir.unmap(vpn);
                    inner.spt.remove(vpn);
                    // 写回期间扫描方会跳过此帧
                    ft.set_state(frame, FrameState::Evicting);
                    drop(guard);
                    drop(ft);

                    let result = match backing {
                        Some(backing) if dirty => vm.write_back_file(frame, &backing),
                        _ => Ok(()),
                    };
                    vm.frames().lock().release(frame);
                    return result;
                }
            }
        }
    }
}
