//! 进程地址空间
//!
//! [`AddressSpace`] 保存一个用户进程的全部虚拟内存状态：SPT、页目录、
//! 内存映射表以及退出状态。缺页处理、pin 协议和映射操作分别在
//! [`crate::fault`] 与 [`crate::mmap`] 中以 `impl AddressSpace` 的形式给出。
//!
//! 进程退出时（[`AddressSpace::exit`]）先拆除所有映射，再在帧表锁下
//! 归还所有帧与交换槽。退出是幂等的，并且可以与正在搬运本进程某一帧的
//! 驱逐并发：在途的帧由搬运方在重新获取帧表锁后自行收尾。

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use sync::{SpinLock, SpinLockGuard};
use uapi::mm::MapId;
use uapi::wait::EXIT_MEMORY_VIOLATION;

use crate::address::{FrameId, Vaddr, VpnRange};
use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::file::VmFile;
use crate::mmap::MmapTable;
use crate::page_table::PageDir;
use crate::spt::{PageDescriptor, PageKind, Residency, SupplementalPageTable};
use crate::swap::SwapSlot;
use crate::system::Vm;

/// 进程标识符
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(usize);

impl Pid {
    /// 由数值创建
    pub const fn new(pid: usize) -> Self {
        Pid(pid)
    }

    /// 原始数值
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 地址空间锁内的数据
pub(crate) struct SpaceInner {
    pub(crate) spt: SupplementalPageTable,
    pub(crate) page_dir: PageDir,
    pub(crate) mmaps: MmapTable,
    /// 退出后为 `Some(status)`
    pub(crate) status: Option<i32>,
    pub(crate) kill_reason: Option<VmError>,
}

/// 一个用户进程的虚拟内存状态
pub struct AddressSpace {
    pid: Pid,
    name: String,
    inner: SpinLock<SpaceInner>,
    exiting: AtomicBool,
}

/// 单个虚拟页的状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// 后备类型
    pub kind: PageKind,
    /// 是否可写
    pub writable: bool,
    /// 是否驻留
    pub resident: bool,
    /// 是否正在加载或驱逐
    pub in_transit: bool,
    /// 是否被 pin
    pub pinned: bool,
    /// 驻留时所在的帧
    pub frame: Option<FrameId>,
    /// 换出时所在的交换槽
    pub swap_slot: Option<SwapSlot>,
    /// 所属映射
    pub mapping: Option<MapId>,
    /// 页目录中的访问位
    pub accessed: bool,
    /// 页目录中的脏位
    pub dirty: bool,
}

impl AddressSpace {
    /// 创建空地址空间
    pub fn new(pid: Pid, name: &str) -> Arc<Self> {
        Arc::new(AddressSpace {
            pid,
            name: String::from(name),
            inner: SpinLock::new(SpaceInner {
                spt: SupplementalPageTable::new(),
                page_dir: PageDir::new(),
                mmaps: MmapTable::new(),
                status: None,
                kill_reason: None,
            }),
            exiting: AtomicBool::new(false),
        })
    }

    /// 进程标识符
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// 进程名
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lock_inner(&self) -> SpinLockGuard<'_, SpaceInner> {
        self.inner.lock()
    }

    /// 进程是否仍在运行
    pub fn is_alive(&self) -> bool {
        !self.exiting.load(Ordering::Acquire)
    }

    /// 退出状态，尚未退出时为 `None`
    pub fn exit_status(&self) -> Option<i32> {
        self.lock_inner().status
    }

    /// 被内核终止的原因
    pub fn kill_reason(&self) -> Option<VmError> {
        self.lock_inner().kill_reason
    }

    /// 是否因非法内存访问被终止
    pub fn killed_by_violation(&self) -> bool {
        self.kill_reason().is_some_and(VmError::is_memory_violation)
    }

    /// `addr` 所在页的状态快照
    pub fn page_info(&self, addr: Vaddr) -> Option<PageInfo> {
        let vpn = addr.floor();
        let inner = self.lock_inner();
        let page = inner.spt.lookup(vpn)?;
        Some(PageInfo {
            kind: page.kind(),
            writable: page.is_writable(),
            resident: page.is_resident(),
            in_transit: matches!(page.residency, Residency::Loading | Residency::Evicting(_)),
            pinned: page.is_pinned(),
            frame: page.frame(),
            swap_slot: page.swap_slot(),
            mapping: page.mapping(),
            accessed: inner.page_dir.is_accessed(vpn),
            dirty: inner.page_dir.is_dirty(vpn),
        })
    }

    /// SPT 中的页数
    pub fn page_count(&self) -> usize {
        self.lock_inner().spt.len()
    }

    /// 驻留的页数
    pub fn resident_pages(&self) -> usize {
        self.lock_inner().page_dir.len()
    }

    /// 在 SPT 中登记一个页，首次访问时才分配帧
    pub fn register_page(&self, addr: Vaddr, desc: PageDescriptor) -> VmResult<()> {
        if !addr.is_page_aligned() {
            return Err(VmError::MisalignedAddress);
        }
        let mut inner = self.lock_inner();
        if inner.status.is_some() {
            return Err(VmError::ProcessExited);
        }
        inner.spt.insert(addr.floor(), desc).map(|_| ())
    }

    /// 惰性登记可执行文件的一个段
    ///
    /// 从 `file` 的 `offset` 开始，为 `upage` 起的 `(read_bytes + zero_bytes) / PAGE_SIZE`
    /// 个页登记条目：每页读取 `min(剩余 read_bytes, PAGE_SIZE)` 字节，其余补零；
    /// 不需要读文件的页登记为清零页。
    ///
    /// # 参数
    /// * `upage`、`offset`：必须按页对齐
    /// * `read_bytes + zero_bytes`：必须是页大小的整数倍
    ///
    /// 任一页已被登记时整个段都不登记。
    #[allow(clippy::too_many_arguments)]
    pub fn load_segment(
        &self,
        vm: &Vm,
        file: Arc<dyn VmFile>,
        offset: usize,
        upage: Vaddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> VmResult<()> {
        let total = read_bytes
            .checked_add(zero_bytes)
            .ok_or(VmError::InvalidAddress)?;
        if !upage.is_page_aligned() || offset % PAGE_SIZE != 0 || total % PAGE_SIZE != 0 {
            return Err(VmError::MisalignedAddress);
        }
        let range = VpnRange::covering(upage, total).ok_or(VmError::InvalidAddress)?;
        if upage.is_null() || range.end().as_usize() > vm.config().phys_base / PAGE_SIZE {
            return Err(VmError::InvalidAddress);
        }

        let mut inner = self.lock_inner();
        if inner.status.is_some() {
            return Err(VmError::ProcessExited);
        }
        if range.iter().any(|vpn| inner.spt.contains(vpn)) {
            return Err(VmError::AlreadyMapped);
        }
        let mut remaining = read_bytes;
        let mut file_offset = offset;
        for vpn in range {
            let page_read = remaining.min(PAGE_SIZE);
            let desc = if page_read == 0 {
                PageDescriptor::zero(writable)
            } else {
                PageDescriptor::file(Arc::clone(&file), file_offset, page_read, writable)
            };
            inner.spt.insert(vpn, desc)?;
            remaining -= page_read;
            file_offset += page_read;
        }
        Ok(())
    }

    /// 建立初始用户栈：登记栈顶的一页并立即调入
    ///
    /// # 返回
    /// 初始栈指针（用户空间上界）
    pub fn setup_stack(self: &Arc<Self>, vm: &Vm) -> VmResult<Vaddr> {
        let top = Vaddr::new(vm.config().phys_base);
        let page = Vaddr::new(vm.config().phys_base - PAGE_SIZE);
        self.register_page(page, PageDescriptor::zero(true))?;
        self.handle_page_fault(vm, page, top, true)?;
        Ok(top)
    }

    /// 进程退出
    ///
    /// 拆除所有映射（脏页写回文件），归还所有帧与交换槽。
    /// 重复调用无效果。
    pub fn exit(self: &Arc<Self>, vm: &Vm, status: i32) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return;
        }

        let ids = self.lock_inner().mmaps.ids();
        for id in ids {
            if let Err(e) = self.unmap_region(vm, id) {
                log::error!("{}: write-back of mapping {} failed: {}", self.name, id, e);
            }
        }

        let mut ft = vm.frames().lock();
        let mut inner = self.lock_inner();
        inner.status = Some(status);
        let (mut frames, mut slots) = (0usize, 0usize);
        for page in inner.spt.drain() {
            match page.residency {
                Residency::Resident(frame) => {
                    ft.release(frame);
                    frames += 1;
                }
                Residency::NotPresent => {
                    if let Some(slot) = page.swap_slot() {
                        vm.swap().free(slot);
                        slots += 1;
                    }
                }
                // 在途的帧和交换槽由加载方或驱逐方收尾
                Residency::Loading | Residency::Evicting(_) => {}
            }
        }
        inner.page_dir.clear();
        inner.mmaps.clear();
        log::debug!(
            "{} (pid {}): exit({}), released {} frames and {} swap slots",
            self.name,
            self.pid,
            status,
            frames,
            slots
        );
    }

    /// 因 `reason` 终止进程，返回 `reason`
    pub(crate) fn kill(self: &Arc<Self>, vm: &Vm, reason: VmError) -> VmError {
        {
            let mut inner = self.lock_inner();
            if inner.status.is_none() && inner.kill_reason.is_none() {
                inner.kill_reason = Some(reason);
            }
        }
        if reason.is_resource_exhaustion() {
            log::error!("{} (pid {}): terminated: {}", self.name, self.pid, reason);
        } else {
            log::warn!("{} (pid {}): killed: {}", self.name, self.pid, reason);
        }
        self.exit(vm, EXIT_MEMORY_VIOLATION);
        reason
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}
