//! 缺页处理与 pin 协议
//!
//! 用户指令触发的缺页和系统调用对用户缓冲区的预检都汇入同一个原语
//! [`AddressSpace::resolve`]：
//!
//! 1. 在 SPT 中查找地址所在页；不存在时做栈增长判定，不满足则终止进程；
//! 2. 页已驻留则直接 pin；
//! 3. 页未驻留则标记为 `Loading`，放开地址空间锁，向帧表申请帧
//!    （可能触发驱逐），从文件、交换槽或清零填充内容；
//! 4. 重新持帧表锁与地址空间锁，安装映射并 pin。
//!
//! `resolve` 要么返回已 pin 的页，要么调用进程已经被终止。
//! 调用者必须 unpin 自己 pin 过的每一页；[`PinnedPages`] 在 Drop 时完成这件事，
//! 因此提前失败的路径也不会遗留 pin。
//!
//! 硬件缺页路径（[`AddressSpace::handle_page_fault`]、[`AddressSpace::read_user`]、
//! [`AddressSpace::write_user`]）与系统调用路径使用同一套终止策略。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::address::{Vaddr, Vpn, VpnRange};
use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::frame_table::FrameState;
use crate::space::AddressSpace;
use crate::spt::{FileBacking, PageDescriptor, PageKind, Residency};
use crate::swap::SwapSlot;
use crate::system::Vm;

/// 页内容的来源
enum Source {
    Zero,
    File(FileBacking),
    Swap(SwapSlot),
}

impl Source {
    fn swap_slot(&self) -> Option<SwapSlot> {
        match self {
            Source::Swap(slot) => Some(*slot),
            _ => None,
        }
    }
}

enum Step {
    Pinned,
    Wait,
    Load(Source, bool),
}

/// 一次直接访问页目录的结果
enum Access {
    Done,
    NotPresent,
    ReadOnly,
    Exited,
}

// ============================================================================
// PinnedPages
// ============================================================================

/// 一组已 pin 的页，Drop 时全部 unpin
pub struct PinnedPages {
    space: Arc<AddressSpace>,
    pages: Vec<Vpn>,
}

impl PinnedPages {
    fn new(space: &Arc<AddressSpace>) -> Self {
        PinnedPages {
            space: Arc::clone(space),
            pages: Vec::new(),
        }
    }

    /// 已 pin 的页
    pub fn pages(&self) -> &[Vpn] {
        &self.pages
    }

    /// 页数
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Drop for PinnedPages {
    fn drop(&mut self) {
        if self.pages.is_empty() {
            return;
        }
        let mut inner = self.space.lock_inner();
        for vpn in self.pages.drain(..) {
            if let Some(page) = inner.spt.lookup_mut(vpn) {
                page.unpin();
            }
        }
    }
}

// ============================================================================
// resolve / unpin
// ============================================================================

impl AddressSpace {
    /// 确保 `addr` 所在页驻留并 pin 住它
    ///
    /// # 参数
    /// * `esp`：用户栈指针，用于栈增长判定
    /// * `write`：即将进行的访问是否为写
    ///
    /// # 返回
    /// 已 pin 的页号。出错时进程已被终止（[`VmError::ProcessExited`] 表示
    /// 进程此前已经退出）。
    pub fn resolve(self: &Arc<Self>, vm: &Vm, addr: Vaddr, esp: Vaddr, write: bool) -> VmResult<Vpn> {
        match self.try_resolve(vm, addr, esp, write) {
            Ok(vpn) => Ok(vpn),
            Err(VmError::ProcessExited) => Err(VmError::ProcessExited),
            Err(e) => Err(self.kill(vm, e)),
        }
    }

    /// 解除 `vpn` 的一次 pin
    pub fn unpin(&self, vpn: Vpn) {
        if let Some(page) = self.lock_inner().spt.lookup_mut(vpn) {
            page.unpin();
        }
    }

    /// 硬件缺页入口：调入页面后立即 unpin
    pub fn handle_page_fault(self: &Arc<Self>, vm: &Vm, addr: Vaddr, esp: Vaddr, write: bool) -> VmResult<()> {
        let vpn = self.resolve(vm, addr, esp, write)?;
        self.unpin(vpn);
        Ok(())
    }

    fn try_resolve(self: &Arc<Self>, vm: &Vm, addr: Vaddr, esp: Vaddr, write: bool) -> VmResult<Vpn> {
        let vpn = addr.floor();
        let (source, writable) = loop {
            match self.prepare(vm, addr, esp, write)? {
                Step::Pinned => return Ok(vpn),
                Step::Wait => core::hint::spin_loop(),
                Step::Load(source, writable) => break (source, writable),
            }
        };

        let frame = match vm.allocate_frame(self, vpn) {
            Ok(frame) => frame,
            Err(e) => {
                self.abort_load(vm, vpn, source.swap_slot());
                return Err(e);
            }
        };

        let mut page = vec![0u8; PAGE_SIZE];
        let filled = match &source {
            Source::Zero => Ok(()),
            Source::File(backing) => read_backing(vm, backing, &mut page),
            // 读完即释放槽位
            Source::Swap(slot) => vm.swap().read_in(*slot, &mut page),
        };
        if let Err(e) = filled {
            vm.frames().lock().release(frame);
            self.abort_load(vm, vpn, None);
            return Err(e);
        }
        vm.memory().fill(frame, &page);

        let mut ft = vm.frames().lock();
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        let still_loading = inner.status.is_none()
            && inner
                .spt
                .lookup(vpn)
                .is_some_and(|p| p.residency == Residency::Loading);
        if !still_loading {
            ft.release(frame);
            return Err(VmError::ProcessExited);
        }
        if let Err(e) = inner.page_dir.map(vpn, frame, writable) {
            ft.release(frame);
            return Err(e.into());
        }
        // 缺页返回后重新执行的访问会置访问位
        inner.page_dir.set_accessed(vpn, true);
        if let Some(page) = inner.spt.lookup_mut(vpn) {
            page.mark_resident(frame);
            page.pin();
        }
        ft.set_state(frame, FrameState::Active);
        Ok(vpn)
    }

    /// 在地址空间锁内完成查找、栈增长和状态判定
    fn prepare(&self, vm: &Vm, addr: Vaddr, esp: Vaddr, write: bool) -> VmResult<Step> {
        let config = vm.config();
        let vpn = addr.floor();
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        if inner.status.is_some() {
            return Err(VmError::ProcessExited);
        }
        if !config.is_user_vaddr(addr.as_usize()) {
            return Err(VmError::InvalidAddress);
        }
        if !inner.spt.contains(vpn) {
            if !config.in_stack_window(addr.as_usize(), esp.as_usize()) {
                return Err(VmError::InvalidAddress);
            }
            if !config.is_stack_access(addr.as_usize(), esp.as_usize()) {
                return Err(VmError::StackLimitExceeded);
            }
            inner.spt.insert(vpn, PageDescriptor::zero(true))?;
            log::debug!("{}: stack grows to {}", self.name(), vpn.start_addr());
        }
        let Some(page) = inner.spt.lookup_mut(vpn) else {
            return Err(VmError::InvalidAddress);
        };
        if write && !page.is_writable() {
            return Err(VmError::WriteToReadOnly);
        }
        Ok(match page.residency {
            Residency::Resident(_) => {
                page.pin();
                Step::Pinned
            }
            Residency::Loading | Residency::Evicting(_) => Step::Wait,
            Residency::NotPresent => {
                let slot = page.begin_load();
                let source = match (page.kind(), slot, page.backing()) {
                    (PageKind::Swapped, Some(slot), _) => Source::Swap(slot),
                    (PageKind::FileReadOnly | PageKind::FileWritable, _, Some(backing)) => {
                        Source::File(backing.clone())
                    }
                    (PageKind::Swapped, None, _) => {
                        log::error!("{}: swapped page {:?} has no slot", self.name(), vpn);
                        Source::Zero
                    }
                    _ => Source::Zero,
                };
                Step::Load(source, page.is_writable())
            }
        })
    }

    /// 页调入失败，恢复条目；条目已不在时归还交换槽
    fn abort_load(&self, vm: &Vm, vpn: Vpn, slot: Option<SwapSlot>) {
        let mut inner = self.lock_inner();
        match inner.spt.lookup_mut(vpn) {
            Some(page) if page.residency == Residency::Loading => page.abort_load(slot),
            _ => {
                if let Some(slot) = slot {
                    vm.swap().free(slot);
                }
            }
        }
    }
}

/// 从后备文件读取一页，页内其余部分保持为零
fn read_backing(vm: &Vm, backing: &FileBacking, page: &mut [u8]) -> VmResult<()> {
    let len = backing.read_bytes;
    match vm
        .fs_lock()
        .with(|| backing.file.read_at(backing.offset, &mut page[..len]))
    {
        Ok(n) if n == len => Ok(()),
        Ok(n) => {
            log::warn!(
                "vm: short read at offset {:#x}: {} of {} bytes",
                backing.offset,
                n,
                len
            );
            Err(VmError::Io)
        }
        Err(errno) => {
            log::warn!("vm: read at offset {:#x} failed: {}", backing.offset, errno);
            Err(VmError::Io)
        }
    }
}

// ============================================================================
// 缓冲区与字符串的 pin
// ============================================================================

impl AddressSpace {
    /// 调入并 pin `[addr, addr + len)` 覆盖的每一页
    ///
    /// 必须在任何可能阻塞的操作（如获取文件系统锁）之前调用。
    /// `write` 为真时每页都必须可写，否则进程被终止。
    pub fn pin_buffer(
        self: &Arc<Self>,
        vm: &Vm,
        addr: Vaddr,
        len: usize,
        esp: Vaddr,
        write: bool,
    ) -> VmResult<PinnedPages> {
        let mut pins = PinnedPages::new(self);
        if len == 0 {
            return Ok(pins);
        }
        let Some(range) = VpnRange::covering(addr, len) else {
            return Err(self.kill(vm, VmError::InvalidAddress));
        };
        for vpn in range {
            let fault_addr = if vpn == addr.floor() { addr } else { vpn.start_addr() };
            let pinned = self.resolve(vm, fault_addr, esp, write)?;
            pins.pages.push(pinned);
        }
        Ok(pins)
    }

    /// 逐页跟随 `addr` 处以 NUL 结尾的字符串，pin 住它经过的每一页
    ///
    /// # 返回
    /// 不含终止符的字节，以及覆盖这些字节的 pin
    pub fn pin_string(self: &Arc<Self>, vm: &Vm, addr: Vaddr, esp: Vaddr) -> VmResult<(Vec<u8>, PinnedPages)> {
        let mut pins = PinnedPages::new(self);
        let mut bytes = Vec::new();
        let mut cursor = addr;
        loop {
            let vpn = self.resolve(vm, cursor, esp, false)?;
            pins.pages.push(vpn);
            let offset = cursor.page_offset();
            let mut terminated = false;
            let access = self.access(vm, vpn, false, |data| {
                let rest = &data[offset..];
                match rest.iter().position(|&b| b == 0) {
                    Some(end) => {
                        bytes.extend_from_slice(&rest[..end]);
                        terminated = true;
                    }
                    None => bytes.extend_from_slice(rest),
                }
            });
            match access {
                Access::Done => {}
                Access::Exited => return Err(VmError::ProcessExited),
                // 已 pin 的页不会缺失
                Access::NotPresent | Access::ReadOnly => {
                    return Err(self.kill(vm, VmError::InvalidAddress));
                }
            }
            if terminated {
                return Ok((bytes, pins));
            }
            cursor = match vpn.checked_step(1) {
                Some(next) => next.start_addr(),
                None => return Err(self.kill(vm, VmError::InvalidAddress)),
            };
        }
    }

    // ========================================================================
    // 经由页目录的访问
    // ========================================================================

    /// 从用户地址 `addr` 读取 `buf.len()` 字节
    ///
    /// 模拟一次用户态访问：命中时置访问位，未命中时经缺页处理调入后重试。
    pub fn read_user(self: &Arc<Self>, vm: &Vm, addr: Vaddr, buf: &mut [u8], esp: Vaddr) -> VmResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let Some(cur) = addr.checked_add(done) else {
                return Err(self.kill(vm, VmError::InvalidAddress));
            };
            let offset = cur.page_offset();
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            let chunk = &mut buf[done..done + n];
            match self.access(vm, cur.floor(), false, |data| {
                chunk.copy_from_slice(&data[offset..offset + n])
            }) {
                Access::Done => done += n,
                Access::NotPresent => self.handle_page_fault(vm, cur, esp, false)?,
                Access::ReadOnly => return Err(self.kill(vm, VmError::WriteToReadOnly)),
                Access::Exited => return Err(VmError::ProcessExited),
            }
        }
        Ok(())
    }

    /// 向用户地址 `addr` 写入 `data`
    ///
    /// 命中时置访问位与脏位；写只读页终止进程。
    pub fn write_user(self: &Arc<Self>, vm: &Vm, addr: Vaddr, data: &[u8], esp: Vaddr) -> VmResult<()> {
        let mut done = 0;
        while done < data.len() {
            let Some(cur) = addr.checked_add(done) else {
                return Err(self.kill(vm, VmError::InvalidAddress));
            };
            let offset = cur.page_offset();
            let n = (PAGE_SIZE - offset).min(data.len() - done);
            let chunk = &data[done..done + n];
            match self.access(vm, cur.floor(), true, |frame| {
                frame[offset..offset + n].copy_from_slice(chunk)
            }) {
                Access::Done => done += n,
                Access::NotPresent => self.handle_page_fault(vm, cur, esp, true)?,
                Access::ReadOnly => return Err(self.kill(vm, VmError::WriteToReadOnly)),
                Access::Exited => return Err(VmError::ProcessExited),
            }
        }
        Ok(())
    }

    /// 经页目录直接访问一页，不触发缺页
    fn access(&self, vm: &Vm, vpn: Vpn, write: bool, f: impl FnOnce(&mut [u8])) -> Access {
        let mut inner = self.lock_inner();
        if inner.status.is_some() {
            return Access::Exited;
        }
        let Some(pte) = inner.page_dir.translate(vpn) else {
            return Access::NotPresent;
        };
        if write && !pte.is_writable() {
            return Access::ReadOnly;
        }
        inner.page_dir.touch(vpn, write);
        vm.memory().with_frame(pte.frame(), f);
        Access::Done
    }
}
