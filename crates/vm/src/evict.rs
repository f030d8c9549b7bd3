//! 帧分配与驱逐
//!
//! [`Vm::allocate_frame`] 为缺页方返回一个清零的帧。空闲池为空时，
//! 按时钟（second-chance）算法在帧表中选择牺牲帧：
//!
//! 1. 持帧表锁，按分配先后轮转扫描；跳过被 pin 的页和在途的帧，
//!    访问位为 1 的页清除访问位并放过一轮；
//! 2. 选中后在所有者的锁下把页从页目录摘下，SPT 标记为 `Evicting`，
//!    需要时预先分配交换槽；
//! 3. 放开帧表锁执行写回：干净的文件页直接丢弃，脏的映射页写回文件，
//!    其余写入交换槽；
//! 4. 重新获取帧表锁，更新 SPT 条目并把帧转交给缺页方。
//!
//! 第 4 步发现所有者已经退出（或条目已被拆除）时，释放预先分配的交换槽。
//!
//! 第 3 步写回失败时槽位立即释放，牺牲页带着原来的脏位重新安装回所有者，
//! 本次分配以 [`VmError::Io`] 失败；页内容始终只来自帧本身。

use alloc::sync::Arc;

use sync::SpinLockGuard;

use crate::address::{FrameId, Vpn};
use crate::error::{VmError, VmResult};
use crate::frame_table::{FrameState, FrameTableInner};
use crate::space::AddressSpace;
use crate::spt::{FileBacking, PageKind, Residency};
use crate::swap::SwapSlot;
use crate::system::Vm;

/// 牺牲帧的写回方式
enum EvictAction {
    Discard,
    WriteFile(FileBacking),
    Swap(SwapSlot),
}

/// 已摘下、等待写回的牺牲帧
struct Eviction {
    frame: FrameId,
    /// 所有者已不存在时为 `None`
    owner: Option<Arc<AddressSpace>>,
    vpn: Vpn,
    dirty: bool,
    action: EvictAction,
}

enum Selection {
    Victim(Eviction),
    /// 没有可选的帧，但有帧正在途中
    Busy,
    /// 所有帧都被 pin
    Exhausted,
    /// 只剩需要换出的帧，而交换区已满
    SwapFull,
}

impl Vm {
    /// 为 `owner` 的 `vpn` 分配一个清零的帧，必要时驱逐
    ///
    /// 返回的帧处于 `Loading` 状态，调用者负责填充并安装，或者归还。
    /// 调用时不得持有任何地址空间的锁。
    pub(crate) fn allocate_frame(&self, owner: &Arc<AddressSpace>, vpn: Vpn) -> VmResult<FrameId> {
        let mut ft = self.frames().lock();
        loop {
            if let Some(frame) = ft.claim(owner, vpn) {
                self.memory().zero(frame);
                return Ok(frame);
            }
            match self.select_victim(&mut ft) {
                Selection::Victim(eviction) => {
                    let frame = eviction.frame;
                    match SpinLockGuard::unlocked(&mut ft, || self.write_back(&eviction)) {
                        Ok(slot) => self.finish_eviction(eviction, slot),
                        Err(e) => {
                            if self.abort_eviction(&mut ft, &eviction) {
                                return Err(e);
                            }
                            // 所有者已退出，帧内容不再需要
                        }
                    }
                    ft.reassign(frame, owner, vpn);
                    self.memory().zero(frame);
                    return Ok(frame);
                }
                Selection::Busy => SpinLockGuard::unlocked(&mut ft, core::hint::spin_loop),
                Selection::Exhausted => {
                    log::error!(
                        "vm: all {} user frames are pinned, cannot satisfy pid {}",
                        ft.capacity(),
                        owner.pid()
                    );
                    return Err(VmError::OutOfFrames);
                }
                Selection::SwapFull => {
                    log::error!("vm: swap area exhausted while evicting for pid {}", owner.pid());
                    return Err(VmError::SwapFull);
                }
            }
        }
    }

    /// 时钟扫描，最多两圈
    fn select_victim(&self, ft: &mut FrameTableInner) -> Selection {
        let mut busy = false;
        let mut swap_full = false;
        for _ in 0..ft.queue_len() * 2 {
            let Some(frame) = ft.rotate() else { break };
            let Some((state, vpn, owner)) = ft.entry(frame).map(|e| (e.state, e.vpn, e.owner.upgrade()))
            else {
                continue;
            };
            if state != FrameState::Active {
                busy = true;
                continue;
            }
            let Some(owner) = owner else {
                log::warn!("vm: frame {} outlived its owner, reclaiming", frame.index());
                ft.set_state(frame, FrameState::Evicting);
                return Selection::Victim(Eviction {
                    frame,
                    owner: None,
                    vpn,
                    dirty: false,
                    action: EvictAction::Discard,
                });
            };

            let mut guard = owner.lock_inner();
            let inner = &mut *guard;
            let Some(page) = inner
                .spt
                .lookup(vpn)
                .filter(|p| p.residency == Residency::Resident(frame))
            else {
                log::warn!("vm: stale frame table entry for frame {}", frame.index());
                drop(guard);
                ft.set_state(frame, FrameState::Evicting);
                return Selection::Victim(Eviction {
                    frame,
                    owner: None,
                    vpn,
                    dirty: false,
                    action: EvictAction::Discard,
                });
            };
            if page.is_pinned() {
                continue;
            }
            if inner.page_dir.is_accessed(vpn) {
                inner.page_dir.set_accessed(vpn, false);
                continue;
            }

            let dirty = inner.page_dir.is_dirty(vpn);
            let action = match (page.kind(), page.backing(), dirty) {
                (PageKind::FileReadOnly | PageKind::FileWritable, _, false) => EvictAction::Discard,
                (PageKind::FileWritable, Some(backing), true) => {
                    EvictAction::WriteFile(backing.clone())
                }
                _ => match self.swap().allocate() {
                    Ok(slot) => EvictAction::Swap(slot),
                    Err(_) => {
                        swap_full = true;
                        continue;
                    }
                },
            };

            let _ = inner.page_dir.unmap(vpn);
            if let Some(page) = inner.spt.lookup_mut(vpn) {
                page.begin_eviction();
            }
            drop(guard);
            ft.set_state(frame, FrameState::Evicting);
            log::debug!(
                "vm: evicting frame {} (pid {}, {:?}, dirty={})",
                frame.index(),
                owner.pid(),
                vpn,
                dirty
            );
            return Selection::Victim(Eviction {
                frame,
                owner: Some(owner),
                vpn,
                dirty,
                action,
            });
        }
        if busy {
            Selection::Busy
        } else if swap_full {
            Selection::SwapFull
        } else {
            Selection::Exhausted
        }
    }

    /// 写回牺牲帧，不持有任何 VM 锁
    ///
    /// 换出失败时槽位在此释放，不会被记录到页上。
    fn write_back(&self, eviction: &Eviction) -> VmResult<Option<SwapSlot>> {
        match &eviction.action {
            EvictAction::Discard => Ok(None),
            EvictAction::WriteFile(backing) => {
                self.write_back_file(eviction.frame, backing)?;
                Ok(None)
            }
            EvictAction::Swap(slot) => {
                let page = self.memory().snapshot(eviction.frame);
                if let Err(e) = self.swap().write(*slot, &page) {
                    self.swap().free(*slot);
                    return Err(e);
                }
                Ok(Some(*slot))
            }
        }
    }

    /// 写回失败后把牺牲页装回所有者；调用时持有帧表锁
    ///
    /// 所有者已退出或条目已被拆除时返回 `false`，帧可以直接转交。
    fn abort_eviction(&self, ft: &mut FrameTableInner, eviction: &Eviction) -> bool {
        let Some(owner) = &eviction.owner else {
            return false;
        };
        let mut guard = owner.lock_inner();
        let inner = &mut *guard;
        if inner.status.is_some() {
            return false;
        }
        let Some(page) = inner
            .spt
            .lookup_mut(eviction.vpn)
            .filter(|p| p.residency == Residency::Evicting(eviction.frame))
        else {
            return false;
        };
        page.abort_eviction();
        if let Err(e) = inner.page_dir.map(eviction.vpn, eviction.frame, page.is_writable()) {
            log::error!("vm: cannot reinstall {:?} of pid {}: {:?}", eviction.vpn, owner.pid(), e);
        }
        inner.page_dir.set_dirty(eviction.vpn, eviction.dirty);
        inner.page_dir.set_accessed(eviction.vpn, true);
        ft.set_state(eviction.frame, FrameState::Active);
        log::error!(
            "vm: write-back of frame {} failed, {:?} of pid {} stays resident",
            eviction.frame.index(),
            eviction.vpn,
            owner.pid()
        );
        true
    }

    /// 写回完成后更新所有者的 SPT；调用时持有帧表锁
    fn finish_eviction(&self, eviction: Eviction, slot: Option<SwapSlot>) {
        if let Some(owner) = &eviction.owner {
            let mut inner = owner.lock_inner();
            if inner.status.is_none() {
                if let Some(page) = inner
                    .spt
                    .lookup_mut(eviction.vpn)
                    .filter(|p| p.residency == Residency::Evicting(eviction.frame))
                {
                    page.mark_evicted(slot);
                    return;
                }
            }
        }
        // 所有者在写回期间退出，槽位无人认领
        if let Some(slot) = slot {
            self.swap().free(slot);
        }
    }

    /// 将帧中前 `read_bytes` 字节写回后备文件
    pub(crate) fn write_back_file(&self, frame: FrameId, backing: &FileBacking) -> VmResult<()> {
        let page = self.memory().snapshot(frame);
        let len = backing.read_bytes;
        match self
            .fs_lock()
            .with(|| backing.file.write_at(backing.offset, &page[..len]))
        {
            Ok(n) if n == len => Ok(()),
            Ok(n) => {
                log::error!(
                    "vm: short write-back at offset {:#x}: {} of {} bytes",
                    backing.offset,
                    n,
                    len
                );
                Err(VmError::Io)
            }
            Err(errno) => {
                log::error!("vm: write-back at offset {:#x} failed: {}", backing.offset, errno);
                Err(VmError::Io)
            }
        }
    }
}
