//! 帧表
//!
//! 全局物理帧清单：记录每个在用帧属于哪个进程的哪个虚拟页，
//! 并维护按分配先后排列的时钟队列，供置换算法扫描。
//!
//! 帧表由一把全局锁保护，选择牺牲帧、改变帧归属、分配或归还帧
//! 都必须持有它。条目通过 `Weak` 引用所有者，每次使用前都要
//! 确认所有者仍然存在、且其 SPT 条目仍指回本帧。

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use sync::{SpinLock, SpinLockGuard};

use crate::address::{FrameId, Vpn};
use crate::frame_allocator::FrameAllocator;
use crate::space::{AddressSpace, Pid};

/// 帧的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameState {
    /// 已分配给缺页方，正在填充内容
    Loading,
    /// 已安装到所有者的页目录
    Active,
    /// 已被选为牺牲帧，正在写回
    Evicting,
}

/// 帧表条目
pub(crate) struct FrameEntry {
    pub(crate) owner: Weak<AddressSpace>,
    pub(crate) pid: Pid,
    pub(crate) vpn: Vpn,
    pub(crate) state: FrameState,
}

/// 帧表锁内的数据
pub struct FrameTableInner {
    allocator: FrameAllocator,
    entries: Vec<Option<FrameEntry>>,
    /// 时钟队列，队首为最早分配的帧
    order: VecDeque<FrameId>,
}

impl FrameTableInner {
    pub(crate) fn entry(&self, frame: FrameId) -> Option<&FrameEntry> {
        self.entries.get(frame.index())?.as_ref()
    }

    pub(crate) fn set_state(&mut self, frame: FrameId, state: FrameState) {
        if let Some(Some(entry)) = self.entries.get_mut(frame.index()) {
            entry.state = state;
        }
    }

    /// 从空闲池取一个帧交给 `owner` 的 `vpn`，状态为 `Loading`
    pub(crate) fn claim(&mut self, owner: &Arc<AddressSpace>, vpn: Vpn) -> Option<FrameId> {
        let frame = self.allocator.alloc()?;
        self.entries[frame.index()] = Some(FrameEntry {
            owner: Arc::downgrade(owner),
            pid: owner.pid(),
            vpn,
            state: FrameState::Loading,
        });
        self.order.push_back(frame);
        Some(frame)
    }

    /// 把刚驱逐完的帧转交给新所有者，并移到时钟队列末尾
    pub(crate) fn reassign(&mut self, frame: FrameId, owner: &Arc<AddressSpace>, vpn: Vpn) {
        self.entries[frame.index()] = Some(FrameEntry {
            owner: Arc::downgrade(owner),
            pid: owner.pid(),
            vpn,
            state: FrameState::Loading,
        });
        self.order.retain(|&f| f != frame);
        self.order.push_back(frame);
    }

    /// 归还帧到空闲池
    pub(crate) fn release(&mut self, frame: FrameId) {
        if let Some(slot) = self.entries.get_mut(frame.index()) {
            if slot.take().is_some() {
                self.order.retain(|&f| f != frame);
                self.allocator.dealloc(frame);
            }
        }
    }

    /// 时钟指针前进一步：队首移到队尾并返回
    pub(crate) fn rotate(&mut self) -> Option<FrameId> {
        let frame = self.order.pop_front()?;
        self.order.push_back(frame);
        Some(frame)
    }

    /// 时钟队列长度
    pub(crate) fn queue_len(&self) -> usize {
        self.order.len()
    }

    /// 在用帧数
    pub fn live_entries(&self) -> usize {
        self.allocator.allocated()
    }

    /// 帧池大小
    pub fn capacity(&self) -> usize {
        self.allocator.total()
    }
}

/// 帧表
pub struct FrameTable {
    inner: SpinLock<FrameTableInner>,
}

impl FrameTable {
    /// 创建管理 `frames` 个用户帧的帧表
    pub fn new(frames: usize) -> Self {
        let mut entries = Vec::with_capacity(frames);
        entries.resize_with(frames, || None);
        FrameTable {
            inner: SpinLock::new(FrameTableInner {
                allocator: FrameAllocator::new(frames),
                entries,
                order: VecDeque::with_capacity(frames),
            }),
        }
    }

    /// 获取帧表锁
    pub fn lock(&self) -> SpinLockGuard<'_, FrameTableInner> {
        self.inner.lock()
    }

    /// 在用帧数
    pub fn live_entries(&self) -> usize {
        self.lock().live_entries()
    }

    /// 帧池大小
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// 帧当前的所有者与页号
    pub fn owner_of(&self, frame: FrameId) -> Option<(Pid, Vpn)> {
        self.lock().entry(frame).map(|e| (e.pid, e.vpn))
    }
}
