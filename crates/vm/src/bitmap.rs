//! 分配位图
//!
//! 每个 bit 表示一个单元（0=空闲，1=已分配），`Vec<u64>` 存储，
//! 用 `trailing_zeros` 按字查找空闲位，并从上次分配位置继续找（next-fit）。
//! 帧分配器与交换区共用。

use alloc::vec;
use alloc::vec::Vec;

pub(crate) struct Bitmap {
    words: Vec<u64>,
    len: usize,
    used: usize,
    /// 上次分配所在的字下标
    hint: usize,
}

impl Bitmap {
    pub(crate) fn new(len: usize) -> Self {
        let mut words = vec![0u64; len.div_ceil(64)];
        // 末尾多出的位永久标记为已分配
        let tail = len % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << tail;
            }
        }
        Bitmap {
            words,
            len,
            used: 0,
            hint: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// 分配一个空闲位，返回其下标
    pub(crate) fn alloc(&mut self) -> Option<usize> {
        let n = self.words.len();
        for step in 0..n {
            let w = (self.hint + step) % n;
            let word = self.words[w];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros() as usize;
                self.words[w] |= 1 << bit;
                self.used += 1;
                self.hint = w;
                return Some(w * 64 + bit);
            }
        }
        None
    }

    /// 释放 `index`
    pub(crate) fn free(&mut self, index: usize) {
        debug_assert!(self.is_set(index), "bitmap: double free of {}", index);
        if !self.is_set(index) {
            return;
        }
        self.words[index / 64] &= !(1 << (index % 64));
        self.used -= 1;
    }
}
