//! 文件系统相关操作的 Mock 实现
//!
//! 注意：这里不直接依赖 `vm` crate（避免循环依赖）。
//! `vm` crate 在 `cfg(test)` 下为这些类型实现其 trait（例如 `VmFile`）。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct FileState {
    data: Mutex<Vec<u8>>,
    /// 每次写入的 (offset, len)
    writes: Mutex<Vec<(usize, usize)>>,
    handles: AtomicUsize,
    fail_writes: AtomicBool,
}

/// 内存中的文件句柄
///
/// 同一文件的多个句柄（`reopen` 得到）共享内容。
/// 句柄 Drop 时打开计数减一，用于检查映射拆除后文件是否被关闭。
pub struct MockFile {
    state: Arc<FileState>,
}

impl MockFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            state: Arc::new(FileState {
                data: Mutex::new(data),
                writes: Mutex::new(Vec::new()),
                handles: AtomicUsize::new(1),
                fail_writes: AtomicBool::new(false),
            }),
        }
    }

    /// 按 `byte_at(i)` 生成长度为 `len` 的文件
    pub fn with_pattern(len: usize, byte_at: impl Fn(usize) -> u8) -> Self {
        Self::new((0..len).map(byte_at).collect())
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.state.data.lock().unwrap();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    /// 写入不会扩展文件长度
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return 0;
        }
        let mut data = self.state.data.lock().unwrap();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        self.state.writes.lock().unwrap().push((offset, n));
        n
    }

    pub fn len(&self) -> usize {
        self.state.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 打开同一文件的新句柄
    pub fn reopen(&self) -> Self {
        self.state.handles.fetch_add(1, Ordering::SeqCst);
        Self {
            state: Arc::clone(&self.state),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.state.data.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(usize, usize)> {
        self.state.writes.lock().unwrap().clone()
    }

    /// 让之后对该文件的所有写操作失败（写入 0 字节）
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 当前仍然打开的句柄数
    pub fn open_handles(&self) -> usize {
        self.state.handles.load(Ordering::SeqCst)
    }
}

impl Drop for MockFile {
    fn drop(&mut self) {
        self.state.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 按名字索引的内存文件系统
#[derive(Default)]
pub struct MockFileSystem {
    files: Mutex<BTreeMap<String, MockFile>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入一个文件，返回保留在文件系统中的句柄的新副本
    pub fn insert(&self, name: &str, data: Vec<u8>) -> MockFile {
        let file = MockFile::new(data);
        let handle = file.reopen();
        self.files.lock().unwrap().insert(name.to_string(), file);
        handle
    }

    pub fn open(&self, name: &str) -> Option<MockFile> {
        self.files.lock().unwrap().get(name).map(MockFile::reopen)
    }

    pub fn create(&self, name: &str, initial_size: usize) -> bool {
        let mut files = self.files.lock().unwrap();
        if name.is_empty() || files.contains_key(name) {
            return false;
        }
        files.insert(name.to_string(), MockFile::new(vec![0; initial_size]));
        true
    }

    pub fn remove(&self, name: &str) -> bool {
        self.files.lock().unwrap().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.lock().unwrap().contains_key(name)
    }
}

/// 收集所有输出的控制台
#[derive(Default)]
pub struct MockConsole {
    out: Mutex<Vec<u8>>,
}

impl MockConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, bytes: &[u8]) {
        self.out.lock().unwrap().extend_from_slice(bytes);
    }

    pub fn output(&self) -> Vec<u8> {
        self.out.lock().unwrap().clone()
    }
}
