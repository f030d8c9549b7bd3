//! 文件系统协作者接口
//!
//! 虚拟内存子系统只依赖这里的最小接口：可按偏移读写的文件句柄、
//! 按名字打开文件的文件系统、控制台输出，以及全局文件系统锁。

use alloc::sync::Arc;

use sync::SpinLock;

/// 可用于按需调页和内存映射的文件句柄
///
/// 错误以负 errno 返回。
pub trait VmFile: Send + Sync {
    /// 从指定偏移读取数据到缓冲区，返回实际读取的字节数
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize>;

    /// 将缓冲区数据写入指定偏移，返回实际写入的字节数
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize>;

    /// 文件长度（字节）
    fn length(&self) -> usize;

    /// 打开同一文件的独立句柄
    ///
    /// 映射持有自己的句柄，之后关闭原描述符不影响映射。
    fn reopen(&self) -> Result<Arc<dyn VmFile>, isize>;
}

/// 文件系统
pub trait FileSystem: Send + Sync {
    /// 按名字打开文件
    fn open(&self, name: &str) -> Option<Arc<dyn VmFile>>;

    /// 创建初始长度为 `initial_size` 的文件
    fn create(&self, name: &str, initial_size: usize) -> bool;

    /// 删除文件
    fn remove(&self, name: &str) -> bool;
}

/// 控制台输出
pub trait Console: Send + Sync {
    /// 输出一段字节
    fn write(&self, bytes: &[u8]);
}

/// 全局文件系统锁
///
/// 串行化系统中所有的文件读写、求长度和打开操作。
/// 只在单次 I/O 调用期间持有，且获取时不能持有任何其他 VM 锁。
pub struct FsLock {
    lock: SpinLock<()>,
}

impl FsLock {
    /// 创建文件系统锁
    pub const fn new() -> Self {
        FsLock {
            lock: SpinLock::new(()),
        }
    }

    /// 持锁执行 `f`
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        f()
    }

    /// 锁当前是否被持有
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

impl Default for FsLock {
    fn default() -> Self {
        Self::new()
    }
}
