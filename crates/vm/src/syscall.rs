//! 依赖 pin 协议的系统调用
//!
//! 参数的获取与分发在此之外完成；这里的每个调用都已拿到解码后的参数。
//! 所有涉及用户缓冲区或用户字符串的调用都先 pin 住相关页，
//! 然后才获取文件系统锁，因此持有文件系统锁期间不会发生缺页。
//!
//! 返回 `Err` 表示发起调用的进程已经被终止：它的文件描述符已关闭，
//! 退出信息已输出，调用者不应再返回用户态。

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use sync::SpinLock;
use uapi::fcntl::{FIRST_FILE_FD, STDIN_FILENO, STDOUT_FILENO};
use uapi::mm::{MAP_FAILED, MapId};
use uapi::wait::{EXIT_BAD_ARGUMENT, EXIT_MEMORY_VIOLATION};

use crate::address::Vaddr;
use crate::error::{VmError, VmResult};
use crate::file::{Console, FileSystem, VmFile};
use crate::space::AddressSpace;
use crate::system::Vm;

// ============================================================================
// 文件描述符表
// ============================================================================

/// 一个打开的文件及其读写位置
pub struct OpenFile {
    file: Arc<dyn VmFile>,
    pos: usize,
}

impl OpenFile {
    fn new(file: Arc<dyn VmFile>) -> Self {
        OpenFile { file, pos: 0 }
    }

    /// 文件句柄
    pub fn file(&self) -> &Arc<dyn VmFile> {
        &self.file
    }

    /// 当前位置
    pub fn pos(&self) -> usize {
        self.pos
    }
}

/// 进程的文件描述符表
///
/// 0 和 1 固定为标准输入输出，打开的文件从 2 开始依次编号，编号不复用。
pub struct FdTable {
    files: BTreeMap<i32, OpenFile>,
    next_fd: i32,
}

impl FdTable {
    /// 创建空表
    pub fn new() -> Self {
        FdTable {
            files: BTreeMap::new(),
            next_fd: FIRST_FILE_FD,
        }
    }

    /// 登记一个打开的文件，返回其描述符
    pub fn insert(&mut self, file: Arc<dyn VmFile>) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.files.insert(fd, OpenFile::new(file));
        fd
    }

    /// 查询描述符
    pub fn get(&self, fd: i32) -> Option<&OpenFile> {
        self.files.get(&fd)
    }

    /// 查询描述符（可变）
    pub fn get_mut(&mut self, fd: i32) -> Option<&mut OpenFile> {
        self.files.get_mut(&fd)
    }

    /// 移除描述符
    pub fn remove(&mut self, fd: i32) -> Option<OpenFile> {
        self.files.remove(&fd)
    }

    /// 取走所有打开的文件
    pub fn take_all(&mut self) -> Vec<OpenFile> {
        core::mem::take(&mut self.files).into_values().collect()
    }

    /// 打开的文件数
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// 是否没有打开的文件
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FdTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdTable")
            .field("open", &self.files.len())
            .field("next_fd", &self.next_fd)
            .finish()
    }
}

// ============================================================================
// UserProcess
// ============================================================================

/// 用户进程：地址空间加上文件描述符
pub struct UserProcess {
    space: Arc<AddressSpace>,
    fds: SpinLock<FdTable>,
    exited: AtomicBool,
}

impl UserProcess {
    /// 为地址空间创建进程
    pub fn new(space: Arc<AddressSpace>) -> Arc<Self> {
        Arc::new(UserProcess {
            space,
            fds: SpinLock::new(FdTable::new()),
            exited: AtomicBool::new(false),
        })
    }

    /// 地址空间
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// 打开的文件数
    pub fn open_files(&self) -> usize {
        self.fds.lock().len()
    }

    /// 进程退出：关闭所有文件，释放地址空间，输出退出信息
    ///
    /// 地址空间已被内核终止时，以其记录的退出状态为准。重复调用无效果。
    pub fn exit(&self, vm: &Vm, status: i32) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        let files = self.fds.lock().take_all();
        vm.fs_lock().with(|| drop(files));
        self.space.exit(vm, status);
        let status = self.space.exit_status().unwrap_or(status);
        log::info!("{}: exit({})", self.space.name(), status);
    }
}

impl fmt::Debug for UserProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserProcess")
            .field("space", &self.space)
            .field("fds", &*self.fds.lock())
            .finish()
    }
}

// ============================================================================
// SyscallHandler
// ============================================================================

/// 系统调用的实现
///
/// `esp` 参数是陷入时的用户栈指针，用于判定对用户缓冲区的访问是否属于栈增长。
pub struct SyscallHandler<'a> {
    vm: &'a Vm,
    fs: &'a dyn FileSystem,
    console: &'a dyn Console,
}

impl<'a> SyscallHandler<'a> {
    /// 创建处理器
    pub fn new(vm: &'a Vm, fs: &'a dyn FileSystem, console: &'a dyn Console) -> Self {
        SyscallHandler { vm, fs, console }
    }

    /// 进程已被终止，补完退出流程
    fn terminated<T>(&self, proc: &UserProcess, e: VmError) -> VmResult<T> {
        proc.exit(self.vm, EXIT_MEMORY_VIOLATION);
        Err(e)
    }

    /// 以非法参数终止进程
    fn reject<T>(&self, proc: &UserProcess, e: VmError) -> VmResult<T> {
        log::warn!("{}: bad argument: {}", proc.space.name(), e);
        proc.exit(self.vm, EXIT_BAD_ARGUMENT);
        Err(e)
    }

    /// pin 并读取用户字符串；名字不是合法 UTF-8 时返回 `None`
    fn user_string(&self, proc: &UserProcess, addr: Vaddr, esp: Vaddr) -> VmResult<Option<String>> {
        match proc.space.pin_string(self.vm, addr, esp) {
            // pin 只需覆盖从用户内存拷出的过程
            Ok((bytes, _pins)) => Ok(String::from_utf8(bytes).ok()),
            Err(e) => self.terminated(proc, e),
        }
    }

    fn file_of(&self, proc: &UserProcess, fd: i32) -> Option<(Arc<dyn VmFile>, usize)> {
        proc.fds
            .lock()
            .get(fd)
            .map(|open| (Arc::clone(&open.file), open.pos))
    }

    fn advance(&self, proc: &UserProcess, fd: i32, to: usize) {
        if let Some(open) = proc.fds.lock().get_mut(fd) {
            open.pos = to;
        }
    }

    /// 创建文件
    pub fn create(&self, proc: &UserProcess, name: Vaddr, initial_size: usize, esp: Vaddr) -> VmResult<bool> {
        let Some(name) = self.user_string(proc, name, esp)? else {
            return Ok(false);
        };
        Ok(self.vm.fs_lock().with(|| self.fs.create(&name, initial_size)))
    }

    /// 删除文件
    pub fn remove(&self, proc: &UserProcess, name: Vaddr, esp: Vaddr) -> VmResult<bool> {
        let Some(name) = self.user_string(proc, name, esp)? else {
            return Ok(false);
        };
        Ok(self.vm.fs_lock().with(|| self.fs.remove(&name)))
    }

    /// 打开文件，失败时返回 -1
    pub fn open(&self, proc: &UserProcess, name: Vaddr, esp: Vaddr) -> VmResult<i32> {
        let Some(name) = self.user_string(proc, name, esp)? else {
            return Ok(-1);
        };
        let Some(file) = self.vm.fs_lock().with(|| self.fs.open(&name)) else {
            return Ok(-1);
        };
        Ok(proc.fds.lock().insert(file))
    }

    /// 关闭文件；描述符不存在时终止进程
    pub fn close(&self, proc: &UserProcess, fd: i32) -> VmResult<()> {
        let open = if fd < FIRST_FILE_FD {
            None
        } else {
            proc.fds.lock().remove(fd)
        };
        match open {
            Some(open) => {
                self.vm.fs_lock().with(|| drop(open));
                Ok(())
            }
            None => self.reject(proc, VmError::BadFd),
        }
    }

    /// 文件长度，描述符不存在时返回 -1
    pub fn filesize(&self, proc: &UserProcess, fd: i32) -> VmResult<isize> {
        let Some((file, _)) = self.file_of(proc, fd) else {
            return Ok(-1);
        };
        Ok(self.vm.fs_lock().with(|| file.length()) as isize)
    }

    /// 从 `fd` 读取最多 `len` 字节到用户缓冲区 `buf`
    ///
    /// 缓冲区的每一页都必须可写。
    pub fn read(&self, proc: &UserProcess, fd: i32, buf: Vaddr, len: usize, esp: Vaddr) -> VmResult<isize> {
        let _pins = match proc.space.pin_buffer(self.vm, buf, len, esp, true) {
            Ok(pins) => pins,
            Err(e) => return self.terminated(proc, e),
        };
        if fd == STDIN_FILENO {
            return Ok(0);
        }
        if fd == STDOUT_FILENO {
            return self.reject(proc, VmError::BadFd);
        }
        let Some((file, pos)) = self.file_of(proc, fd) else {
            return Ok(-1);
        };

        let mut data = vec![0u8; len];
        let n = match self.vm.fs_lock().with(|| file.read_at(pos, &mut data)) {
            Ok(n) => n,
            Err(_) => return Ok(-1),
        };
        self.advance(proc, fd, pos + n);
        if let Err(e) = proc.space.write_user(self.vm, buf, &data[..n], esp) {
            return self.terminated(proc, e);
        }
        Ok(n as isize)
    }

    /// 把用户缓冲区 `buf` 的 `len` 字节写入 `fd`
    pub fn write(&self, proc: &UserProcess, fd: i32, buf: Vaddr, len: usize, esp: Vaddr) -> VmResult<isize> {
        let _pins = match proc.space.pin_buffer(self.vm, buf, len, esp, false) {
            Ok(pins) => pins,
            Err(e) => return self.terminated(proc, e),
        };
        if fd == STDIN_FILENO {
            return self.reject(proc, VmError::BadFd);
        }
        let mut data = vec![0u8; len];
        if let Err(e) = proc.space.read_user(self.vm, buf, &mut data, esp) {
            return self.terminated(proc, e);
        }
        if fd == STDOUT_FILENO {
            self.vm.fs_lock().with(|| self.console.write(&data));
            return Ok(len as isize);
        }
        let Some((file, pos)) = self.file_of(proc, fd) else {
            return Ok(-1);
        };
        match self.vm.fs_lock().with(|| file.write_at(pos, &data)) {
            Ok(n) => {
                self.advance(proc, fd, pos + n);
                Ok(n as isize)
            }
            Err(_) => Ok(-1),
        }
    }

    /// 设置读写位置
    pub fn seek(&self, proc: &UserProcess, fd: i32, position: usize) {
        self.advance(proc, fd, position);
    }

    /// 当前读写位置，描述符不存在时返回 -1
    pub fn tell(&self, proc: &UserProcess, fd: i32) -> isize {
        self.file_of(proc, fd).map_or(-1, |(_, pos)| pos as isize)
    }

    /// 把 `fd` 对应文件的全部内容映射到 `addr`
    ///
    /// 映射使用重新打开的独立句柄。任何失败都返回 [`MAP_FAILED`]，不终止进程。
    pub fn mmap(&self, proc: &UserProcess, fd: i32, addr: Vaddr) -> VmResult<MapId> {
        if fd == STDIN_FILENO || fd == STDOUT_FILENO {
            return Ok(MAP_FAILED);
        }
        let Some((file, _)) = self.file_of(proc, fd) else {
            return Ok(MAP_FAILED);
        };
        let (length, reopened) = self.vm.fs_lock().with(|| (file.length(), file.reopen()));
        let Ok(mapped) = reopened else {
            return Ok(MAP_FAILED);
        };
        match proc.space.mmap(self.vm, mapped, addr, length) {
            Ok(id) => Ok(id),
            Err(VmError::ProcessExited) => Err(VmError::ProcessExited),
            Err(e) => {
                log::debug!("{}: mmap(fd {}, {}) failed: {}", proc.space.name(), fd, addr, e);
                Ok(MAP_FAILED)
            }
        }
    }

    /// 拆除映射；标识符不存在时不做任何事
    pub fn munmap(&self, proc: &UserProcess, id: MapId) -> VmResult<()> {
        match proc.space.munmap(self.vm, id) {
            Ok(()) | Err(VmError::BadMapId) => Ok(()),
            Err(VmError::ProcessExited) => Err(VmError::ProcessExited),
            // 写回失败已记录，映射已被拆除
            Err(_) => Ok(()),
        }
    }

    /// 进程主动退出
    pub fn exit(&self, proc: &UserProcess, status: i32) {
        proc.exit(self.vm, status);
    }
}
