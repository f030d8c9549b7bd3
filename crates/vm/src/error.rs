//! 虚拟内存子系统的错误类型

use core::fmt;

use uapi::errno::{EBADF, EEXIST, EFAULT, EINVAL, EIO, ENOMEM, ENOSPC, ESRCH};

use crate::page_table::PagingError;

/// 虚拟内存操作的错误
///
/// 分为三类：
/// - 进程致命（[`VmError::is_memory_violation`]）：非法地址、写只读页、栈增长越界，
///   出错的进程被终止，内核继续运行；
/// - 资源耗尽（[`VmError::is_resource_exhaustion`]）：没有可驱逐的帧、交换区已满，
///   终止发起请求的进程；
/// - 其余为普通的调用失败，原样返回给调用者。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// 地址未在 SPT 中注册，且不属于栈增长
    InvalidAddress,
    /// 写入不可写的页
    WriteToReadOnly,
    /// 地址靠近栈指针，但低于栈区下界
    StackLimitExceeded,
    /// 目标地址已有 SPT 条目
    AlreadyMapped,
    /// 地址为空或未按页对齐
    MisalignedAddress,
    /// 映射长度为零
    EmptyFile,
    /// 映射标识符不存在
    BadMapId,
    /// 文件描述符不存在
    BadFd,
    /// 所有帧都被 pin，无法驱逐
    OutOfFrames,
    /// 交换区没有空闲槽位
    SwapFull,
    /// 块设备或文件 I/O 失败
    Io,
    /// 进程已经退出
    ProcessExited,
}

/// 虚拟内存操作的结果类型
pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    /// 是否为非法内存访问
    pub const fn is_memory_violation(self) -> bool {
        matches!(
            self,
            VmError::InvalidAddress | VmError::WriteToReadOnly | VmError::StackLimitExceeded
        )
    }

    /// 是否为资源耗尽
    pub const fn is_resource_exhaustion(self) -> bool {
        matches!(self, VmError::OutOfFrames | VmError::SwapFull)
    }

    /// 转换为负的 errno
    pub const fn to_errno(self) -> isize {
        let errno = match self {
            VmError::InvalidAddress | VmError::WriteToReadOnly | VmError::StackLimitExceeded => {
                EFAULT
            }
            VmError::AlreadyMapped => EEXIST,
            VmError::MisalignedAddress | VmError::EmptyFile | VmError::BadMapId => EINVAL,
            VmError::BadFd => EBADF,
            VmError::OutOfFrames => ENOMEM,
            VmError::SwapFull => ENOSPC,
            VmError::Io => EIO,
            VmError::ProcessExited => ESRCH,
        };
        -(errno as isize)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::InvalidAddress => "invalid user address",
            VmError::WriteToReadOnly => "write to read-only page",
            VmError::StackLimitExceeded => "stack growth beyond limit",
            VmError::AlreadyMapped => "page already mapped",
            VmError::MisalignedAddress => "null or misaligned address",
            VmError::EmptyFile => "zero-length mapping",
            VmError::BadMapId => "no such mapping",
            VmError::BadFd => "bad file descriptor",
            VmError::OutOfFrames => "no evictable frame",
            VmError::SwapFull => "swap area exhausted",
            VmError::Io => "I/O error",
            VmError::ProcessExited => "process has exited",
        };
        f.write_str(msg)
    }
}

impl From<PagingError> for VmError {
    fn from(e: PagingError) -> Self {
        match e {
            PagingError::AlreadyMapped => VmError::AlreadyMapped,
            PagingError::NotMapped => VmError::InvalidAddress,
        }
    }
}
