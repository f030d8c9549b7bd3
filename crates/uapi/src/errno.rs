//! 错误码
//!
//! 数值与 Linux 保持一致，内核内部以负数形式传递。

/// 没有该进程
pub const ESRCH: i32 = 3;
/// I/O 错误
pub const EIO: i32 = 5;
/// 错误的文件描述符
pub const EBADF: i32 = 9;
/// 内存不足
pub const ENOMEM: i32 = 12;
/// 错误的地址
pub const EFAULT: i32 = 14;
/// 已存在
pub const EEXIST: i32 = 17;
/// 无效参数
pub const EINVAL: i32 = 22;
/// 设备上没有空间
pub const ENOSPC: i32 = 28;
