//! 进程退出状态

/// 因非法内存访问被内核终止的进程的退出状态
///
/// 硬件缺页路径与系统调用预检路径使用同一个值，用户程序无法借此区分两条路径。
pub const EXIT_MEMORY_VIOLATION: i32 = -1;

/// 因系统调用参数错误（如关闭无效描述符）被终止时的退出状态
pub const EXIT_BAD_ARGUMENT: i32 = -1;
