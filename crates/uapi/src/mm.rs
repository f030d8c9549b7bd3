//! 内存映射相关定义

/// 映射标识符
///
/// 由 `mmap` 返回，之后原样传给 `munmap`。同一进程内单调递增，不会复用。
pub type MapId = i32;

/// `mmap` 失败时的返回值
pub const MAP_FAILED: MapId = -1;
