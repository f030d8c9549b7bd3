//! 文件描述符约定

/// 标准输入（键盘）
pub const STDIN_FILENO: i32 = 0;
/// 标准输出（控制台）
pub const STDOUT_FILENO: i32 = 1;
/// 第一个可分配给打开文件的描述符
pub const FIRST_FILE_FD: i32 = 2;
