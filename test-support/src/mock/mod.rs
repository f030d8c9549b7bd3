//! Mock 实现模块
//!
//! 提供架构、文件系统和块设备的 Mock 实现，用于测试

pub mod arch;
pub mod device;
pub mod fs;
