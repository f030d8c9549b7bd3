//! 与用户空间共用定义和声明
//!
//! 包含常量和类型声明，确保内核和用户程序对系统调用返回值的理解一致

#![no_std]

pub mod errno;
pub mod fcntl;
pub mod mm;
pub mod wait;
