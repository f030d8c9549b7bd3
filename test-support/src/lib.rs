//! 测试支持 crate
//!
//! 提供宿主机上运行测试所需的 Mock 实现。
//! 本 crate 只作为 dev-dependency 使用，因此直接依赖 std。

pub mod mock;
