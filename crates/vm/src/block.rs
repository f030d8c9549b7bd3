//! 交换区使用的块设备接口

/// 块设备
///
/// 与内核块驱动的接口保持一致：读写以块为单位，失败返回 `false`。
pub trait BlockDevice: Send + Sync {
    /// 读取一个块到 `buf`，`buf` 长度至少为一个块
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> bool;

    /// 将 `buf` 的前一个块写入设备
    fn write_block(&self, block_id: usize, buf: &[u8]) -> bool;

    /// 块大小（字节）
    fn block_size(&self) -> usize;

    /// 总块数
    fn total_blocks(&self) -> usize;
}
