//! # 块设备接口层
//!
//! 块设备以**扇区**为单位存储数据；
//! [`BlockDevice`] 是对读写块设备的抽象，实现了此特质的类型称为**块设备驱动**。
//!
//! 读写都是同步的，驱动内部的错误对上层而言是致命的：驱动直接 panic，不返回错误。

#![no_std]

extern crate alloc;

mod ram_disk;

use core::any::Any;

pub use self::ram_disk::RamDisk;

/// 扇区大小（字节）
pub const SECTOR_SIZE: usize = 512;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);
    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);
    /// 设备的扇区总数
    fn sector_count(&self) -> u32;
}
