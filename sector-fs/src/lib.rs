#![no_std]

extern crate alloc;

/* sector-fs 的整体架构，自上而下 */

// 文件系统层：格式化、挂载与关闭
mod fs;

// 块索引层：文件的创建、打开、读写、扩展与回收
mod inode;

// 空闲扇区位图
mod free_map;

// 磁盘数据结构层：索引节点与间接索引块的编解码
mod layout;

// 块缓存层：内存上的扇区数据缓存
mod block_cache;

mod error;

pub use block_dev::{BlockDevice, SECTOR_SIZE};

pub use self::{
    block_cache::{BufferCache, CacheStats},
    error::Error,
    free_map::FreeMap,
    fs::FileSystem,
    inode::{Inode, InodeManager},
    layout::{DiskInode, SectorId},
};

/// 块缓存的帧数
pub const CACHE_CAPACITY: usize = 64;
/// 索引节点魔数
pub const INODE_MAGIC: u32 = 0x494e4f44;
/// 空闲位图文件的索引节点所在扇区
pub const FREE_MAP_SECTOR: SectorId = SectorId::new(0);
/// 根目录的索引节点所在扇区
pub const ROOT_DIR_SECTOR: SectorId = SectorId::new(1);

/// 直接索引的个数
pub const DIRECT_COUNT: usize = 12;
/// 间接索引块的编号容量
pub const INDIRECT_COUNT: usize = SECTOR_SIZE / 4;
/// 单个文件最多占用的数据扇区数
pub const MAX_FILE_SECTORS: usize = DIRECT_COUNT + INDIRECT_COUNT + INDIRECT_COUNT * INDIRECT_COUNT;
/// 单个文件的最大长度（字节）
pub const MAX_FILE_SIZE: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

type DataBlock = [u8; SECTOR_SIZE];
