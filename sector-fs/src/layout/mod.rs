//! # 磁盘数据结构层
//!
//! 磁盘布局：
//! 空闲位图文件的索引节点(0) | 根目录索引节点(1) | 其余扇区按需分配
//!
//! 所有结构都按固定的字节偏移显式编解码（小端序），与宿主的结构体布局无关。

mod inode;
mod sector;

pub use self::{
    inode::{BlockPos, DiskInode, pointer, pointers, set_pointer},
    sector::SectorId,
};
