//! 索引节点与间接索引块
//!
//! - 索引节点恰好占一个扇区：12 个直接索引、一个一级索引、一个二级索引
//! - 一级索引块：整个扇区连续存储 128 个**扇区号**，每个编号都指向一个**数据块**
//! - 二级索引块：整个扇区连续存储 128 个**扇区号**，每个编号都指向一个一级索引块
//!
//! 文件长度决定了哪些索引有意义：前 `ceil(length / 512)` 个数据块
//! 依 直接 → 一级 → 二级 的顺序排布。

use crate::{DIRECT_COUNT, DataBlock, INDIRECT_COUNT, INODE_MAGIC, SECTOR_SIZE};

use super::SectorId;

/// 用上一级索引时的编号容量
const INDIRECT1_CAP: usize = DIRECT_COUNT + INDIRECT_COUNT;

/* 索引节点在扇区内的字段偏移 */
const DIRECT_OFFSET: usize = 0;
const INDIRECT_OFFSET: usize = DIRECT_OFFSET + DIRECT_COUNT * 4;
const DOUBLY_INDIRECT_OFFSET: usize = INDIRECT_OFFSET + 4;
const IS_DIR_OFFSET: usize = DOUBLY_INDIRECT_OFFSET + 4;
const LENGTH_OFFSET: usize = IS_DIR_OFFSET + 1;
const MAGIC_OFFSET: usize = LENGTH_OFFSET + 4;
const _: () = assert!(MAGIC_OFFSET + 4 <= SECTOR_SIZE);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInode {
    pub direct: [SectorId; DIRECT_COUNT],
    /// 指向一个一级索引块
    pub indirect: SectorId,
    /// 指向一个二级索引块
    pub doubly_indirect: SectorId,
    pub is_dir: bool,
    /// 文件长度（字节）
    pub length: u32,
    magic: u32,
}

/// 数据块的逻辑索引在索引结构中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPos {
    Direct(usize),
    /// 一级索引块内的槽位
    Indirect(usize),
    /// 二级索引块内的槽位，以及该槽位所指一级索引块内的槽位
    DoublyIndirect(usize, usize),
}

impl BlockPos {
    /// 逻辑索引超出最大文件时返回空
    pub fn of(block_index: usize) -> Option<Self> {
        if block_index < DIRECT_COUNT {
            Some(Self::Direct(block_index))
        } else if block_index < INDIRECT1_CAP {
            // 剔去直接索引的部分
            Some(Self::Indirect(block_index - DIRECT_COUNT))
        } else {
            // 剔去使用了一级索引的部分
            let index = block_index - INDIRECT1_CAP;
            let outer = index / INDIRECT_COUNT;
            (outer < INDIRECT_COUNT).then_some(Self::DoublyIndirect(outer, index % INDIRECT_COUNT))
        }
    }
}

impl DiskInode {
    #[inline]
    pub fn new(is_dir: bool) -> Self {
        Self {
            direct: [SectorId::default(); DIRECT_COUNT],
            indirect: SectorId::default(),
            doubly_indirect: SectorId::default(),
            is_dir,
            length: 0,
            magic: INODE_MAGIC,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    pub fn decode(block: &DataBlock) -> Self {
        let mut direct = [SectorId::default(); DIRECT_COUNT];
        for (slot, sector) in direct.iter_mut().enumerate() {
            *sector = read_u32(block, DIRECT_OFFSET + slot * 4).into();
        }

        Self {
            direct,
            indirect: read_u32(block, INDIRECT_OFFSET).into(),
            doubly_indirect: read_u32(block, DOUBLY_INDIRECT_OFFSET).into(),
            is_dir: block[IS_DIR_OFFSET] != 0,
            length: read_u32(block, LENGTH_OFFSET),
            magic: read_u32(block, MAGIC_OFFSET),
        }
    }

    /// 编码至整个扇区，保留字节清零
    pub fn encode(&self, block: &mut DataBlock) {
        block.fill(0);
        for (slot, sector) in self.direct.iter().enumerate() {
            write_u32(block, DIRECT_OFFSET + slot * 4, sector.raw());
        }
        write_u32(block, INDIRECT_OFFSET, self.indirect.raw());
        write_u32(block, DOUBLY_INDIRECT_OFFSET, self.doubly_indirect.raw());
        block[IS_DIR_OFFSET] = self.is_dir as u8;
        write_u32(block, LENGTH_OFFSET, self.length);
        write_u32(block, MAGIC_OFFSET, self.magic);
    }

    /// 计算容纳指定数据量需要多少个**数据块**
    #[inline]
    pub fn count_data_blocks(length: usize) -> usize {
        length.div_ceil(SECTOR_SIZE)
    }

    /// 计算容纳指定数据量需要多少个 **数据块** 和 **索引块**，不含索引节点本身
    pub fn count_total_blocks(length: usize) -> usize {
        let data_blocks = Self::count_data_blocks(length);
        let mut total = data_blocks;

        // 超出直接索引，使用一级索引块
        if data_blocks > DIRECT_COUNT {
            total += 1;
        }

        // 超出一级索引，使用二级索引块及其下的一级索引块
        if data_blocks > INDIRECT1_CAP {
            total += 1 + (data_blocks - INDIRECT1_CAP).div_ceil(INDIRECT_COUNT);
        }

        total
    }
}

/// 读取索引块中的某个槽位
#[inline]
pub fn pointer(block: &DataBlock, slot: usize) -> SectorId {
    read_u32(block, slot * 4).into()
}

#[inline]
pub fn set_pointer(block: &mut DataBlock, slot: usize, sector: SectorId) {
    block[slot * 4..slot * 4 + 4].copy_from_slice(&sector.to_le_bytes());
}

/// 解出索引块中的全部槽位
pub fn pointers(block: &DataBlock) -> [SectorId; INDIRECT_COUNT] {
    let mut pointers = [SectorId::default(); INDIRECT_COUNT];
    for (sector, bytes) in pointers.iter_mut().zip(block.chunks_exact(4)) {
        *sector = SectorId::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    pointers
}

#[inline]
fn read_u32(block: &DataBlock, offset: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&block[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[inline]
fn write_u32(block: &mut DataBlock, offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_FILE_SECTORS;

    #[test]
    fn field_offsets() {
        let mut inode = DiskInode::new(true);
        inode.direct[0] = SectorId::new(0x0102_0304);
        inode.direct[11] = SectorId::new(11);
        inode.indirect = SectorId::new(12);
        inode.doubly_indirect = SectorId::new(13);
        inode.length = 6200;

        let mut block = [0xff; SECTOR_SIZE];
        inode.encode(&mut block);

        assert_eq!(&block[0..4], &[4, 3, 2, 1]);
        assert_eq!(&block[44..48], &11u32.to_le_bytes());
        assert_eq!(&block[48..52], &12u32.to_le_bytes());
        assert_eq!(&block[52..56], &13u32.to_le_bytes());
        assert_eq!(block[56], 1);
        assert_eq!(&block[57..61], &6200u32.to_le_bytes());
        assert_eq!(&block[61..65], &INODE_MAGIC.to_le_bytes());
        assert!(block[65..].iter().all(|&b| b == 0));

        assert_eq!(DiskInode::decode(&block), inode);
    }

    #[test]
    fn zeroed_sector_is_not_an_inode() {
        assert!(!DiskInode::decode(&[0; SECTOR_SIZE]).is_valid());
    }

    #[test]
    fn block_positions() {
        assert_eq!(BlockPos::of(0), Some(BlockPos::Direct(0)));
        assert_eq!(BlockPos::of(11), Some(BlockPos::Direct(11)));
        assert_eq!(BlockPos::of(12), Some(BlockPos::Indirect(0)));
        assert_eq!(BlockPos::of(139), Some(BlockPos::Indirect(127)));
        assert_eq!(BlockPos::of(140), Some(BlockPos::DoublyIndirect(0, 0)));
        assert_eq!(BlockPos::of(140 + 128 + 5), Some(BlockPos::DoublyIndirect(1, 5)));
        assert_eq!(
            BlockPos::of(MAX_FILE_SECTORS - 1),
            Some(BlockPos::DoublyIndirect(127, 127))
        );
        assert_eq!(BlockPos::of(MAX_FILE_SECTORS), None);
    }

    #[test]
    fn total_blocks() {
        assert_eq!(DiskInode::count_total_blocks(0), 0);
        assert_eq!(DiskInode::count_total_blocks(1), 1);
        assert_eq!(DiskInode::count_total_blocks(12 * 512), 12);
        // 12 个直接块 + 1 个一级索引块 + 1 个数据块
        assert_eq!(DiskInode::count_total_blocks(6200), 14);
        assert_eq!(DiskInode::count_total_blocks(140 * 512), 141);
        assert_eq!(DiskInode::count_total_blocks(141 * 512), 144);
        assert_eq!(DiskInode::count_total_blocks(269 * 512), 273);
    }

    #[test]
    fn pointer_slots() {
        let mut block = [0; SECTOR_SIZE];
        set_pointer(&mut block, 0, SectorId::new(9));
        set_pointer(&mut block, 127, SectorId::new(77));

        assert_eq!(pointer(&block, 0), SectorId::new(9));
        assert_eq!(pointer(&block, 127), SectorId::new(77));
        let all = pointers(&block);
        assert_eq!(all[0], SectorId::new(9));
        assert_eq!(all[127], SectorId::new(77));
        assert_eq!(all[1], SectorId::default());
    }
}
