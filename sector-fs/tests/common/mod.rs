#![allow(dead_code)]

use std::sync::Arc;

use block_dev::RamDisk;
use sector_fs::{
    BufferCache, CACHE_CAPACITY, FREE_MAP_SECTOR, FreeMap, InodeManager, ROOT_DIR_SECTOR,
    SECTOR_SIZE, SectorId,
};

pub fn disk_and_cache(sector_count: u32, capacity: usize) -> (Arc<RamDisk>, BufferCache) {
    let disk = Arc::new(RamDisk::new(sector_count));
    let cache = BufferCache::with_capacity(disk.clone(), capacity);
    (disk, cache)
}

/// 保留 0、1 号扇区的块索引环境
pub fn inodes(sector_count: u32) -> (Arc<RamDisk>, InodeManager) {
    let disk = Arc::new(RamDisk::new(sector_count));
    let cache = Arc::new(BufferCache::with_capacity(disk.clone(), CACHE_CAPACITY));
    let free_map = Arc::new(FreeMap::new(sector_count));
    free_map.mark(FREE_MAP_SECTOR);
    free_map.mark(ROOT_DIR_SECTOR);
    (disk, InodeManager::new(cache, free_map))
}

pub fn sector(raw: u32) -> SectorId {
    SectorId::new(raw)
}

pub fn filled(byte: u8) -> [u8; SECTOR_SIZE] {
    [byte; SECTOR_SIZE]
}

/// 索引块中某个槽位的扇区号
pub fn slot(inodes: &InodeManager, block: SectorId, index: usize) -> SectorId {
    inodes.cache().map(block, |data| {
        let mut raw = [0; 4];
        raw.copy_from_slice(&data[index * 4..index * 4 + 4]);
        SectorId::new(u32::from_le_bytes(raw))
    })
}
