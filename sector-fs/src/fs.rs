//! # 文件系统层
//!
//! 组装块缓存、空闲位图与索引节点管理器，负责格式化、挂载与关闭。

use alloc::sync::Arc;
use alloc::vec;

use block_dev::BlockDevice;

use crate::{
    BufferCache, Error, FREE_MAP_SECTOR, FreeMap, Inode, InodeManager, ROOT_DIR_SECTOR, SectorId,
};

pub struct FileSystem {
    inodes: InodeManager,
    /// 空闲位图文件，挂载期间一直打开
    free_map_file: Inode,
}

impl FileSystem {
    /// 格式化设备：保留 0、1 号扇区，创建空闲位图文件与空的根目录
    pub fn format(device: Arc<dyn BlockDevice>, cache_capacity: usize) -> Result<Self, Error> {
        let free_map = Arc::new(FreeMap::new(device.sector_count()));
        free_map.mark(FREE_MAP_SECTOR);
        free_map.mark(ROOT_DIR_SECTOR);

        let cache = Arc::new(BufferCache::with_capacity(device, cache_capacity));
        let inodes = InodeManager::new(cache, free_map.clone());
        inodes.create_at(FREE_MAP_SECTOR, free_map.byte_len(), false)?;
        inodes.create_at(ROOT_DIR_SECTOR, 0, true)?;

        let fs = Self {
            free_map_file: inodes.open(FREE_MAP_SECTOR),
            inodes,
        };
        fs.flush()?;

        log::info!(
            "format: {} sectors, {} free",
            free_map.capacity(),
            free_map.free_count()
        );
        Ok(fs)
    }

    /// 挂载已格式化的设备，从空闲位图文件中读回位图
    pub fn mount(device: Arc<dyn BlockDevice>, cache_capacity: usize) -> Self {
        let free_map = Arc::new(FreeMap::new(device.sector_count()));
        let cache = Arc::new(BufferCache::with_capacity(device, cache_capacity));
        let inodes = InodeManager::new(cache, free_map.clone());

        let free_map_file = inodes.open(FREE_MAP_SECTOR);
        let mut bytes = vec![0; free_map.byte_len()];
        let read_size = free_map_file.read_at(0, &mut bytes, &inodes);
        assert_eq!(read_size, bytes.len(), "free map file is truncated");
        free_map.load(&bytes);

        log::info!(
            "mount: {} sectors, {} free",
            free_map.capacity(),
            free_map.free_count()
        );
        Self {
            inodes,
            free_map_file,
        }
    }

    #[inline]
    pub fn inodes(&self) -> &InodeManager {
        &self.inodes
    }

    #[inline]
    pub fn cache(&self) -> &Arc<BufferCache> {
        self.inodes.cache()
    }

    #[inline]
    pub fn free_map(&self) -> &Arc<FreeMap> {
        self.inodes.free_map()
    }

    /// 创建新文件，返回其索引节点所在扇区
    #[inline]
    pub fn create_file(&self, length: usize, is_dir: bool) -> Result<SectorId, Error> {
        self.inodes.create(length, is_dir)
    }

    /// 持久化空闲位图，再写回所有脏帧
    pub fn flush(&self) -> Result<(), Error> {
        let bytes = self.free_map().to_bytes();
        // 位图文件在格式化时就已定长，这里不会扩展
        self.free_map_file.write_at(0, &bytes, &self.inodes)?;
        self.cache().flush();
        Ok(())
    }

    pub fn shutdown(self) -> Result<(), Error> {
        self.flush()?;
        let Self {
            inodes,
            free_map_file,
        } = self;
        inodes.close(free_map_file);

        let stats = inodes.cache().stats();
        log::info!(
            "shutdown: {} accesses, {} hits, {} device writes",
            stats.accesses,
            stats.hits,
            stats.device_writes
        );
        Ok(())
    }
}
