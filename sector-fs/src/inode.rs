//! # 块索引层
//!
//! 把文件内的字节偏移映射到磁盘扇区：直接索引 → 一级索引 → 二级索引。
//!
//! 同一扇区上的索引节点同时只有一个打开实例，由 [`InodeManager`] 登记并计数；
//! 最后一个句柄关闭时，若文件已被删除，则按分配顺序归还它占用的全部扇区。
//!
//! 所有扇区（索引节点、索引块、数据块）都经过块缓存读写。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::layout::{self, BlockPos, DiskInode};
use crate::{BufferCache, DataBlock, Error, FreeMap, INDIRECT_COUNT, MAX_FILE_SIZE, SECTOR_SIZE, SectorId};

/// 索引节点管理器：打开登记表，以及块缓存与空闲位图的引用
pub struct InodeManager {
    cache: Arc<BufferCache>,
    free_map: Arc<FreeMap>,
    open_inodes: Mutex<BTreeMap<SectorId, Arc<OpenInode>>>,
}

/// 打开的索引节点的句柄
///
/// 句柄不可复制，须交还给 [`InodeManager::close`]；
/// 需要再持有一份时用 [`InodeManager::reopen`]。
///
/// 直接丢弃句柄不会减少打开计数：登记表中的条目一直留着，
/// 已删除文件的扇区也不会归还。这种泄漏会在丢弃时记一条警告。
#[derive(Debug)]
pub struct Inode {
    open: Arc<OpenInode>,
    closed: bool,
}

#[derive(Debug)]
struct OpenInode {
    /// 索引节点所在扇区，同时作为 inode 编号
    sector: SectorId,
    state: Mutex<InodeState>,
    /// 串行化同一文件的“扩展-写入”
    grow_lock: Mutex<()>,
}

#[derive(Debug, Default)]
struct InodeState {
    open_count: usize,
    deny_write_count: usize,
    removed: bool,
}

/// 本次操作新分配的扇区；未提交就离开作用域时按分配顺序全部归还
struct Reservation<'a> {
    free_map: &'a FreeMap,
    sectors: Vec<SectorId>,
}

impl InodeManager {
    pub fn new(cache: Arc<BufferCache>, free_map: Arc<FreeMap>) -> Self {
        Self {
            cache,
            free_map,
            open_inodes: Mutex::new(BTreeMap::new()),
        }
    }

    #[inline]
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[inline]
    pub fn free_map(&self) -> &Arc<FreeMap> {
        &self.free_map
    }

    /// 分配索引节点扇区并创建长度为 `length` 的文件，数据全为零
    pub fn create(&self, length: usize, is_dir: bool) -> Result<SectorId, Error> {
        let mut reservation = Reservation::new(&self.free_map);
        let sector = reservation.allocate()?;
        self.build(sector, length, is_dir, reservation)?;
        Ok(sector)
    }

    /// 在调用者已持有的扇区上创建文件
    pub fn create_at(&self, sector: SectorId, length: usize, is_dir: bool) -> Result<(), Error> {
        self.build(sector, length, is_dir, Reservation::new(&self.free_map))
    }

    pub fn open(&self, sector: SectorId) -> Inode {
        let mut open_inodes = self.open_inodes.lock();
        let inode = open_inodes
            .entry(sector)
            .or_insert_with(|| Arc::new(OpenInode::new(sector)))
            .clone();
        inode.state.lock().open_count += 1;

        Inode::new(inode)
    }

    pub fn reopen(&self, inode: &Inode) -> Inode {
        inode.open.state.lock().open_count += 1;
        Inode::new(inode.open.clone())
    }

    /// 最后一个句柄关闭时从登记表中移除；若已被删除，则归还全部扇区
    pub fn close(&self, mut inode: Inode) {
        inode.closed = true;
        let sector = inode.sector();
        let removed = {
            let mut open_inodes = self.open_inodes.lock();
            let mut state = inode.open.state.lock();
            state.open_count -= 1;
            if state.open_count > 0 {
                return;
            }
            open_inodes.remove(&sector);
            state.removed
        };

        if removed {
            self.release_all(sector);
        }
    }

    /// 当前打开的索引节点个数
    pub fn open_inodes(&self) -> usize {
        self.open_inodes.lock().len()
    }
}

impl InodeManager {
    fn build(
        &self,
        sector: SectorId,
        length: usize,
        is_dir: bool,
        mut reservation: Reservation,
    ) -> Result<(), Error> {
        let mut disk = DiskInode::new(is_dir);
        self.grow(&mut disk, length, &mut reservation)?;
        self.store(sector, &disk);

        let allocated = reservation.commit();
        log::debug!("create inode {sector}: {length} bytes, {allocated} sectors");
        Ok(())
    }

    /// 读出并校验索引节点
    fn load(&self, sector: SectorId) -> DiskInode {
        let disk = self.cache.map(sector, DiskInode::decode);
        assert!(disk.is_valid(), "corrupt inode at sector {sector}");
        assert!(
            disk.length as usize <= MAX_FILE_SIZE,
            "corrupt inode at sector {sector}: length {}",
            disk.length
        );
        disk
    }

    fn store(&self, sector: SectorId, disk: &DiskInode) {
        let mut block = [0; SECTOR_SIZE];
        disk.encode(&mut block);
        self.cache.write(sector, &block);
    }

    /// 分配一个扇区并清零
    fn allocate_zeroed(&self, reservation: &mut Reservation) -> Result<SectorId, Error> {
        let sector = reservation.allocate()?;
        self.cache.zeroize(sector);
        Ok(sector)
    }

    /// 把文件扩展到 `new_length` 字节。
    ///
    /// 新数据块依 直接 → 一级 → 二级 的顺序排布，索引块在其首个槽位被用到时才分配；
    /// 每个数据块都先清零再挂入索引。只修改 `disk`，写回由调用者负责。
    fn grow(
        &self,
        disk: &mut DiskInode,
        new_length: usize,
        reservation: &mut Reservation,
    ) -> Result<(), Error> {
        if new_length > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge);
        }

        let old_blocks = DiskInode::count_data_blocks(disk.length as usize);
        let new_blocks = DiskInode::count_data_blocks(new_length);

        for pos in (old_blocks..new_blocks).map_while(BlockPos::of) {
            match pos {
                BlockPos::Direct(slot) => {
                    disk.direct[slot] = self.allocate_zeroed(reservation)?;
                }
                BlockPos::Indirect(slot) => {
                    if slot == 0 {
                        disk.indirect = self.allocate_zeroed(reservation)?;
                    }
                    let data = self.allocate_zeroed(reservation)?;
                    self.cache
                        .map_mut(disk.indirect, |indirect| layout::set_pointer(indirect, slot, data));
                }
                BlockPos::DoublyIndirect(outer, inner) => {
                    if outer == 0 && inner == 0 {
                        disk.doubly_indirect = self.allocate_zeroed(reservation)?;
                    }
                    // 子块索引为0表示进入新的一级索引块
                    let indirect = if inner == 0 {
                        let indirect = self.allocate_zeroed(reservation)?;
                        self.cache.map_mut(disk.doubly_indirect, |doubly| {
                            layout::set_pointer(doubly, outer, indirect)
                        });
                        indirect
                    } else {
                        self.cache
                            .map(disk.doubly_indirect, |doubly| layout::pointer(doubly, outer))
                    };
                    let data = self.allocate_zeroed(reservation)?;
                    self.cache
                        .map_mut(indirect, |indirect| layout::set_pointer(indirect, inner, data));
                }
            }
        }

        disk.length = new_length as u32;
        Ok(())
    }

    /// 逻辑字节偏移 → 扇区号
    fn translate(&self, disk: &DiskInode, offset: usize) -> Result<SectorId, Error> {
        if offset >= disk.length as usize {
            return Err(Error::OutOfRange);
        }

        let sector = match BlockPos::of(offset / SECTOR_SIZE).ok_or(Error::OutOfRange)? {
            BlockPos::Direct(slot) => disk.direct[slot],
            BlockPos::Indirect(slot) => self
                .cache
                .map(disk.indirect, |indirect| layout::pointer(indirect, slot)),
            BlockPos::DoublyIndirect(outer, inner) => {
                let indirect = self
                    .cache
                    .map(disk.doubly_indirect, |doubly| layout::pointer(doubly, outer));
                self.cache
                    .map(indirect, |indirect| layout::pointer(indirect, inner))
            }
        };
        Ok(sector)
    }

    /// 按分配顺序遍历文件占用的数据块与索引块，不含索引节点本身
    fn for_each_owned(&self, disk: &DiskInode, mut f: impl FnMut(SectorId)) {
        let blocks = DiskInode::count_data_blocks(disk.length as usize);
        let mut indirect = [SectorId::default(); INDIRECT_COUNT];
        let mut doubly = [SectorId::default(); INDIRECT_COUNT];

        for pos in (0..blocks).map_while(BlockPos::of) {
            match pos {
                BlockPos::Direct(slot) => f(disk.direct[slot]),
                BlockPos::Indirect(slot) => {
                    if slot == 0 {
                        f(disk.indirect);
                        indirect = self.cache.map(disk.indirect, layout::pointers);
                    }
                    f(indirect[slot]);
                }
                BlockPos::DoublyIndirect(outer, inner) => {
                    if outer == 0 && inner == 0 {
                        f(disk.doubly_indirect);
                        doubly = self.cache.map(disk.doubly_indirect, layout::pointers);
                    }
                    if inner == 0 {
                        f(doubly[outer]);
                        indirect = self.cache.map(doubly[outer], layout::pointers);
                    }
                    f(indirect[inner]);
                }
            }
        }
    }

    fn release_all(&self, sector: SectorId) {
        let disk = self.load(sector);
        let mut released = 0;
        self.for_each_owned(&disk, |owned| {
            self.free_map.release(owned, 1);
            released += 1;
        });
        self.free_map.release(sector, 1);

        log::debug!("release inode {sector} and its {released} sectors");
    }

    fn write_sectors(&self, disk: &DiskInode, offset: usize, buf: &[u8]) -> usize {
        let end = offset + buf.len();
        let mut start = offset;
        let mut written_size = 0;

        while start < end {
            let Ok(sector) = self.translate(disk, start) else {
                break;
            };
            let sector_offset = start % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_offset).min(end - start);
            let src = &buf[written_size..written_size + chunk];

            match <&DataBlock>::try_from(src) {
                // 整扇区直接覆盖，未命中时无需读设备
                Ok(block) => self.cache.write(sector, block),
                Err(_) => self.cache.map_mut(sector, |data| {
                    data[sector_offset..sector_offset + chunk].copy_from_slice(src)
                }),
            }

            written_size += chunk;
            start += chunk;
        }

        written_size
    }
}

impl Inode {
    fn new(open: Arc<OpenInode>) -> Self {
        Self { open, closed: false }
    }

    #[inline]
    pub fn sector(&self) -> SectorId {
        self.open.sector
    }

    #[inline]
    pub fn open_count(&self) -> usize {
        self.open.state.lock().open_count
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.open.state.lock().removed
    }

    /// 标记删除，扇区在最后一个句柄关闭时才归还
    #[inline]
    pub fn remove(&self) {
        self.open.state.lock().removed = true;
    }

    /// 禁止写入（例如正在运行的可执行文件），每个打开者至多调用一次
    pub fn deny_write(&self) {
        let mut state = self.open.state.lock();
        state.deny_write_count += 1;
        assert!(state.deny_write_count <= state.open_count);
    }

    pub fn allow_write(&self) {
        let mut state = self.open.state.lock();
        assert!(state.deny_write_count > 0, "allow_write without deny_write");
        state.deny_write_count -= 1;
    }

    pub fn length(&self, inodes: &InodeManager) -> usize {
        inodes.load(self.sector()).length as usize
    }

    pub fn is_dir(&self, inodes: &InodeManager) -> bool {
        inodes.load(self.sector()).is_dir
    }

    /// 逻辑字节偏移所在的扇区；偏移不小于文件长度时返回 [`Error::OutOfRange`]
    pub fn byte_to_sector(&self, offset: usize, inodes: &InodeManager) -> Result<SectorId, Error> {
        inodes.translate(&inodes.load(self.sector()), offset)
    }

    /// 文件占用的全部扇区：按分配顺序的数据块与索引块，最后是索引节点本身
    pub fn owned_sectors(&self, inodes: &InodeManager) -> Vec<SectorId> {
        let disk = inodes.load(self.sector());
        let mut sectors = Vec::with_capacity(DiskInode::count_total_blocks(disk.length as usize) + 1);
        inodes.for_each_owned(&disk, |sector| sectors.push(sector));
        sectors.push(self.sector());
        sectors
    }

    /// 从指定位置(字节偏移)读出数据填充`buf`，返回实际读取的字节数
    pub fn read_at(&self, offset: usize, buf: &mut [u8], inodes: &InodeManager) -> usize {
        let disk = inodes.load(self.sector());
        let end = offset.saturating_add(buf.len()).min(disk.length as usize);

        let mut start = offset;
        let mut read_size = 0;
        let mut bounce = [0; SECTOR_SIZE];
        while start < end {
            let Ok(sector) = inodes.translate(&disk, start) else {
                break;
            };
            let sector_offset = start % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_offset).min(end - start);
            let dest = &mut buf[read_size..read_size + chunk];

            match <&mut DataBlock>::try_from(&mut *dest) {
                // 整扇区直接读入调用者的缓冲区
                Ok(block) => inodes.cache.read(sector, block),
                Err(_) => {
                    inodes.cache.read(sector, &mut bounce);
                    dest.copy_from_slice(&bounce[sector_offset..sector_offset + chunk]);
                }
            }

            read_size += chunk;
            start += chunk;
        }

        read_size
    }

    /// 写入 `buf`，必要时先扩展文件。
    ///
    /// 禁止写入期间返回 `Ok(0)`；扩展失败时文件保持原状。
    pub fn write_at(&self, offset: usize, buf: &[u8], inodes: &InodeManager) -> Result<usize, Error> {
        if self.open.state.lock().deny_write_count > 0 {
            log::debug!("write to inode {} denied", self.sector());
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let end = offset
            .checked_add(buf.len())
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or(Error::FileTooLarge)?;

        let disk = inodes.load(self.sector());
        if end <= disk.length as usize {
            return Ok(inodes.write_sectors(&disk, offset, buf));
        }

        let _growing = self.open.grow_lock.lock();
        // 等锁期间可能已被其它写者扩展
        let mut disk = inodes.load(self.sector());
        if end > disk.length as usize {
            let mut reservation = Reservation::new(&inodes.free_map);
            let old_length = disk.length;
            inodes.grow(&mut disk, end, &mut reservation)?;
            // 新扇区都已清零并挂入索引后，才写回新的长度
            inodes.store(self.sector(), &disk);
            let allocated = reservation.commit();
            log::debug!(
                "grow inode {} from {old_length} to {end} bytes, {allocated} new sectors",
                self.sector()
            );
        }

        Ok(inodes.write_sectors(&disk, offset, buf))
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        if !self.closed {
            log::warn!("inode {} dropped without close", self.open.sector);
        }
    }
}

impl OpenInode {
    fn new(sector: SectorId) -> Self {
        Self {
            sector,
            state: Mutex::new(InodeState::default()),
            grow_lock: Mutex::new(()),
        }
    }
}

impl<'a> Reservation<'a> {
    fn new(free_map: &'a FreeMap) -> Self {
        Self {
            free_map,
            sectors: Vec::new(),
        }
    }

    fn allocate(&mut self) -> Result<SectorId, Error> {
        let sector = self.free_map.allocate(1)?;
        self.sectors.push(sector);
        Ok(sector)
    }

    /// 保留本次分配，返回分配的扇区数
    fn commit(mut self) -> usize {
        let count = self.sectors.len();
        self.sectors.clear();
        count
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.sectors.is_empty() {
            return;
        }

        log::debug!("roll back {} newly allocated sectors", self.sectors.len());
        for &sector in &self.sectors {
            self.free_map.release(sector, 1);
        }
    }
}
