//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟固定数量的帧，
//! 把即将操作的扇区复制到帧中，提高对块设备的操作效率。
//!
//! 上层对块设备的所有操作都经过块缓存层，且**操作扇区时一定在帧当中**。
//!
//! ## 锁的纪律
//!
//! - 目录锁只保护元数据（扇区到帧的映射、LRU 顺序、计数器），从不跨越设备 I/O；
//! - 帧锁串行化同一扇区上的操作，持有帧锁者必先**钉住**该帧；
//! - 被钉住的帧不会被选为逐出对象，也不会在持有目录锁时被加锁，
//!   因此“目录锁 → 帧锁”只发生在未钉住的空闲帧上，不会死锁。

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use block_dev::BlockDevice;
use derive_more::Sub;
use spin::Mutex;

use crate::{CACHE_CAPACITY, DataBlock, SECTOR_SIZE, SectorId};

/// 扇区缓存，帧数固定
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    frames: Box<[Frame]>,
    directory: Mutex<Directory>,
    device_reads: AtomicU64,
    device_writes: AtomicU64,
}

/// 命中率统计，两次采样相减即得区间内的增量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Sub)]
pub struct CacheStats {
    /// `read`/`write` 调用次数
    pub accesses: u64,
    pub hits: u64,
    pub device_reads: u64,
    pub device_writes: u64,
}

impl CacheStats {
    /// 命中次数占访问次数的比例，尚无访问时为 0
    pub fn hit_rate(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        self.hits as f64 / self.accesses as f64
    }
}

struct Frame {
    pins: AtomicU32,
    inner: Mutex<FrameInner>,
}

/// 帧的内容
struct FrameInner {
    /// 对应的扇区
    sector: Option<SectorId>,
    /// 缓存的数据
    data: DataBlock,
    /// 是否为脏块
    dirty: bool,
    valid: bool,
}

struct Directory {
    map: BTreeMap<SectorId, usize>,
    /// 已映射帧的访问顺序，队尾为最近使用
    lru: VecDeque<usize>,
    /// 从未使用或已被丢弃的帧
    free: Vec<usize>,
    /// 刚被逐出、脏数据尚未写回的扇区
    evicting: BTreeMap<SectorId, usize>,
    accesses: u64,
    hits: u64,
}

/// 未命中时如何填充新帧
#[derive(Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// 从设备读入
    ReadThrough,
    /// 调用者会覆盖整个扇区
    Overwrite,
}

/// 钉住一帧，离开作用域时解除
struct PinGuard<'a>(&'a AtomicU32);

impl BufferCache {
    #[inline]
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self::with_capacity(device, CACHE_CAPACITY)
    }

    /// 帧数不宜过大：命中时调整 LRU 顺序是线性扫描
    pub fn with_capacity(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0, "block cache without frames");

        Self {
            device,
            frames: (0..capacity).map(|_| Frame::new()).collect(),
            directory: Mutex::new(Directory {
                map: BTreeMap::new(),
                lru: VecDeque::with_capacity(capacity),
                free: (0..capacity).rev().collect(),
                evicting: BTreeMap::new(),
                accesses: 0,
                hits: 0,
            }),
            device_reads: AtomicU64::new(0),
            device_writes: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// 读出整个扇区，未命中时从设备读入
    pub fn read(&self, sector: SectorId, buf: &mut DataBlock) {
        self.access(sector, Fill::ReadThrough, |frame| buf.copy_from_slice(&frame.data));
    }

    /// 覆盖整个扇区并标记为脏，不会同步写设备
    pub fn write(&self, sector: SectorId, buf: &DataBlock) {
        self.access(sector, Fill::Overwrite, |frame| {
            frame.data.copy_from_slice(buf);
            frame.dirty = true;
        });
    }

    #[inline]
    pub fn zeroize(&self, sector: SectorId) {
        self.write(sector, &[0; SECTOR_SIZE]);
    }

    /// 在帧上就地读取
    pub fn map<V>(&self, sector: SectorId, f: impl FnOnce(&DataBlock) -> V) -> V {
        self.access(sector, Fill::ReadThrough, |frame| f(&frame.data))
    }

    /// 在帧上就地修改（读-改-写），完成后标记为脏
    pub fn map_mut<V>(&self, sector: SectorId, f: impl FnOnce(&mut DataBlock) -> V) -> V {
        self.access(sector, Fill::ReadThrough, |frame| {
            frame.dirty = true;
            f(&mut frame.data)
        })
    }

    /// 写回所有脏帧
    ///
    /// 每次只钉住一帧，其余帧照常可被逐出
    pub fn flush(&self) {
        for index in self.mapped() {
            let Some(_pin) = self.pin_if_mapped(index) else {
                continue;
            };
            let mut frame = self.frames[index].inner.lock();
            if frame.dirty {
                self.write_back(&mut frame);
            }
        }
    }

    /// 写回后丢弃所有映射并清零计数器，之后每个扇区的首次访问都是未命中
    pub fn reset(&self) {
        self.flush();

        let mut dir = self.directory.lock();
        let dir = &mut *dir;
        for index in mem::take(&mut dir.lru) {
            let frame = &self.frames[index];
            if frame.is_pinned() {
                dir.lru.push_back(index);
                continue;
            }

            // 未钉住的帧没有其它持锁者
            let mut inner = frame.inner.lock();
            if inner.dirty {
                // flush 之后又被写过，留待下次写回
                dir.lru.push_back(index);
                continue;
            }
            if let Some(sector) = inner.sector.take() {
                dir.map.remove(&sector);
            }
            inner.valid = false;
            dir.free.push(index);
        }
        dir.accesses = 0;
        dir.hits = 0;
        self.device_reads.store(0, Ordering::Relaxed);
        self.device_writes.store(0, Ordering::Relaxed);
        log::debug!("block cache reset, {} frames still mapped", dir.lru.len());
    }

    pub fn stats(&self) -> CacheStats {
        let dir = self.directory.lock();
        CacheStats {
            accesses: dir.accesses,
            hits: dir.hits,
            device_reads: self.device_reads.load(Ordering::Relaxed),
            device_writes: self.device_writes.load(Ordering::Relaxed),
        }
    }

    /// 扇区是否在缓存中，不计入访问次数
    pub fn is_cached(&self, sector: SectorId) -> bool {
        self.directory.lock().map.contains_key(&sector)
    }

    pub fn dirty_count(&self) -> usize {
        self.mapped()
            .into_iter()
            .filter(|&index| {
                self.pin_if_mapped(index)
                    .is_some_and(|_pin| self.frames[index].inner.lock().dirty)
            })
            .count()
    }
}

impl BufferCache {
    /// 块缓存调度策略：优先使用空闲帧，否则逐出最久未使用且未被钉住的帧
    fn access<V>(&self, sector: SectorId, fill: Fill, f: impl FnOnce(&mut FrameInner) -> V) -> V {
        loop {
            let mut dir = self.directory.lock();

            // 命中
            if let Some(&index) = dir.map.get(&sector) {
                dir.accesses += 1;
                dir.hits += 1;
                dir.touch(index);
                let frame = &self.frames[index];
                let _pin = frame.pin();
                drop(dir);

                let mut inner = frame.inner.lock();
                debug_assert!(inner.valid && inner.sector == Some(sector));
                return f(&mut inner);
            }

            // 该扇区刚被逐出且正在写回，等写回者放开帧锁后重试
            if let Some(&index) = dir.evicting.get(&sector) {
                drop(dir);
                drop(self.frames[index].inner.lock());
                continue;
            }

            dir.accesses += 1;
            let index = dir.claim(&self.frames);
            let frame = &self.frames[index];
            let _pin = frame.pin();
            let mut inner = frame.inner.lock();

            let write_back = match inner.sector.replace(sector) {
                Some(old) => {
                    dir.map.remove(&old);
                    log::trace!("evict sector {old} from frame {index}");
                    if inner.dirty {
                        dir.evicting.insert(old, index);
                        Some(old)
                    } else {
                        None
                    }
                }
                None => None,
            };
            inner.valid = false;
            dir.map.insert(sector, index);
            dir.lru.push_back(index);
            drop(dir);

            if let Some(old) = write_back {
                self.device.write_sector(old.raw(), &inner.data);
                self.device_writes.fetch_add(1, Ordering::Relaxed);
                inner.dirty = false;
                self.directory.lock().evicting.remove(&old);
            }

            if fill == Fill::ReadThrough {
                self.device.read_sector(sector.raw(), &mut inner.data);
                self.device_reads.fetch_add(1, Ordering::Relaxed);
            }
            log::trace!("load sector {sector} into frame {index}");
            inner.dirty = false;
            inner.valid = true;

            return f(&mut inner);
        }
    }

    fn write_back(&self, frame: &mut FrameInner) {
        if let Some(sector) = frame.sector {
            log::trace!("write back sector {sector}");
            self.device.write_sector(sector.raw(), &frame.data);
            self.device_writes.fetch_add(1, Ordering::Relaxed);
        }
        frame.dirty = false;
    }

    /// 当前已映射的帧
    fn mapped(&self) -> Vec<usize> {
        self.directory.lock().lru.iter().copied().collect()
    }

    /// 帧仍在映射中时钉住它；期间可能已被丢弃
    fn pin_if_mapped(&self, index: usize) -> Option<PinGuard<'_>> {
        let dir = self.directory.lock();
        dir.lru
            .contains(&index)
            .then(|| self.frames[index].pin())
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.flush();
    }
}

impl Directory {
    /// 取得一个可用帧，并将其移出 LRU 队列
    fn claim(&mut self, frames: &[Frame]) -> usize {
        if let Some(index) = self.free.pop() {
            return index;
        }

        let pos = self
            .lru
            .iter()
            .position(|&index| !frames[index].is_pinned())
            .expect("run out of block cache");
        let index = self.lru[pos];
        self.lru.remove(pos);
        index
    }

    /// 移至队尾（最近使用）
    ///
    /// 线性扫描 LRU 队列，帧数在几十到几百时开销可以忽略
    fn touch(&mut self, index: usize) {
        if let Some(pos) = self.lru.iter().position(|&i| i == index) {
            self.lru.remove(pos);
        }
        self.lru.push_back(index);
    }
}

impl Frame {
    fn new() -> Self {
        Self {
            pins: AtomicU32::new(0),
            inner: Mutex::new(FrameInner {
                sector: None,
                data: [0; SECTOR_SIZE],
                dirty: false,
                valid: false,
            }),
        }
    }

    /// 只能在持有目录锁时调用
    #[inline]
    fn pin(&self) -> PinGuard<'_> {
        self.pins.fetch_add(1, Ordering::AcqRel);
        PinGuard(&self.pins)
    }

    #[inline]
    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
