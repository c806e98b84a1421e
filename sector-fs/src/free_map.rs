//! # 空闲扇区位图
//!
//! 每个扇区对应一位，置位表示已分配。
//! 所有分配与回收都由同一把锁串行化。
//!
//! 位图本身作为普通文件持久化，其索引节点位于 [`FREE_MAP_SECTOR`](crate::FREE_MAP_SECTOR)。

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::{Error, SectorId};

/// 位组的位数
const GROUP_BITS: usize = u64::BITS as usize;

#[derive(Debug)]
pub struct FreeMap {
    groups: Mutex<Vec<u64>>,
    /// 位图所指示的扇区总数
    sectors: usize,
}

impl FreeMap {
    pub fn new(sector_count: u32) -> Self {
        let sectors = sector_count as usize;
        let mut groups = vec![0; sectors.div_ceil(GROUP_BITS)];
        seal_tail(&mut groups, sectors);

        Self {
            groups: Mutex::new(groups),
            sectors,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.sectors
    }

    /// 标记保留扇区
    pub fn mark(&self, sector: SectorId) {
        let (group_index, ingroup_index) = locate(sector.raw() as usize);
        let mut groups = self.groups.lock();
        assert_eq!(
            groups[group_index] & (1 << ingroup_index),
            0,
            "sector {sector} is already in use"
        );
        groups[group_index] |= 1 << ingroup_index;
    }

    /// 分配 `count` 个连续扇区，返回首个扇区号
    pub fn allocate(&self, count: usize) -> Result<SectorId, Error> {
        debug_assert!(count > 0);
        let mut groups = self.groups.lock();

        let Some(first) = find_clear_run(&groups, self.sectors, count) else {
            log::warn!("free map exhausted, {count} sectors requested");
            return Err(Error::AllocationExhausted);
        };
        for bit in first..first + count {
            let (group_index, ingroup_index) = locate(bit);
            groups[group_index] |= 1 << ingroup_index;
        }

        Ok(SectorId::new(first as u32))
    }

    pub fn release(&self, sector: SectorId, count: usize) {
        let first = sector.raw() as usize;
        let mut groups = self.groups.lock();

        for bit in first..first + count {
            let (group_index, ingroup_index) = locate(bit);
            // 编号一定得有对应的位
            assert_ne!(
                groups[group_index] & (1 << ingroup_index),
                0,
                "release free sector {bit}"
            );
            groups[group_index] &= !(1 << ingroup_index);
        }
    }

    pub fn is_allocated(&self, sector: SectorId) -> bool {
        let (group_index, ingroup_index) = locate(sector.raw() as usize);
        self.groups.lock()[group_index] & (1 << ingroup_index) != 0
    }

    pub fn free_count(&self) -> usize {
        self.groups
            .lock()
            .iter()
            .map(|bits| bits.count_zeros() as usize)
            .sum()
    }

    /// 持久化后的字节数
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.sectors.div_ceil(8)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self
            .groups
            .lock()
            .iter()
            .flat_map(|bits| bits.to_le_bytes())
            .collect();
        bytes.truncate(self.byte_len());
        bytes
    }

    pub fn load(&self, bytes: &[u8]) {
        assert_eq!(bytes.len(), self.byte_len(), "free map size mismatch");

        let mut groups = self.groups.lock();
        for (bits, chunk) in groups.iter_mut().zip(bytes.chunks(GROUP_BITS / 8)) {
            let mut raw = [0; GROUP_BITS / 8];
            raw[..chunk.len()].copy_from_slice(chunk);
            *bits = u64::from_le_bytes(raw);
        }
        seal_tail(&mut groups, self.sectors);
    }
}

/// 位编号 → (位组索引, 组内索引)
#[inline]
fn locate(bit: usize) -> (usize, usize) {
    (bit / GROUP_BITS, bit % GROUP_BITS)
}

/// 把超出扇区总数的尾部位置位，使其永不被分配
fn seal_tail(groups: &mut [u64], sectors: usize) {
    let used = sectors % GROUP_BITS;
    if let (Some(last), true) = (groups.last_mut(), used != 0) {
        *last |= u64::MAX << used;
    }
}

/// 首次适配：寻找 `count` 个连续的空闲位
fn find_clear_run(groups: &[u64], sectors: usize, count: usize) -> Option<usize> {
    let mut run = 0;
    let mut bit = 0;

    while bit < sectors {
        let (group_index, ingroup_index) = locate(bit);
        let bits = groups[group_index];

        // 整组已满，直接跳过
        if ingroup_index == 0 && bits == u64::MAX {
            run = 0;
            bit += GROUP_BITS;
            continue;
        }

        if bits & (1 << ingroup_index) == 0 {
            run += 1;
            if run == count {
                return Some(bit + 1 - count);
            }
        } else {
            run = 0;
        }
        bit += 1;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_first_fit() {
        let map = FreeMap::new(200);
        map.mark(SectorId::new(0));
        map.mark(SectorId::new(1));

        assert_eq!(map.allocate(1), Ok(SectorId::new(2)));
        assert_eq!(map.allocate(3), Ok(SectorId::new(3)));
        map.release(SectorId::new(3), 1);
        assert_eq!(map.allocate(1), Ok(SectorId::new(3)));
        // 单个空洞放不下两个连续扇区
        map.release(SectorId::new(4), 1);
        assert_eq!(map.allocate(2), Ok(SectorId::new(6)));
        assert_eq!(map.free_count(), 200 - 8 + 1);
    }

    #[test]
    fn runs_cross_group_boundaries() {
        let map = FreeMap::new(256);
        for _ in 0..60 {
            map.allocate(1).unwrap();
        }
        assert_eq!(map.allocate(10), Ok(SectorId::new(60)));
    }

    #[test]
    fn exhaustion() {
        let map = FreeMap::new(70);
        assert_eq!(map.free_count(), 70);
        for raw in 0..70 {
            assert_eq!(map.allocate(1), Ok(SectorId::new(raw)));
        }
        assert_eq!(map.allocate(1), Err(Error::AllocationExhausted));
        assert_eq!(map.free_count(), 0);
    }

    #[test]
    #[should_panic(expected = "release free sector")]
    fn double_release() {
        let map = FreeMap::new(8);
        let sector = map.allocate(1).unwrap();
        map.release(sector, 1);
        map.release(sector, 1);
    }

    #[test]
    fn persists_as_bytes() {
        let map = FreeMap::new(100);
        map.mark(SectorId::new(0));
        map.mark(SectorId::new(65));
        map.mark(SectorId::new(99));

        let bytes = map.to_bytes();
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[0], 0b1);

        let loaded = FreeMap::new(100);
        loaded.load(&bytes);
        assert!(loaded.is_allocated(SectorId::new(65)));
        assert!(loaded.is_allocated(SectorId::new(99)));
        assert!(!loaded.is_allocated(SectorId::new(98)));
        assert_eq!(loaded.free_count(), 97);
    }
}
