//! 内存盘：把一段堆内存当作块设备，并统计设备读写次数。

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::{BlockDevice, SECTOR_SIZE};

type Sector = [u8; SECTOR_SIZE];

#[derive(Debug)]
pub struct RamDisk {
    sectors: Mutex<Vec<Sector>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(sector_count: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sector_count as usize]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 设备读次数
    #[inline]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 设备写次数
    #[inline]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过缓存直接查看扇区内容，不计入读次数
    pub fn peek(&self, sector: u32) -> Sector {
        self.sectors.lock()[sector as usize]
    }

    /// 绕过缓存直接改写扇区内容，不计入写次数
    pub fn poke(&self, sector: u32, data: &Sector) {
        self.sectors.lock()[sector as usize] = *data;
    }
}

impl BlockDevice for RamDisk {
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock();
        let src = sectors
            .get(sector as usize)
            .unwrap_or_else(|| panic!("read beyond the ram disk: sector {sector}"));
        buf.copy_from_slice(src);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock();
        let dest = sectors
            .get_mut(sector as usize)
            .unwrap_or_else(|| panic!("write beyond the ram disk: sector {sector}"));
        dest.copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn sector_count(&self) -> u32 {
        self.sectors.lock().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_device_io() {
        let disk = RamDisk::new(4);
        let mut buf = [0; SECTOR_SIZE];

        disk.write_sector(2, &[7; SECTOR_SIZE]);
        disk.read_sector(2, &mut buf);

        assert_eq!(buf, [7; SECTOR_SIZE]);
        assert_eq!(disk.peek(2), [7; SECTOR_SIZE]);
        assert_eq!((disk.reads(), disk.writes()), (1, 1));
    }

    #[test]
    #[should_panic]
    fn out_of_range_is_fatal() {
        let disk = RamDisk::new(1);
        disk.read_sector(1, &mut [0; SECTOR_SIZE]);
    }
}
