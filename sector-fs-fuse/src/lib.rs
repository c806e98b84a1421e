
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use block_dev::{BlockDevice, SECTOR_SIZE};

/// 以宿主机上的镜像文件充当块设备
#[derive(Debug)]
pub struct BlockFile {
    inner: Mutex<File>,
    sector_count: u32,
}

impl BlockFile {
    /// 扇区数取自文件长度，不足一个扇区的尾部被忽略
    pub fn new(fd: File) -> io::Result<Self> {
        let sectors = fd.metadata()?.len() / SECTOR_SIZE as u64;
        let sector_count = u32::try_from(sectors)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "image too large"))?;

        Ok(Self {
            inner: Mutex::new(fd),
            sector_count,
        })
    }
}

impl BlockDevice for BlockFile {
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let mut file = self.inner.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .expect("seeking error");
        assert_eq!(file.read(buf).unwrap(), SECTOR_SIZE, "not a complete sector!");
    }

    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let mut file = self.inner.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .expect("seeking error");
        assert_eq!(
            file.write(buf).unwrap(),
            SECTOR_SIZE,
            "not a complete sector!"
        );
    }

    #[inline]
    fn sector_count(&self) -> u32 {
        self.sector_count
    }
}
