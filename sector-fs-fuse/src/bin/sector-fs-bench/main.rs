mod cli;

use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;

use block_dev::{BlockDevice, SECTOR_SIZE};
use clap::Parser;
use sector_fs::{CacheStats, FileSystem, Inode};
use sector_fs_fuse::BlockFile;

use self::cli::Cli;

fn main() -> io::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    println!("image={:?}", cli.image);

    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(cli.format)
        .truncate(cli.format)
        .open(&cli.image)?;
    if cli.format {
        fd.set_len(cli.sectors as u64 * SECTOR_SIZE as u64)?;
    }

    let block_dev: Arc<dyn BlockDevice> = Arc::new(BlockFile::new(fd)?);
    let fs = if cli.format {
        FileSystem::format(block_dev, cli.cache_capacity).map_err(io::Error::other)?
    } else {
        FileSystem::mount(block_dev, cli.cache_capacity)
    };

    hit_rate(&fs, cli.file_bytes)?;
    write_coalescing(&fs, cli.write_bytes)?;

    fs.shutdown().map_err(io::Error::other)
}

/// 同一文件先冷读、再热读，比较两遍的命中率
fn hit_rate(fs: &FileSystem, file_bytes: usize) -> io::Result<()> {
    let data: Vec<u8> = (0..file_bytes).map(|i| (i % 251) as u8).collect();

    with_scratch_file(fs, |inode| {
        inode
            .write_at(0, &data, fs.inodes())
            .map_err(io::Error::other)?;
        fs.flush().map_err(io::Error::other)?;
        fs.cache().reset();

        let cold = read_pass(fs, inode, &data)?;
        let warm = read_pass(fs, inode, &data)?;
        report("cold read", cold);
        report("warm read", warm);

        if warm.hit_rate() <= cold.hit_rate() {
            log::warn!(
                "warm read does not hit more often, {file_bytes} bytes may exceed {} frames",
                fs.cache().capacity()
            );
        }
        Ok(())
    })
}

/// 逐字节写入，统计刷盘后的设备写次数
fn write_coalescing(fs: &FileSystem, write_bytes: usize) -> io::Result<()> {
    with_scratch_file(fs, |inode| {
        fs.flush().map_err(io::Error::other)?;
        let before = fs.cache().stats();

        for offset in 0..write_bytes {
            inode
                .write_at(offset, &[offset as u8], fs.inodes())
                .map_err(io::Error::other)?;
        }
        fs.flush().map_err(io::Error::other)?;

        let stats = fs.cache().stats() - before;
        println!(
            "byte writes: {write_bytes} bytes in {} sectors, {} device writes, {} device reads",
            write_bytes.div_ceil(SECTOR_SIZE),
            stats.device_writes,
            stats.device_reads
        );
        Ok(())
    })
}

/// 逐扇区读完整个文件并校验内容，返回这一遍的缓存统计
fn read_pass(fs: &FileSystem, inode: &Inode, expected: &[u8]) -> io::Result<CacheStats> {
    let before = fs.cache().stats();
    let mut buf = [0; SECTOR_SIZE];

    for (i, chunk) in expected.chunks(SECTOR_SIZE).enumerate() {
        let read_size = inode.read_at(i * SECTOR_SIZE, &mut buf, fs.inodes());
        if buf[..read_size] != *chunk {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("sector {i} of the scratch file is corrupted"),
            ));
        }
    }

    Ok(fs.cache().stats() - before)
}

/// 在一个临时文件上运行 `f`，结束后删除该文件
fn with_scratch_file<T>(
    fs: &FileSystem,
    f: impl FnOnce(&Inode) -> io::Result<T>,
) -> io::Result<T> {
    let inodes = fs.inodes();
    let inode = inodes.open(fs.create_file(0, false).map_err(io::Error::other)?);

    let result = f(&inode);
    inode.remove();
    inodes.close(inode);

    result
}

fn report(label: &str, stats: CacheStats) {
    println!(
        "{label}: {} accesses, {} hits ({:.1}%), {} device reads",
        stats.accesses,
        stats.hits,
        stats.hit_rate() * 100.0,
        stats.device_reads
    );
}
