use std::sync::Arc;

use block_dev::RamDisk;
use sector_fs::{CACHE_CAPACITY, FREE_MAP_SECTOR, FileSystem, ROOT_DIR_SECTOR, SECTOR_SIZE};

fn format(sector_count: u32) -> (Arc<RamDisk>, FileSystem) {
    let disk = Arc::new(RamDisk::new(sector_count));
    let fs = FileSystem::format(disk.clone(), CACHE_CAPACITY).unwrap();
    (disk, fs)
}

#[test]
fn format_lays_out_metadata() {
    let (_, fs) = format(4096);
    let free_map = fs.free_map();
    assert!(free_map.is_allocated(FREE_MAP_SECTOR));
    assert!(free_map.is_allocated(ROOT_DIR_SECTOR));
    // 两个索引节点 + 位图文件的一个数据扇区
    assert_eq!(free_map.free_count(), 4096 - 3);

    let inodes = fs.inodes();
    let root = inodes.open(ROOT_DIR_SECTOR);
    assert!(root.is_dir(inodes));
    assert_eq!(root.length(inodes), 0);
    inodes.close(root);

    let bitmap = inodes.open(FREE_MAP_SECTOR);
    assert!(!bitmap.is_dir(inodes));
    assert_eq!(bitmap.length(inodes), 4096 / 8);
    inodes.close(bitmap);
}

#[test]
fn mount_restores_files_and_free_map() {
    let (disk, fs) = format(4096);
    let file = fs.create_file(0, false).unwrap();
    let inode = fs.inodes().open(file);
    assert_eq!(inode.write_at(1234, b"persistent", fs.inodes()), Ok(10));
    fs.inodes().close(inode);
    let free = fs.free_map().free_count();
    fs.shutdown().unwrap();

    let fs = FileSystem::mount(disk, CACHE_CAPACITY);
    assert_eq!(fs.free_map().free_count(), free);
    assert!(fs.free_map().is_allocated(file));

    let inodes = fs.inodes();
    let inode = inodes.open(file);
    assert_eq!(inode.length(inodes), 1244);
    let mut buf = [0; 10];
    assert_eq!(inode.read_at(1234, &mut buf, inodes), 10);
    assert_eq!(&buf, b"persistent");
    inodes.close(inode);

    // 挂载后分配不会与已有文件冲突
    let other = fs.create_file(SECTOR_SIZE, false).unwrap();
    assert_ne!(other, file);
}

#[test]
#[should_panic(expected = "corrupt inode")]
fn mount_unformatted_disk() {
    let disk = Arc::new(RamDisk::new(64));
    FileSystem::mount(disk, CACHE_CAPACITY);
}

#[test]
fn removed_file_is_gone_after_remount() {
    let (disk, fs) = format(1024);
    let free = fs.free_map().free_count();
    let file = fs.create_file(20 * SECTOR_SIZE, false).unwrap();

    let inode = fs.inodes().open(file);
    inode.remove();
    fs.inodes().close(inode);
    fs.shutdown().unwrap();

    let fs = FileSystem::mount(disk, CACHE_CAPACITY);
    assert_eq!(fs.free_map().free_count(), free);
}

#[test]
fn second_read_hits_more() {
    let (_, fs) = format(4096);
    let inodes = fs.inodes();
    let cache = fs.cache();

    let file = fs.create_file(0, false).unwrap();
    let inode = inodes.open(file);
    let data: Vec<u8> = (0..48 * SECTOR_SIZE).map(|i| (i % 253) as u8).collect();
    assert_eq!(inode.write_at(0, &data, inodes), Ok(data.len()));
    fs.flush().unwrap();
    cache.reset();

    let read_all = || {
        let mut buf = [0; SECTOR_SIZE];
        for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            assert_eq!(inode.read_at(i * SECTOR_SIZE, &mut buf, inodes), SECTOR_SIZE);
            assert_eq!(&buf[..], chunk);
        }
    };

    read_all();
    let cold = cache.stats();
    read_all();
    let warm = cache.stats();

    let warm = warm - cold;
    assert!(warm.hit_rate() > cold.hit_rate());
    assert_eq!(warm.hit_rate(), 1.0);
    assert_eq!(warm.device_reads, 0);
    inodes.close(inode);
}

#[test]
fn byte_writes_coalesce() {
    let (disk, fs) = format(4096);
    let inodes = fs.inodes();

    let file = fs.create_file(0, false).unwrap();
    let inode = inodes.open(file);
    fs.flush().unwrap();
    let (reads, writes) = (disk.reads(), disk.writes());

    for i in 0..64 * 1024 {
        assert_eq!(inode.write_at(i, &[i as u8], inodes), Ok(1));
    }
    fs.flush().unwrap();

    // 128 个数据扇区各写回一次，外加索引块、索引节点与位图
    let written = disk.writes() - writes;
    assert!((118..=138).contains(&written), "{written} device writes");
    assert!(disk.reads() - reads < 8);

    let mut buf = [0; 4];
    assert_eq!(inode.read_at(1000, &mut buf, inodes), 4);
    assert_eq!(buf, [232, 233, 234, 235]);
    inodes.close(inode);
}
