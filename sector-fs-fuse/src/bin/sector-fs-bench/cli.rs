use std::path::PathBuf;

use clap::Parser;
use sector_fs::CACHE_CAPACITY;

/// Measure the block cache of a sector-fs image
#[derive(Parser)]
pub struct Cli {
    /// Disk image
    #[arg(long, short)]
    pub image: PathBuf,

    /// Format the image instead of mounting it
    #[arg(long, short)]
    pub format: bool,

    /// Sectors of a newly formatted image
    #[arg(long, short, default_value_t = 16 * 2048)]
    pub sectors: u32,

    /// Frames of the block cache
    #[arg(long, short, default_value_t = CACHE_CAPACITY)]
    pub cache_capacity: usize,

    /// Bytes of the file read twice when measuring the hit rate
    #[arg(long, short = 'b', default_value_t = 24 * 1024)]
    pub file_bytes: usize,

    /// Bytes written one at a time when measuring write coalescing
    #[arg(long, short = 'w', default_value_t = 64 * 1024)]
    pub write_bytes: usize,
}
