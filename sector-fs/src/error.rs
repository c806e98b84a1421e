use derive_more::Display;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// 空闲扇区耗尽
    #[display(fmt = "no free sector left")]
    AllocationExhausted,
    /// 偏移量不在文件范围内
    #[display(fmt = "offset beyond the end of file")]
    OutOfRange,
    /// 超出索引结构所能寻址的最大文件长度
    #[display(fmt = "file too large")]
    FileTooLarge,
}

impl core::error::Error for Error {}
