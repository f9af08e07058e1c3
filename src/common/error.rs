use thiserror::Error;

use super::types::{FrameId, PageId};

/// Database error types
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Frame {0} not found")]
    FrameNotFound(FrameId),

    #[error("Buffer pool is full, no evictable frames available")]
    BufferPoolFull,

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("Page {0} is still pinned")]
    PageStillPinned(PageId),

    #[error("Disk scheduler error: {0}")]
    DiskScheduler(String),

    #[error("Hash table directory is full")]
    DirectoryFull,

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Bucket entry does not fit in a page: {entry_size} bytes x {max_size} entries")]
    BucketOverflow { entry_size: usize, max_size: usize },
}

pub type Result<T> = std::result::Result<T, StrataError>;
