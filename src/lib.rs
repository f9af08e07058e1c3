//! Strata - a disk-oriented storage and buffering engine in Rust
//!
//! This crate provides the storage substrate of a relational database: a
//! fixed-size in-memory page cache over a page-addressable disk, and an
//! extendible hash index persisted through that cache.
//!
//! # Architecture
//!
//! The system is organized into several layers:
//!
//! - **Storage Layer** (`storage`): Disk I/O and on-disk page formats
//!   - `DiskManager`: Reads and writes pages to/from disk
//!   - `DiskScheduler`: Serializes page I/O on a background worker
//!   - `HashHeaderPage`/`HashDirectoryPage`/`HashBucketPage`: Typed views
//!     over raw page buffers for the hash index
//!
//! - **Buffer Pool** (`buffer`): Memory management for database pages
//!   - `BufferPoolManager`: Fetches pages from disk and caches them in memory
//!   - `LruKReplacer`: LRU-K page replacement policy
//!   - `FrameHeader`: Per-frame metadata and data storage
//!   - `BasicPageGuard`/`ReadPageGuard`/`WritePageGuard`: RAII guards that
//!     pin (and optionally latch) a page for scoped access
//!
//! - **Index** (`index`): The on-disk extendible hash table
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata::buffer::BufferPoolManager;
//! use strata::index::{BytewiseComparator, DefaultHashFunction, ExtendibleHashTable};
//! use strata::storage::disk::DiskManager;
//!
//! // Create a disk manager for a database file
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//!
//! // Create a buffer pool with 100 frames and LRU-2 replacement
//! let bpm = Arc::new(BufferPoolManager::new(100, 2, disk_manager));
//!
//! // Build a hash index over 8-byte keys and 4-byte values
//! let table = ExtendibleHashTable::new(
//!     bpm,
//!     8,
//!     4,
//!     Box::new(DefaultHashFunction),
//!     Box::new(BytewiseComparator),
//!     2,
//!     9,
//!     100,
//! )
//! .unwrap();
//!
//! table.insert(b"key-0001", &42u32.to_le_bytes()).unwrap();
//! assert_eq!(table.get_value(b"key-0001").unwrap().len(), 1);
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{FrameId, PageId, Result, StrataError};
