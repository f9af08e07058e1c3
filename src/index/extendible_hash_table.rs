use std::sync::Arc;

use log::{debug, trace};

use crate::buffer::{BufferPoolManager, WritePageGuard};
use crate::common::{
    PageId, Result, StrataError, HASH_TABLE_DIRECTORY_MAX_DEPTH, HASH_TABLE_HEADER_MAX_DEPTH,
    INVALID_PAGE_ID,
};
use crate::storage::page::{
    hash_bucket_max_entries, HashBucketPage, HashBucketPageRef, HashDirectoryPage,
    HashDirectoryPageRef, HashHeaderPage, HashHeaderPageRef,
};

use super::{HashFunction, KeyComparator};

/// A disk-backed extendible hash table over fixed-width keys and values.
///
/// Three tiers of pages, all reached through buffer pool guards: a header
/// page indexed by the high `header_max_depth` bits of the hash selects a
/// directory; the directory indexed by the low `global_depth` bits selects a
/// bucket; buckets are scanned linearly. Buckets split on overflow and merge
/// with their split image when one side empties.
///
/// Mutating operations latch pages in header -> directory -> bucket order and
/// release each level as early as the algorithm permits. Keys are unique.
pub struct ExtendibleHashTable {
    header_page_id: PageId,
    bpm: Arc<BufferPoolManager>,
    hash_fn: Box<dyn HashFunction>,
    cmp: Box<dyn KeyComparator>,
    key_size: usize,
    value_size: usize,
    directory_max_depth: u32,
    bucket_max_size: usize,
}

impl ExtendibleHashTable {
    /// Creates a new hash table, allocating its header page.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        key_size: usize,
        value_size: usize,
        hash_fn: Box<dyn HashFunction>,
        cmp: Box<dyn KeyComparator>,
        header_max_depth: u32,
        directory_max_depth: u32,
        bucket_max_size: usize,
    ) -> Result<Self> {
        assert!(header_max_depth <= HASH_TABLE_HEADER_MAX_DEPTH);
        assert!(directory_max_depth <= HASH_TABLE_DIRECTORY_MAX_DEPTH);
        assert!(bucket_max_size >= 1);
        assert!(key_size >= 1);

        if bucket_max_size > hash_bucket_max_entries(key_size, value_size) {
            return Err(StrataError::BucketOverflow {
                entry_size: key_size + value_size,
                max_size: bucket_max_size,
            });
        }

        let header_page_id = {
            let guard = bpm.new_page()?;
            let page_id = guard.page_id();
            let mut header_guard = guard.upgrade_write();
            HashHeaderPage::new(header_guard.data_mut()).init(header_max_depth);
            page_id
        };

        Ok(Self {
            header_page_id,
            bpm,
            hash_fn,
            cmp,
            key_size,
            value_size,
            directory_max_depth,
            bucket_max_size,
        })
    }

    /// Opens an existing hash table rooted at the given header page.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        header_page_id: PageId,
        key_size: usize,
        value_size: usize,
        hash_fn: Box<dyn HashFunction>,
        cmp: Box<dyn KeyComparator>,
        directory_max_depth: u32,
        bucket_max_size: usize,
    ) -> Self {
        Self {
            header_page_id,
            bpm,
            hash_fn,
            cmp,
            key_size,
            value_size,
            directory_max_depth,
            bucket_max_size,
        }
    }

    /// Returns the page ID of the header page.
    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    /// Inserts a key/value pair. Returns false if the key already exists or
    /// the table has no room left for a split.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        assert_eq!(key.len(), self.key_size);
        assert_eq!(value.len(), self.value_size);

        let hash = self.hash_fn.hash(key);
        let mut header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let (directory_idx, directory_page_id) = {
            let header = HashHeaderPageRef::new(header_guard.data());
            let idx = header.hash_to_directory_index(hash);
            (idx, header.directory_page_id(idx))
        };

        if directory_page_id == INVALID_PAGE_ID {
            // The header latch is kept while the directory is created, so the
            // slot installation cannot race another inserter.
            let new_directory = self.bpm.new_page()?;
            let directory_page_id = new_directory.page_id();
            let mut directory_guard = new_directory.upgrade_write();
            HashDirectoryPage::new(directory_guard.data_mut()).init(self.directory_max_depth);
            HashHeaderPage::new(header_guard.data_mut())
                .set_directory_page_id(directory_idx, directory_page_id);
            drop(header_guard);
            debug!(
                "created directory {} for header slot {}",
                directory_page_id, directory_idx
            );
            return self.insert_into_directory(directory_guard, hash, key, value);
        }

        drop(header_guard);
        let directory_guard = self.bpm.fetch_page_write(directory_page_id)?;
        self.insert_into_directory(directory_guard, hash, key, value)
    }

    /// Looks up a key. Returns at most one value since keys are unique.
    pub fn get_value(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        assert_eq!(key.len(), self.key_size);

        let hash = self.hash_fn.hash(key);
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let directory_page_id = {
            let header = HashHeaderPageRef::new(header_guard.data());
            header.directory_page_id(header.hash_to_directory_index(hash))
        };
        drop(header_guard);
        if directory_page_id == INVALID_PAGE_ID {
            return Ok(Vec::new());
        }

        let directory_guard = self.bpm.fetch_page_read(directory_page_id)?;
        let bucket_page_id = {
            let directory = HashDirectoryPageRef::new(directory_guard.data());
            directory.bucket_page_id(directory.hash_to_bucket_index(hash))
        };
        drop(directory_guard);
        if bucket_page_id == INVALID_PAGE_ID {
            return Ok(Vec::new());
        }

        let bucket_guard = self.bpm.fetch_page_read(bucket_page_id)?;
        let bucket = HashBucketPageRef::new(bucket_guard.data());
        Ok(bucket
            .lookup(key, self.cmp.as_ref())
            .map(|value| value.to_vec())
            .into_iter()
            .collect())
    }

    /// Removes a key. Returns false if the key is absent. Empty buckets merge
    /// with their split image and the directory shrinks while it can.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        assert_eq!(key.len(), self.key_size);

        let hash = self.hash_fn.hash(key);
        let header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let directory_page_id = {
            let header = HashHeaderPageRef::new(header_guard.data());
            header.directory_page_id(header.hash_to_directory_index(hash))
        };
        drop(header_guard);
        if directory_page_id == INVALID_PAGE_ID {
            return Ok(false);
        }

        let mut directory_guard = self.bpm.fetch_page_write(directory_page_id)?;
        let (bucket_idx, bucket_page_id) = {
            let directory = HashDirectoryPageRef::new(directory_guard.data());
            let idx = directory.hash_to_bucket_index(hash);
            (idx, directory.bucket_page_id(idx))
        };
        if bucket_page_id == INVALID_PAGE_ID {
            return Ok(false);
        }

        let mut bucket_guard = self.bpm.fetch_page_write(bucket_page_id)?;
        let removed = HashBucketPage::new(bucket_guard.data_mut()).remove(key, self.cmp.as_ref());
        if !removed {
            return Ok(false);
        }

        self.merge_buckets(&mut directory_guard, bucket_guard, bucket_idx)?;

        {
            let mut directory = HashDirectoryPage::new(directory_guard.data_mut());
            while directory.can_shrink() {
                directory.decr_global_depth();
            }
        }
        Ok(true)
    }

    /// Global depth of the directory at the given header slot, if populated.
    pub fn directory_global_depth(&self, directory_idx: usize) -> Result<Option<u32>> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let directory_page_id = {
            let header = HashHeaderPageRef::new(header_guard.data());
            header.directory_page_id(directory_idx)
        };
        drop(header_guard);
        if directory_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let directory_guard = self.bpm.fetch_page_read(directory_page_id)?;
        Ok(Some(HashDirectoryPageRef::new(directory_guard.data()).global_depth()))
    }

    /// Checks the directory invariants of every populated directory.
    /// Panics on violation.
    pub fn verify_integrity(&self) -> Result<()> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let directory_ids: Vec<PageId> = {
            let header = HashHeaderPageRef::new(header_guard.data());
            (0..header.max_size())
                .map(|i| header.directory_page_id(i))
                .collect()
        };
        drop(header_guard);

        for directory_page_id in directory_ids {
            if directory_page_id == INVALID_PAGE_ID {
                continue;
            }
            let directory_guard = self.bpm.fetch_page_read(directory_page_id)?;
            HashDirectoryPageRef::new(directory_guard.data()).verify_integrity();
        }
        Ok(())
    }

    /// Inserts under an exclusively latched directory, splitting the target
    /// bucket as many times as needed.
    fn insert_into_directory(
        &self,
        mut directory_guard: WritePageGuard,
        hash: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        let (mut bucket_idx, mut bucket_page_id) = {
            let directory = HashDirectoryPageRef::new(directory_guard.data());
            let idx = directory.hash_to_bucket_index(hash);
            (idx, directory.bucket_page_id(idx))
        };

        let mut bucket_guard = if bucket_page_id == INVALID_PAGE_ID {
            // First bucket of a fresh directory: every slot aliases it at
            // local depth 0.
            let new_bucket = self.bpm.new_page()?;
            bucket_page_id = new_bucket.page_id();
            let mut bucket_guard = new_bucket.upgrade_write();
            HashBucketPage::new(bucket_guard.data_mut()).init(
                self.bucket_max_size,
                self.key_size,
                self.value_size,
            );
            {
                let mut directory = HashDirectoryPage::new(directory_guard.data_mut());
                for slot in 0..directory.size() {
                    directory.set_bucket_page_id(slot, bucket_page_id);
                    directory.set_local_depth(slot, 0);
                }
            }
            bucket_guard
        } else {
            self.bpm.fetch_page_write(bucket_page_id)?
        };

        loop {
            {
                let mut bucket = HashBucketPage::new(bucket_guard.data_mut());
                if !bucket.is_full() {
                    return Ok(bucket.insert(key, value, self.cmp.as_ref()));
                }
            }

            let (local_depth, global_depth, max_depth) = {
                let directory = HashDirectoryPageRef::new(directory_guard.data());
                (
                    directory.local_depth(bucket_idx),
                    directory.global_depth(),
                    directory.max_depth(),
                )
            };
            if local_depth == global_depth && global_depth == max_depth {
                debug!("directory saturated at depth {}, rejecting insert", global_depth);
                return Ok(false);
            }

            let new_bucket = self.bpm.new_page()?;
            let new_bucket_page_id = new_bucket.page_id();
            let mut new_bucket_guard = new_bucket.upgrade_write();
            HashBucketPage::new(new_bucket_guard.data_mut()).init(
                self.bucket_max_size,
                self.key_size,
                self.value_size,
            );

            if local_depth == global_depth {
                HashDirectoryPage::new(directory_guard.data_mut()).incr_global_depth();
            }

            let split_bit = 1usize << local_depth;
            let split_idx = bucket_idx ^ split_bit;
            self.migrate_entries(&mut bucket_guard, &mut new_bucket_guard, split_idx, local_depth);
            trace!(
                "split bucket {} -> {} at local depth {}",
                bucket_page_id,
                new_bucket_page_id,
                local_depth + 1
            );

            {
                // Every slot that aliased the split bucket advances to the new
                // local depth; slots on the split-image side repoint to the
                // new bucket.
                let mut directory = HashDirectoryPage::new(directory_guard.data_mut());
                let new_local_depth = local_depth + 1;
                let mut slot = bucket_idx & (split_bit - 1);
                while slot < directory.size() {
                    if slot & split_bit == split_idx & split_bit {
                        directory.set_bucket_page_id(slot, new_bucket_page_id);
                    }
                    directory.set_local_depth(slot, new_local_depth);
                    slot += split_bit;
                }
            }

            // Re-aim at the bucket the key hashes to now and re-test.
            let target_page_id = {
                let directory = HashDirectoryPageRef::new(directory_guard.data());
                bucket_idx = directory.hash_to_bucket_index(hash);
                directory.bucket_page_id(bucket_idx)
            };
            if target_page_id == new_bucket_page_id {
                bucket_page_id = new_bucket_page_id;
                bucket_guard = new_bucket_guard;
            } else {
                debug_assert_eq!(target_page_id, bucket_page_id);
            }
        }
    }

    /// Moves every entry whose hash bit at `local_depth` matches the split
    /// image over to the new bucket.
    fn migrate_entries(
        &self,
        old_guard: &mut WritePageGuard,
        new_guard: &mut WritePageGuard,
        split_idx: usize,
        local_depth: u32,
    ) {
        let mut old_bucket = HashBucketPage::new(old_guard.data_mut());
        let mut new_bucket = HashBucketPage::new(new_guard.data_mut());
        let depth_bit = 1u32 << local_depth;
        let target = split_idx as u32 & depth_bit;

        let mut i = old_bucket.size();
        while i > 0 {
            i -= 1;
            let hash = self.hash_fn.hash(old_bucket.key_at(i));
            if hash & depth_bit == target {
                let moved = {
                    let key = old_bucket.key_at(i);
                    let value = old_bucket.value_at(i);
                    new_bucket.insert(key, value, self.cmp.as_ref())
                };
                debug_assert!(moved);
                old_bucket.remove_at(i);
            }
        }
    }

    /// Repeatedly merges the bucket with its split image while either side is
    /// empty and both sit at the same local depth.
    fn merge_buckets(
        &self,
        directory_guard: &mut WritePageGuard,
        mut bucket_guard: WritePageGuard,
        mut bucket_idx: usize,
    ) -> Result<()> {
        loop {
            let (local_depth, bucket_page_id) = {
                let directory = HashDirectoryPageRef::new(directory_guard.data());
                (
                    directory.local_depth(bucket_idx),
                    directory.bucket_page_id(bucket_idx),
                )
            };
            if local_depth == 0 {
                break;
            }

            let merge_idx = bucket_idx ^ (1usize << (local_depth - 1));
            let (merge_local_depth, merge_page_id) = {
                let directory = HashDirectoryPageRef::new(directory_guard.data());
                (
                    directory.local_depth(merge_idx),
                    directory.bucket_page_id(merge_idx),
                )
            };
            if merge_local_depth != local_depth {
                break;
            }

            let merge_guard = self.bpm.fetch_page_write(merge_page_id)?;
            let bucket_empty = HashBucketPageRef::new(bucket_guard.data()).is_empty();
            let merge_empty = HashBucketPageRef::new(merge_guard.data()).is_empty();
            if !bucket_empty && !merge_empty {
                break;
            }

            // The survivor keeps the entries; the empty page is deleted.
            let (survivor_idx, survivor_page_id, survivor_guard, dead_page_id, dead_guard) =
                if merge_empty {
                    (bucket_idx, bucket_page_id, bucket_guard, merge_page_id, merge_guard)
                } else {
                    (merge_idx, merge_page_id, merge_guard, bucket_page_id, bucket_guard)
                };

            {
                let mut directory = HashDirectoryPage::new(directory_guard.data_mut());
                let new_depth = local_depth - 1;
                let stride = 1usize << new_depth;
                let mut slot = survivor_idx & (stride - 1);
                while slot < directory.size() {
                    directory.set_bucket_page_id(slot, survivor_page_id);
                    directory.set_local_depth(slot, new_depth);
                    slot += stride;
                }
            }
            trace!("merged bucket {} into {}", dead_page_id, survivor_page_id);

            drop(dead_guard);
            if let Err(e) = self.bpm.delete_page(dead_page_id) {
                // A concurrent reader may still pin the dead page; the
                // directory no longer references it either way.
                debug!("could not delete bucket {}: {}", dead_page_id, e);
            }

            bucket_idx = survivor_idx;
            bucket_guard = survivor_guard;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IdentityHashFunction, IntegerComparator};
    use crate::storage::disk::DiskManager;
    use tempfile::NamedTempFile;

    fn create_table(
        pool_size: usize,
        header_max_depth: u32,
        directory_max_depth: u32,
        bucket_max_size: usize,
    ) -> (ExtendibleHashTable, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(pool_size, 2, dm));
        let table = ExtendibleHashTable::new(
            bpm,
            4,
            4,
            Box::new(IdentityHashFunction),
            Box::new(IntegerComparator),
            header_max_depth,
            directory_max_depth,
            bucket_max_size,
        )
        .unwrap();
        (table, temp_file)
    }

    fn key(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    #[test]
    fn test_hash_table_insert_and_get() {
        let (table, _temp) = create_table(10, 2, 3, 10);

        assert!(table.insert(&key(1), &key(100)).unwrap());
        assert!(table.insert(&key(2), &key(200)).unwrap());

        assert_eq!(table.get_value(&key(1)).unwrap(), vec![key(100).to_vec()]);
        assert_eq!(table.get_value(&key(2)).unwrap(), vec![key(200).to_vec()]);
        assert!(table.get_value(&key(3)).unwrap().is_empty());
    }

    #[test]
    fn test_hash_table_duplicate_key_rejected() {
        let (table, _temp) = create_table(10, 2, 3, 10);

        assert!(table.insert(&key(1), &key(100)).unwrap());
        assert!(!table.insert(&key(1), &key(999)).unwrap());
        assert_eq!(table.get_value(&key(1)).unwrap(), vec![key(100).to_vec()]);
    }

    #[test]
    fn test_hash_table_remove() {
        let (table, _temp) = create_table(10, 2, 3, 10);

        assert!(table.insert(&key(1), &key(100)).unwrap());
        assert!(table.remove(&key(1)).unwrap());
        assert!(table.get_value(&key(1)).unwrap().is_empty());
        assert!(!table.remove(&key(1)).unwrap());
    }

    #[test]
    fn test_hash_table_rejects_oversized_bucket_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(10, 2, dm));
        let result = ExtendibleHashTable::new(
            bpm,
            64,
            64,
            Box::new(IdentityHashFunction),
            Box::new(IntegerComparator),
            0,
            2,
            1000,
        );
        assert!(matches!(result, Err(StrataError::BucketOverflow { .. })));
    }
}
