use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::{FrameId, PageId, Result, StrataError, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::disk::{DiskManager, DiskRequest, DiskScheduler};

use super::{BasicPageGuard, FrameHeader, LruKReplacer, ReadPageGuard, WritePageGuard};

/// Bookkeeping protected by the coarse latch
struct PoolInner {
    /// Page table: maps resident page IDs to frame IDs
    page_table: HashMap<PageId, FrameId>,
    /// Frames that hold no page
    free_list: VecDeque<FrameId>,
    /// Per-frame flag, set while a disk request for the frame is outstanding
    io_in_flight: Vec<bool>,
}

/// State shared between the manager and its page guards
struct PoolState {
    /// The buffer pool frames; addresses are stable for the pool's lifetime
    frames: Vec<Arc<FrameHeader>>,
    /// The coarse latch: page table, free list and in-flight flags
    latch: Mutex<PoolInner>,
    /// Per-frame condition variables, signaled when a frame's I/O completes
    io_done: Vec<Condvar>,
    /// LRU-K replacer for eviction decisions
    replacer: LruKReplacer,
}

impl PoolState {
    /// Decrements a page's pin count, recording the dirty flag. When the pin
    /// count reaches zero the frame becomes evictable. Returns false if the
    /// page is unknown or was not pinned.
    fn unpin(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.latch.lock();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.as_usize()];
            if is_dirty {
                frame.set_dirty(true);
            }
            match frame.unpin() {
                Some(0) => {
                    self.replacer.set_evictable(frame_id, true);
                    true
                }
                Some(_) => true,
                None => false,
            }
        } else {
            false
        }
    }
}

/// BufferPoolManager mediates between a fixed set of in-memory frames and the
/// page-addressable disk. It hands out RAII guards that pin (and optionally
/// latch) pages, evicts cold pages through the LRU-K replacer, and serializes
/// all disk traffic through the disk scheduler's FIFO worker.
///
/// Locking discipline: the coarse latch is never held across a page-latch
/// acquisition, and it is released (with the frame flagged in-flight) while
/// waiting on a disk completion.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    /// Shared state, also captured by guard release callbacks
    state: Arc<PoolState>,
    /// Disk scheduler for all page I/O
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given pool size, k value for
    /// LRU-K, and disk manager.
    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: Arc<DiskManager>) -> Self {
        assert!(pool_size >= 1, "pool must have at least one frame");

        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        let mut io_done = Vec::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
            io_done.push(Condvar::new());
        }

        let state = Arc::new(PoolState {
            frames,
            latch: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list,
                io_in_flight: vec![false; pool_size],
            }),
            io_done,
            replacer: LruKReplacer::new(replacer_k, pool_size),
        });

        Self {
            pool_size,
            state,
            disk_scheduler: DiskScheduler::new(disk_manager),
        }
    }

    /// Allocates a fresh page and returns a guard pinning it. The frame
    /// buffer is zeroed. Fails with BufferPoolFull when every frame is pinned.
    pub fn new_page(&self) -> Result<BasicPageGuard> {
        let mut inner = self.state.latch.lock();
        let frame_id = self.pick_victim(&mut inner)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        // The victim is unmapped and unpinned, so its page latch is free;
        // holding it keeps the buffer invisible until it is prepared.
        let mut data = frame.data.write();

        let page_id = self.disk_scheduler.disk_manager().allocate_page()?;

        let old_page_id = frame.page_id();
        if old_page_id != INVALID_PAGE_ID {
            inner.page_table.remove(&old_page_id);
        }
        inner.page_table.insert(page_id, frame_id);
        frame.pin();
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);

        if old_page_id != INVALID_PAGE_ID && frame.is_dirty() {
            debug!("evicting dirty {} from frame {}", old_page_id, frame_id);
            inner.io_in_flight[frame_id.as_usize()] = true;
            let (tx, rx) = DiskScheduler::create_completion();
            self.disk_scheduler
                .schedule(DiskRequest::write(old_page_id, data.as_mut_ptr(), tx))?;
            let completion = MutexGuard::unlocked(&mut inner, || rx.recv());
            inner.io_in_flight[frame_id.as_usize()] = false;
            self.state.io_done[frame_id.as_usize()].notify_all();
            await_completion(completion, old_page_id, true)?;
        }

        data.fill(0);
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        drop(data);
        drop(inner);

        trace!("allocated {} in frame {}", page_id, frame_id);
        Ok(self.make_guard(page_id, frame_id))
    }

    /// Fetches a page and returns an unlatched guard pinning it.
    pub fn fetch_page_basic(&self, page_id: PageId) -> Result<BasicPageGuard> {
        let frame_id = self.fetch_frame(page_id)?;
        Ok(self.make_guard(page_id, frame_id))
    }

    /// Fetches a page and returns a guard holding its shared latch.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        Ok(self.fetch_page_basic(page_id)?.upgrade_read())
    }

    /// Fetches a page and returns a guard holding its exclusive latch.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        Ok(self.fetch_page_basic(page_id)?.upgrade_write())
    }

    /// Decrements a page's pin count, OR-ing in the dirty flag. Guards call
    /// this on drop; calling it directly is only needed for manual pinning.
    /// Returns false if the page is unknown or already unpinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.state.unpin(page_id, is_dirty)
    }

    /// Writes a page to disk through the scheduler and clears its dirty flag.
    /// Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(StrataError::InvalidPageId(page_id));
        }

        let mut inner = self.state.latch.lock();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            self.flush_frame(&mut inner, frame_id, page_id)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Flushes every resident page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let mut inner = self.state.latch.lock();
        let entries: Vec<(PageId, FrameId)> =
            inner.page_table.iter().map(|(&p, &f)| (p, f)).collect();

        for (page_id, frame_id) in entries {
            // The latch is released during each write; skip entries that
            // moved underneath us.
            if inner.page_table.get(&page_id) == Some(&frame_id) {
                self.flush_frame(&mut inner, frame_id, page_id)?;
            }
        }
        Ok(())
    }

    /// Deletes a page from the buffer pool, flushing it first if dirty, and
    /// returns its frame to the free list. Fails if the page is pinned;
    /// returns false if the page is not resident.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.state.latch.lock();
        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(false),
        };

        let frame = &self.state.frames[frame_id.as_usize()];
        if frame.pin_count() > 0 {
            return Err(StrataError::PageStillPinned(page_id));
        }

        if frame.is_dirty() {
            self.flush_frame(&mut inner, frame_id, page_id)?;
            // The latch was released during the write; re-validate.
            if inner.page_table.get(&page_id) != Some(&frame_id) {
                return Ok(false);
            }
            if frame.pin_count() > 0 {
                return Err(StrataError::PageStillPinned(page_id));
            }
        }

        inner.page_table.remove(&page_id);
        self.state.replacer.remove(frame_id);
        frame.reset();
        inner.free_list.push_back(frame_id);
        drop(inner);

        self.disk_scheduler.disk_manager().deallocate_page(page_id)?;
        debug!("deleted {}", page_id);
        Ok(true)
    }

    /// Returns the pin count for a resident page.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.state.latch.lock();
        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    /// Returns the pool size.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.state.latch.lock().free_list.len()
    }

    /// Returns the number of evictable frames.
    pub fn evictable_frame_count(&self) -> usize {
        self.state.replacer.size()
    }

    /// Returns a reference to the underlying DiskManager.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.disk_scheduler.disk_manager()
    }

    /// Pins the frame holding `page_id`, reading it from disk if necessary.
    fn fetch_frame(&self, page_id: PageId) -> Result<FrameId> {
        if page_id == INVALID_PAGE_ID {
            return Err(StrataError::InvalidPageId(page_id));
        }

        let mut inner = self.state.latch.lock();

        // Fast path: already resident. Pin before waiting out any in-flight
        // I/O so the frame cannot be evicted underneath us.
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];
            frame.pin();
            self.state.replacer.record_access(frame_id);
            self.state.replacer.set_evictable(frame_id, false);
            while inner.io_in_flight[frame_id.as_usize()] {
                self.state.io_done[frame_id.as_usize()].wait(&mut inner);
            }
            return Ok(frame_id);
        }

        // Miss: take a victim frame and install the new mapping before any
        // latch release, so a concurrent fetch of the same page waits on the
        // in-flight flag instead of claiming a second frame. The write-back
        // of the old resident and the read of the new page are queued under
        // the latch (FIFO with any racing re-fetch of the old page) and
        // awaited without it.
        let frame_id = self.pick_victim(&mut inner)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        // The victim is unmapped and unpinned, so its page latch is free.
        let mut data = frame.data.write();

        let old_page_id = frame.page_id();
        if old_page_id != INVALID_PAGE_ID {
            inner.page_table.remove(&old_page_id);
        }
        inner.page_table.insert(page_id, frame_id);
        frame.pin();
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);
        inner.io_in_flight[frame_id.as_usize()] = true;

        if old_page_id != INVALID_PAGE_ID && frame.is_dirty() {
            debug!("evicting dirty {} from frame {}", old_page_id, frame_id);
            let (tx, rx) = DiskScheduler::create_completion();
            self.disk_scheduler
                .schedule(DiskRequest::write(old_page_id, data.as_mut_ptr(), tx))?;
            let completion = MutexGuard::unlocked(&mut inner, || rx.recv());
            await_completion(completion, old_page_id, true)?;
        }

        let (tx, rx) = DiskScheduler::create_completion();
        self.disk_scheduler
            .schedule(DiskRequest::read(page_id, data.as_mut_ptr(), tx))?;
        let completion = MutexGuard::unlocked(&mut inner, || rx.recv());

        frame.set_page_id(page_id);
        frame.set_dirty(false);
        inner.io_in_flight[frame_id.as_usize()] = false;
        self.state.io_done[frame_id.as_usize()].notify_all();
        drop(data);

        await_completion(completion, page_id, false)?;
        Ok(frame_id)
    }

    /// Picks a frame from the free list, or asks the replacer for a victim.
    /// The coarse latch is held throughout; nothing is written back here.
    fn pick_victim(&self, inner: &mut MutexGuard<'_, PoolInner>) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }
        self.state.replacer.evict().ok_or(StrataError::BufferPoolFull)
    }

    /// Flushes a frame whose page is still mapped. Shields it from eviction
    /// and marks it in-flight while the latch is released; the buffer
    /// snapshot happens without the coarse latch, so blocking on the page
    /// latch (an active write guard) cannot stall the whole pool.
    fn flush_frame(
        &self,
        inner: &mut MutexGuard<'_, PoolInner>,
        frame_id: FrameId,
        page_id: PageId,
    ) -> Result<()> {
        // Wait out any I/O already in flight for this frame, then make sure
        // the mapping survived the wait.
        while inner.io_in_flight[frame_id.as_usize()] {
            self.state.io_done[frame_id.as_usize()].wait(inner);
        }
        if inner.page_table.get(&page_id) != Some(&frame_id) {
            return Ok(());
        }

        let frame = &self.state.frames[frame_id.as_usize()];
        self.state.replacer.set_evictable(frame_id, false);

        inner.io_in_flight[frame_id.as_usize()] = true;
        let result = MutexGuard::unlocked(inner, || {
            let mut buf = [0u8; PAGE_SIZE];
            frame.copy_to(&mut buf);
            self.disk_scheduler.schedule_write_sync(page_id, &buf)
        });
        inner.io_in_flight[frame_id.as_usize()] = false;
        self.state.io_done[frame_id.as_usize()].notify_all();

        if result.is_ok() {
            frame.set_dirty(false);
        }
        if frame.pin_count() == 0 {
            self.state.replacer.set_evictable(frame_id, true);
        }
        result
    }

    /// Builds a guard whose release callback performs the single unpin owed
    /// for a successful fetch or allocation.
    fn make_guard(&self, page_id: PageId, frame_id: FrameId) -> BasicPageGuard {
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        let state = Arc::clone(&self.state);
        BasicPageGuard::new(
            page_id,
            frame,
            Box::new(move |pid, is_dirty| {
                state.unpin(pid, is_dirty);
            }),
        )
    }
}

/// Unwraps a completion-handle result. An I/O failure reported by the worker
/// is fatal; a dropped handle surfaces as a scheduler error.
fn await_completion(
    completion: std::result::Result<bool, std::sync::mpsc::RecvError>,
    page_id: PageId,
    is_write: bool,
) -> Result<()> {
    let ok = completion.map_err(|e| {
        StrataError::DiskScheduler(format!("Failed to receive completion: {}", e))
    })?;
    assert!(
        ok,
        "{} of {} failed",
        if is_write { "write" } else { "read" },
        page_id
    );
    Ok(())
}
