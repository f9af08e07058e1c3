use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::FrameHeader;

/// Callback invoked exactly once when a guard releases its page.
/// Arguments are the page id and the accumulated dirty flag.
type ReleaseCallback = Box<dyn FnOnce(PageId, bool) + Send + Sync>;

/// RAII guard that holds a pin on a page without latching it.
///
/// Dropping the guard unpins the page with the accumulated dirty flag.
/// Upgrading consumes the guard and hands its pin to the latched guard, so
/// exactly one unpin happens per fetch however the guard is used.
pub struct BasicPageGuard {
    page_id: PageId,
    frame: Option<Arc<FrameHeader>>,
    release_callback: Option<ReleaseCallback>,
    is_dirty: bool,
}

impl BasicPageGuard {
    pub(crate) fn new(page_id: PageId, frame: Arc<FrameHeader>, release_callback: ReleaseCallback) -> Self {
        Self {
            page_id,
            frame: Some(frame),
            release_callback: Some(release_callback),
            is_dirty: false,
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Upgrades to a read guard, taking the shared page latch.
    /// Consumes this guard; its pin transfers to the read guard.
    pub fn upgrade_read(mut self) -> ReadPageGuard {
        let frame = self.frame.take().unwrap();
        let callback = self.release_callback.take().unwrap();
        unsafe { ReadPageGuard::new(self.page_id, frame, callback, self.is_dirty) }
    }

    /// Upgrades to a write guard, taking the exclusive page latch.
    /// Consumes this guard; its pin transfers to the write guard.
    pub fn upgrade_write(mut self) -> WritePageGuard {
        let frame = self.frame.take().unwrap();
        let callback = self.release_callback.take().unwrap();
        unsafe { WritePageGuard::new(self.page_id, frame, callback) }
    }

    /// Drops this guard, releasing the page.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Drop for BasicPageGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.release_callback.take() {
            callback(self.page_id, self.is_dirty);
        }
    }
}

/// RAII guard for read-only access to a page.
///
/// Holds the shared page latch for its lifetime; dropping releases the latch
/// and then unpins the page.
pub struct ReadPageGuard {
    page_id: PageId,
    /// Kept alive for the transmuted latch guard below
    _frame: Arc<FrameHeader>,
    release_callback: Option<ReleaseCallback>,
    is_dirty: bool,
    /// Shared latch on the page data; dropped before the release callback runs
    data_guard: Option<RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl ReadPageGuard {
    /// # Safety
    /// The frame must stay alive for the guard's lifetime; the Arc held by
    /// the guard guarantees this.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
        is_dirty: bool,
    ) -> Self {
        let data_guard = frame.data.read();
        let data_guard: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            page_id,
            _frame: frame,
            release_callback: Some(release_callback),
            is_dirty,
            data_guard: Some(data_guard),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns a reference to the page data.
    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    /// Drops this guard, releasing the latch and the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Latch first, then unpin
        self.data_guard.take();
        if let Some(callback) = self.release_callback.take() {
            callback(self.page_id, self.is_dirty);
        }
    }
}

/// RAII guard for read-write access to a page.
///
/// Holds the exclusive page latch for its lifetime. The page is considered
/// dirty from the moment the guard exists; dropping releases the latch, then
/// unpins with dirty=true.
pub struct WritePageGuard {
    page_id: PageId,
    /// Kept alive for the transmuted latch guard below
    _frame: Arc<FrameHeader>,
    release_callback: Option<ReleaseCallback>,
    /// Exclusive latch on the page data; dropped before the release callback
    data_guard: Option<RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl WritePageGuard {
    /// # Safety
    /// The frame must stay alive for the guard's lifetime; the Arc held by
    /// the guard guarantees this.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        let data_guard = frame.data.write();
        let data_guard: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            page_id,
            _frame: frame,
            release_callback: Some(release_callback),
            data_guard: Some(data_guard),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns a reference to the page data.
    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    /// Returns a mutable reference to the page data.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data_guard.as_mut().unwrap()[..]
    }

    /// Drops this guard, releasing the latch and the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // Latch first, then unpin; a write guard always reports dirty
        self.data_guard.take();
        if let Some(callback) = self.release_callback.take() {
            callback(self.page_id, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FrameId;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn tracked_callback() -> (ReleaseCallback, Arc<AtomicBool>, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let dirty = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();
        let dirty_clone = dirty.clone();
        let callback: ReleaseCallback = Box::new(move |_, is_dirty| {
            released_clone.store(true, Ordering::SeqCst);
            dirty_clone.store(is_dirty, Ordering::SeqCst);
        });
        (callback, released, dirty)
    }

    #[test]
    fn test_basic_guard_releases_clean() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        let (callback, released, dirty) = tracked_callback();

        let guard = BasicPageGuard::new(PageId::new(1), frame, callback);
        assert_eq!(guard.page_id(), PageId::new(1));
        assert!(!released.load(Ordering::SeqCst));

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
        assert!(!dirty.load(Ordering::SeqCst));
    }

    #[test]
    fn test_basic_guard_upgrade_read_releases_once() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.copy_from(&{
            let mut data = [0u8; PAGE_SIZE];
            data[0] = 42;
            data
        });
        let (callback, released, _dirty) = tracked_callback();

        let basic = BasicPageGuard::new(PageId::new(1), frame, callback);
        let read = basic.upgrade_read();

        // Upgrading must not have triggered the release
        assert!(!released.load(Ordering::SeqCst));
        assert_eq!(read.data()[0], 42);

        drop(read);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_guard_reports_dirty() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        let (callback, released, dirty) = tracked_callback();

        let basic = BasicPageGuard::new(PageId::new(1), frame.clone(), callback);
        let mut write = basic.upgrade_write();
        write.data_mut()[0] = 42;

        drop(write);
        assert!(released.load(Ordering::SeqCst));
        assert!(dirty.load(Ordering::SeqCst));

        let mut read_data = [0u8; PAGE_SIZE];
        frame.copy_to(&mut read_data);
        assert_eq!(read_data[0], 42);
    }

    #[test]
    fn test_read_guards_share_latch() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        let (cb1, _, _) = tracked_callback();
        let (cb2, _, _) = tracked_callback();

        let g1 = unsafe { ReadPageGuard::new(PageId::new(1), frame.clone(), cb1, false) };
        // A second shared latch on the same frame must not block
        let g2 = unsafe { ReadPageGuard::new(PageId::new(1), frame, cb2, false) };

        assert_eq!(g1.data().len(), PAGE_SIZE);
        assert_eq!(g2.data().len(), PAGE_SIZE);
    }

    #[test]
    fn test_move_releases_previous_guard() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        let (cb1, released1, _) = tracked_callback();
        let (cb2, released2, _) = tracked_callback();

        let mut guard = BasicPageGuard::new(PageId::new(1), frame.clone(), cb1);
        // Move-assignment drops the previous guard before adopting the new one
        guard = BasicPageGuard::new(PageId::new(2), frame, cb2);

        assert!(released1.load(Ordering::SeqCst));
        assert!(!released2.load(Ordering::SeqCst));
        assert_eq!(guard.page_id(), PageId::new(2));
    }
}
