use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::common::{PageId, Result, StrataError, PAGE_SIZE};

use super::DiskManager;

/// Represents a disk I/O request
pub struct DiskRequest {
    /// Whether this is a write (true) or read (false) request
    pub is_write: bool,
    /// Pointer to the data buffer (must be PAGE_SIZE bytes)
    /// For reads: data will be written here
    /// For writes: data will be read from here
    pub data: *mut u8,
    /// The page ID to read/write
    pub page_id: PageId,
    /// Completion handle, signaled exactly once when the request finishes
    pub callback: mpsc::Sender<bool>,
}

// Safety: requests are handed to the single worker thread, and every
// producer blocks on the completion handle while its buffer is in use.
unsafe impl Send for DiskRequest {}

impl DiskRequest {
    /// Creates a new read request
    pub fn read(page_id: PageId, data: *mut u8, callback: mpsc::Sender<bool>) -> Self {
        Self {
            is_write: false,
            data,
            page_id,
            callback,
        }
    }

    /// Creates a new write request
    pub fn write(page_id: PageId, data: *mut u8, callback: mpsc::Sender<bool>) -> Self {
        Self {
            is_write: true,
            data,
            page_id,
            callback,
        }
    }
}

/// DiskScheduler serializes page I/O on a single background worker thread.
/// Requests are processed strictly FIFO, so a write followed by a read of
/// the same page observes the write.
pub struct DiskScheduler {
    /// The disk manager for actual I/O operations
    disk_manager: Arc<DiskManager>,
    /// Channel sender for queuing requests; None is the shutdown sentinel
    request_sender: Sender<Option<DiskRequest>>,
    /// Handle to the background worker thread
    worker_handle: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    /// Creates a new DiskScheduler with the given DiskManager.
    /// Spawns a background worker thread to process requests.
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (sender, receiver) = unbounded::<Option<DiskRequest>>();

        let dm_clone = Arc::clone(&disk_manager);
        let worker_handle = thread::spawn(move || {
            Self::start_worker_thread(dm_clone, receiver);
        });

        Self {
            disk_manager,
            request_sender: sender,
            worker_handle: Some(worker_handle),
        }
    }

    /// Creates a completion handle pair for a request.
    pub fn create_completion() -> (mpsc::Sender<bool>, mpsc::Receiver<bool>) {
        mpsc::channel()
    }

    /// Schedules a disk request for processing by the background worker.
    pub fn schedule(&self, request: DiskRequest) -> Result<()> {
        self.request_sender
            .send(Some(request))
            .map_err(|e| StrataError::DiskScheduler(format!("Failed to schedule request: {}", e)))
    }

    /// Schedules a read request and blocks until it completes.
    /// Panics if the worker reports an I/O failure.
    pub fn schedule_read_sync(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let (tx, rx) = Self::create_completion();
        self.schedule(DiskRequest::read(page_id, data.as_mut_ptr(), tx))?;

        let ok = rx.recv().map_err(|e| {
            StrataError::DiskScheduler(format!("Failed to receive completion: {}", e))
        })?;
        assert!(ok, "read of {} failed", page_id);

        Ok(())
    }

    /// Schedules a write request and blocks until it completes.
    /// Panics if the worker reports an I/O failure.
    pub fn schedule_write_sync(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let (tx, rx) = Self::create_completion();
        // The worker only reads through the pointer for write requests.
        self.schedule(DiskRequest::write(page_id, data.as_ptr() as *mut u8, tx))?;

        let ok = rx.recv().map_err(|e| {
            StrataError::DiskScheduler(format!("Failed to receive completion: {}", e))
        })?;
        assert!(ok, "write of {} failed", page_id);

        Ok(())
    }

    /// The background worker thread function.
    /// Processes requests in FIFO order until the shutdown sentinel arrives.
    fn start_worker_thread(disk_manager: Arc<DiskManager>, receiver: Receiver<Option<DiskRequest>>) {
        while let Ok(Some(request)) = receiver.recv() {
            Self::process_request(&disk_manager, request);
        }
    }

    /// Processes a single disk request and signals its completion handle.
    fn process_request(disk_manager: &DiskManager, request: DiskRequest) {
        let success = if request.is_write {
            // Safety: the producer keeps the buffer alive until completion
            let data = unsafe { std::slice::from_raw_parts(request.data, PAGE_SIZE) };
            disk_manager.write_page(request.page_id, data).is_ok()
        } else {
            // Safety: the producer keeps the buffer alive until completion
            let data = unsafe { std::slice::from_raw_parts_mut(request.data, PAGE_SIZE) };
            disk_manager.read_page(request.page_id, data).is_ok()
        };

        let _ = request.callback.send(success);
    }

    /// Returns a reference to the underlying DiskManager.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        // The sentinel makes the worker exit after draining everything queued
        // ahead of it.
        let _ = self.request_sender.send(None);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_disk_scheduler_read_write() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let scheduler = DiskScheduler::new(dm);

        let page_id = scheduler.disk_manager().allocate_page().unwrap();

        let mut write_data = [0u8; PAGE_SIZE];
        write_data[0] = 42;
        write_data[100] = 255;
        scheduler.schedule_write_sync(page_id, &write_data).unwrap();

        let mut read_data = [0u8; PAGE_SIZE];
        scheduler
            .schedule_read_sync(page_id, &mut read_data)
            .unwrap();

        assert_eq!(read_data[0], 42);
        assert_eq!(read_data[100], 255);
    }

    #[test]
    fn test_disk_scheduler_write_then_read_fifo() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let scheduler = DiskScheduler::new(dm);

        let page_id = scheduler.disk_manager().allocate_page().unwrap();

        // Queue a write and a read of the same page back to back; FIFO
        // processing means the read must observe the write.
        let mut write_data = [7u8; PAGE_SIZE];
        let mut read_data = [0u8; PAGE_SIZE];

        let (wtx, wrx) = DiskScheduler::create_completion();
        let (rtx, rrx) = DiskScheduler::create_completion();
        scheduler
            .schedule(DiskRequest::write(page_id, write_data.as_mut_ptr(), wtx))
            .unwrap();
        scheduler
            .schedule(DiskRequest::read(page_id, read_data.as_mut_ptr(), rtx))
            .unwrap();

        assert!(wrx.recv().unwrap());
        assert!(rrx.recv().unwrap());
        assert_eq!(read_data[0], 7);
        assert_eq!(read_data[PAGE_SIZE - 1], 7);
    }

    #[test]
    fn test_disk_scheduler_multiple_requests() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let scheduler = DiskScheduler::new(dm);

        let page_id1 = scheduler.disk_manager().allocate_page().unwrap();
        let page_id2 = scheduler.disk_manager().allocate_page().unwrap();

        let data1 = [1u8; PAGE_SIZE];
        let data2 = [2u8; PAGE_SIZE];

        scheduler.schedule_write_sync(page_id1, &data1).unwrap();
        scheduler.schedule_write_sync(page_id2, &data2).unwrap();

        let mut read1 = [0u8; PAGE_SIZE];
        let mut read2 = [0u8; PAGE_SIZE];

        scheduler.schedule_read_sync(page_id1, &mut read1).unwrap();
        scheduler.schedule_read_sync(page_id2, &mut read2).unwrap();

        assert_eq!(read1[0], 1);
        assert_eq!(read2[0], 2);
    }

    #[test]
    fn test_disk_scheduler_shutdown_drains_queue() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());

        let page_id;
        let mut data = [9u8; PAGE_SIZE];
        let rx;
        {
            let scheduler = DiskScheduler::new(Arc::clone(&dm));
            page_id = scheduler.disk_manager().allocate_page().unwrap();

            let (tx, crx) = DiskScheduler::create_completion();
            scheduler
                .schedule(DiskRequest::write(page_id, data.as_mut_ptr(), tx))
                .unwrap();
            rx = crx;
            // Dropping the scheduler enqueues the sentinel behind the write
            // and joins the worker.
        }

        assert!(rx.recv().unwrap());

        let mut read_data = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_data).unwrap();
        assert_eq!(read_data[0], 9);
    }
}
