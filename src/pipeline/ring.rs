//! Page-buffered trace output with a small SPSC ring of pending writes.
//!
//! The session thread assembles 64 Ki-float pages and queues them; the
//! writer thread reaps queued pages and writes each one at its recorded
//! file offset. `head` is only ever advanced by the producer and `tail`
//! only by the consumer, published with release/acquire ordering, so the
//! two threads need no lock around the indices. The slot mutexes are
//! uncontended by protocol; they exist to hand the page memory across the
//! thread boundary safely.
//!
//! File format: one version byte `0xF1`, the four raw little-endian bytes
//! of the configured sample rate as an `f32`, then consecutive
//! little-endian `f32` energy samples.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::ProbeError;

/// Floats per page.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Pages in the ring.
pub const RING_PAGES: usize = 8;

/// First byte of every trace file.
pub const FILE_VERSION: u8 = 0xf1;

/// Writer-thread wait granularity.
pub const WRITER_WAIT: Duration = Duration::from_millis(10);

#[derive(Default)]
struct PageSlot {
    bytes: Vec<u8>,
    offset: u64,
}

pub struct RingShared {
    slots: Vec<Mutex<PageSlot>>,
    head: AtomicUsize,
    tail: AtomicUsize,
    doorbell: Mutex<bool>,
    bell: Condvar,
    stop: AtomicBool,
    file: File,
    failed: Mutex<Option<String>>,
}

impl RingShared {
    /// Write out every queued page, advancing the tail.
    pub fn drain(&self) {
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            if tail == self.head.load(Ordering::Acquire) {
                break;
            }
            {
                let slot = self.slots[tail].lock().expect("page slot poisoned");
                if let Err(err) = self.file.write_all_at(&slot.bytes, slot.offset) {
                    log::error!("page write failed: {err}");
                    let mut failed = self.failed.lock().expect("failure slot poisoned");
                    if failed.is_none() {
                        *failed = Some(err.to_string());
                    }
                }
            }
            self.tail.store((tail + 1) % RING_PAGES, Ordering::Release);
        }
    }

    /// Park until the producer rings the doorbell or the timeout lapses.
    /// A timeout is routine, not an error.
    pub fn wait_doorbell(&self, timeout: Duration) {
        let guard = self.doorbell.lock().expect("doorbell poisoned");
        if !*guard {
            let (mut guard, _) = self
                .bell
                .wait_timeout(guard, timeout)
                .expect("doorbell poisoned");
            *guard = false;
        } else {
            let mut guard = guard;
            *guard = false;
        }
    }

    fn ring_doorbell(&self) {
        *self.doorbell.lock().expect("doorbell poisoned") = true;
        self.bell.notify_one();
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.ring_doorbell();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Queued pages not yet written.
    pub fn queued(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + RING_PAGES - tail) % RING_PAGES
    }

    pub fn take_error(&self) -> Option<String> {
        self.failed.lock().expect("failure slot poisoned").take()
    }
}

/// The writer thread body: reap pages until asked to stop, then drain what
/// is left so the producer's final pages reach the disk.
pub fn writer_loop(shared: &RingShared) {
    while !shared.stop_requested() {
        shared.wait_doorbell(WRITER_WAIT);
        shared.drain();
    }
    shared.drain();
}

/// Producer half: page assembly, header, offsets and the final flush.
pub struct PageWriter {
    shared: Arc<RingShared>,
    current: Vec<f32>,
    file_offset: u64,
}

impl PageWriter {
    /// Create the trace file and write the 5-byte header.
    pub fn create(path: &Path, sample_rate: u32) -> Result<Self, ProbeError> {
        use std::io::Write;
        let mut file = File::create(path)?;
        file.write_all(&[FILE_VERSION])?;
        file.write_all(&(sample_rate as f32).to_le_bytes())?;
        let shared = Arc::new(RingShared {
            slots: (0..RING_PAGES).map(|_| Mutex::new(PageSlot::default())).collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            doorbell: Mutex::new(false),
            bell: Condvar::new(),
            stop: AtomicBool::new(false),
            file,
            failed: Mutex::new(None),
        });
        Ok(Self {
            shared,
            current: Vec::with_capacity(MAX_PAGE_SIZE),
            file_offset: 5,
        })
    }

    pub fn shared(&self) -> Arc<RingShared> {
        Arc::clone(&self.shared)
    }

    /// Append one energy sample; queues the page when it fills.
    pub fn push(&mut self, value: f32) -> Result<(), ProbeError> {
        self.current.push(value);
        if self.current.len() == MAX_PAGE_SIZE {
            self.queue_page()?;
        }
        Ok(())
    }

    /// Hand the assembled page to the writer. Advancing `head` into `tail`
    /// would overrun unwritten pages, so that is a fatal ring exhaustion.
    fn queue_page(&mut self) -> Result<(), ProbeError> {
        let head = self.shared.head.load(Ordering::Relaxed);
        let next = (head + 1) % RING_PAGES;
        if next == self.shared.tail.load(Ordering::Acquire) {
            return Err(ProbeError::RingExhausted);
        }
        {
            let mut slot = self.shared.slots[head].lock().expect("page slot poisoned");
            slot.bytes.clear();
            slot.bytes.reserve(self.current.len() * 4);
            for value in &self.current {
                slot.bytes.extend_from_slice(&value.to_le_bytes());
            }
            slot.offset = self.file_offset;
        }
        self.file_offset += (self.current.len() * 4) as u64;
        self.current.clear();
        self.shared.head.store(next, Ordering::Release);
        self.shared.ring_doorbell();
        Ok(())
    }

    /// Flush the partial page synchronously and close out the file. Only
    /// valid once the writer thread has drained and stopped.
    pub fn close(self) -> Result<(), ProbeError> {
        if self.shared.queued() != 0 {
            return Err(ProbeError::Invariant(
                "trace file closed with pages still queued".into(),
            ));
        }
        if !self.current.is_empty() {
            let mut bytes = Vec::with_capacity(self.current.len() * 4);
            for value in &self.current {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            self.shared.file.write_all_at(&bytes, self.file_offset)?;
        }
        self.shared.file.sync_all()?;
        if let Some(err) = self.shared.take_error() {
            return Err(ProbeError::Communication(format!("page write failed: {err}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn trace_file() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("energy.bin");
        (dir, path)
    }

    fn read_floats(path: &Path) -> (Vec<u8>, Vec<f32>) {
        let bytes = std::fs::read(path).unwrap();
        let header = bytes[..5].to_vec();
        let floats = bytes[5..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        (header, floats)
    }

    #[test]
    fn header_is_version_then_rate_bits() {
        let (_dir, path) = trace_file();
        let writer = PageWriter::create(&path, 1000).unwrap();
        writer.close().unwrap();
        let (header, floats) = read_floats(&path);
        assert_eq!(header[0], FILE_VERSION);
        assert_eq!(&header[1..5], &1000.0f32.to_le_bytes());
        assert!(floats.is_empty());
    }

    #[test]
    fn partial_page_flushes_on_close() {
        let (_dir, path) = trace_file();
        let mut writer = PageWriter::create(&path, 100).unwrap();
        for n in 0..10 {
            writer.push(n as f32).unwrap();
        }
        writer.close().unwrap();
        let (_, floats) = read_floats(&path);
        assert_eq!(floats, (0..10).map(|n| n as f32).collect::<Vec<_>>());
    }

    #[test]
    fn full_pages_reach_disk_in_order() {
        let (_dir, path) = trace_file();
        let mut writer = PageWriter::create(&path, 100).unwrap();
        let shared = writer.shared();
        let consumer = {
            let shared = shared.clone();
            thread::spawn(move || writer_loop(&shared))
        };
        let total = 2 * MAX_PAGE_SIZE + 17;
        for n in 0..total {
            writer.push(n as f32).unwrap();
        }
        shared.request_stop();
        consumer.join().unwrap();
        writer.close().unwrap();
        let (_, floats) = read_floats(&path);
        assert_eq!(floats.len(), total);
        assert!(floats.iter().enumerate().all(|(n, &v)| v == n as f32));
    }

    #[test]
    fn stalled_writer_exhausts_the_ring() {
        let (_dir, path) = trace_file();
        let mut writer = PageWriter::create(&path, 100).unwrap();
        // No writer thread: the tail never advances. The ring holds
        // RING_PAGES - 1 queued pages before the producer must fail.
        let mut queued = 0;
        let result = loop {
            match (0..MAX_PAGE_SIZE).try_for_each(|_| writer.push(0.5)) {
                Ok(()) => {
                    queued += 1;
                    assert!(queued < RING_PAGES, "exhaustion must fire within one lap");
                }
                Err(err) => break err,
            }
        };
        assert!(matches!(result, ProbeError::RingExhausted));
        assert_eq!(queued, RING_PAGES - 1);
        assert_eq!(result.to_string(), "Ring-buffer exhausted");
        assert_eq!(writer.shared().queued(), RING_PAGES - 1);
    }
}
