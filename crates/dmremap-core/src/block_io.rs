//! Synchronous block I/O adapter used by the metadata layer.
//!
//! This module provides the blocking page-sized transfer primitive ([`BlockDevice`])
//! with an in-memory implementation for tests and a file-backed one for real
//! devices, plus the async boundary ([`IoGate`]) that moves each transfer
//! onto tokio's blocking pool under a timeout.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{RemapError, RemapResult};
use crate::sector::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

/// Block I/O statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoStats {
    /// Page reads completed
    pub reads_completed: u64,
    /// Page writes completed
    pub writes_completed: u64,
    /// Flushes completed
    pub flushes_completed: u64,
    /// Failed transfers
    pub errors: u64,
}

/// A device that supports blocking, sector-addressed, page-sized transfers.
///
/// The metadata layer never opens or closes devices; a handle implementing
/// this trait is injected by the surrounding system.
pub trait BlockDevice: Send + Sync {
    /// Reads one page starting at `sector` into `buf` (`PAGE_SIZE` bytes).
    fn read_page(&self, sector: u64, buf: &mut [u8]) -> RemapResult<()>;

    /// Writes one page from `buf` (`PAGE_SIZE` bytes) starting at `sector`.
    fn write_page(&self, sector: u64, buf: &[u8]) -> RemapResult<()>;

    /// Makes previous writes durable.
    fn flush(&self) -> RemapResult<()>;

    /// Device size in sectors.
    fn size_sectors(&self) -> u64;

    /// Current I/O statistics.
    fn stats(&self) -> IoStats;
}

fn check_page(sector: u64, len: usize, size_sectors: u64) -> RemapResult<()> {
    if len != PAGE_SIZE {
        return Err(RemapError::ShortBuffer {
            expected: PAGE_SIZE,
            actual: len,
        });
    }
    if sector.saturating_add(SECTORS_PER_PAGE) > size_sectors {
        return Err(RemapError::DeviceIo {
            sector,
            reason: format!("page beyond device end ({} sectors)", size_sectors),
        });
    }
    Ok(())
}

/// Reads `pages` consecutive pages starting at `sector`.
pub fn read_pages(dev: &dyn BlockDevice, sector: u64, pages: usize) -> RemapResult<Vec<u8>> {
    let mut data = vec![0u8; pages * PAGE_SIZE];
    for (i, chunk) in data.chunks_mut(PAGE_SIZE).enumerate() {
        dev.read_page(sector + i as u64 * SECTORS_PER_PAGE, chunk)?;
    }
    Ok(data)
}

/// Writes `data` (a whole number of pages) starting at `sector`.
pub fn write_pages(dev: &dyn BlockDevice, sector: u64, data: &[u8]) -> RemapResult<()> {
    if data.len() % PAGE_SIZE != 0 {
        return Err(RemapError::ShortBuffer {
            expected: data.len().div_ceil(PAGE_SIZE) * PAGE_SIZE,
            actual: data.len(),
        });
    }
    for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
        dev.write_page(sector + i as u64 * SECTORS_PER_PAGE, chunk)?;
    }
    Ok(())
}

/// Serializes blocking device transfers and tracks one that outlived its timeout.
///
/// A timed-out transfer keeps running on the blocking pool. Its handle is kept
/// here and every later transfer waits for it first, so two transfers never
/// touch the device at once.
#[derive(Debug, Default)]
pub struct IoGate {
    straggler: Option<JoinHandle<()>>,
}

impl IoGate {
    /// Creates a gate with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a timed-out transfer may still be touching the device.
    pub fn has_straggler(&self) -> bool {
        self.straggler.as_ref().is_some_and(|h| !h.is_finished())
    }

    async fn settle(&mut self, op: &'static str, timeout: Duration) -> RemapResult<()> {
        let Some(handle) = self.straggler.as_mut() else {
            return Ok(());
        };
        if tokio::time::timeout(timeout, handle).await.is_err() {
            warn!(op, "previous metadata transfer still running");
            return Err(RemapError::IoTimeout {
                op,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        self.straggler = None;
        debug!(op, "timed-out metadata transfer finished");
        Ok(())
    }

    /// Runs `f` on the blocking pool, bounded by `timeout`.
    ///
    /// Waits for any earlier timed-out transfer first, within the same bound.
    pub async fn run<T, F>(&mut self, op: &'static str, timeout: Duration, f: F) -> RemapResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> RemapResult<T> + Send + 'static,
    {
        self.settle(op, timeout).await?;

        let (tx, mut rx) = oneshot::channel();
        let mut handle = tokio::task::spawn_blocking(move || {
            let _ = tx.send(f());
        });
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => rx.try_recv().unwrap_or_else(|_| {
                Err(RemapError::DeviceIo {
                    sector: 0,
                    reason: format!("{} task dropped its result", op),
                })
            }),
            Ok(Err(join_err)) => Err(RemapError::DeviceIo {
                sector: 0,
                reason: format!("{} task failed: {}", op, join_err),
            }),
            Err(_) => {
                error!(op, timeout_ms = timeout.as_millis() as u64, "metadata I/O timed out");
                self.straggler = Some(handle);
                Err(RemapError::IoTimeout {
                    op,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// In-memory block device for testing.
///
/// Unwritten sectors read back as zeros. Reads and writes can be made to fail
/// or stall to exercise the metadata error paths.
pub struct MemBlockDevice {
    data: Mutex<Vec<u8>>,
    size_sectors: u64,
    stats: Mutex<IoStats>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes_before_failure: AtomicU64,
    delay_ms: AtomicU64,
}

impl MemBlockDevice {
    /// Creates a zero-filled device of `size_sectors` sectors.
    pub fn new(size_sectors: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; (size_sectors * SECTOR_SIZE) as usize]),
            size_sectors,
            stats: Mutex::new(IoStats::default()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            writes_before_failure: AtomicU64::new(u64::MAX),
            delay_ms: AtomicU64::new(0),
        }
    }

    /// Makes every subsequent read fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Lets `n` more page writes succeed, then fails the rest.
    pub fn fail_writes_after(&self, n: u64) {
        self.writes_before_failure.store(n, Ordering::SeqCst);
    }

    /// Delays every transfer by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Copies `len` raw bytes starting at byte `offset`.
    pub fn raw_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.lock()[offset..offset + len].to_vec()
    }

    /// XORs the byte at `offset` with `mask`.
    pub fn corrupt_byte(&self, offset: usize, mask: u8) {
        self.data.lock()[offset] ^= mask;
    }

    fn stall(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }

    fn record_error(&self) {
        self.stats.lock().errors += 1;
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_page(&self, sector: u64, buf: &mut [u8]) -> RemapResult<()> {
        check_page(sector, buf.len(), self.size_sectors)?;
        self.stall();
        if self.fail_reads.load(Ordering::SeqCst) {
            self.record_error();
            return Err(RemapError::DeviceIo {
                sector,
                reason: "injected read failure".to_string(),
            });
        }
        let start = (sector * SECTOR_SIZE) as usize;
        buf.copy_from_slice(&self.data.lock()[start..start + PAGE_SIZE]);
        self.stats.lock().reads_completed += 1;
        debug!(sector, "mem read page");
        Ok(())
    }

    fn write_page(&self, sector: u64, buf: &[u8]) -> RemapResult<()> {
        check_page(sector, buf.len(), self.size_sectors)?;
        self.stall();
        let budget_exhausted = self
            .writes_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == u64::MAX {
                    Some(n)
                } else {
                    n.checked_sub(1)
                }
            })
            .is_err();
        if self.fail_writes.load(Ordering::SeqCst) || budget_exhausted {
            self.record_error();
            return Err(RemapError::DeviceIo {
                sector,
                reason: "injected write failure".to_string(),
            });
        }
        let start = (sector * SECTOR_SIZE) as usize;
        self.data.lock()[start..start + PAGE_SIZE].copy_from_slice(buf);
        self.stats.lock().writes_completed += 1;
        debug!(sector, "mem write page");
        Ok(())
    }

    fn flush(&self) -> RemapResult<()> {
        self.stats.lock().flushes_completed += 1;
        Ok(())
    }

    fn size_sectors(&self) -> u64 {
        self.size_sectors
    }

    fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }
}

/// Block device backed by a regular file or block special file.
pub struct FileBlockDevice {
    file: File,
    size_sectors: u64,
    stats: Mutex<IoStats>,
}

impl FileBlockDevice {
    /// Opens `path` for reading and writing; size is taken from its length.
    pub fn open(path: &Path) -> RemapResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size_sectors = file.metadata()?.len() / SECTOR_SIZE;
        debug!(path = %path.display(), size_sectors, "opened file block device");
        Ok(Self {
            file,
            size_sectors,
            stats: Mutex::new(IoStats::default()),
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_page(&self, sector: u64, buf: &mut [u8]) -> RemapResult<()> {
        check_page(sector, buf.len(), self.size_sectors)?;
        match self.file.read_exact_at(buf, sector * SECTOR_SIZE) {
            Ok(()) => {
                self.stats.lock().reads_completed += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.lock().errors += 1;
                Err(e.into())
            }
        }
    }

    fn write_page(&self, sector: u64, buf: &[u8]) -> RemapResult<()> {
        check_page(sector, buf.len(), self.size_sectors)?;
        match self.file.write_all_at(buf, sector * SECTOR_SIZE) {
            Ok(()) => {
                self.stats.lock().writes_completed += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.lock().errors += 1;
                Err(e.into())
            }
        }
    }

    fn flush(&self) -> RemapResult<()> {
        self.file.sync_data()?;
        self.stats.lock().flushes_completed += 1;
        Ok(())
    }

    fn size_sectors(&self) -> u64 {
        self.size_sectors
    }

    fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }
}

/// Shared handle type used by the metadata layer.
pub type DeviceHandle = Arc<dyn BlockDevice>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_write_read_roundtrip() {
        let dev = MemBlockDevice::new(64);
        let data = vec![0xAB; PAGE_SIZE];
        dev.write_page(8, &data).unwrap();

        let mut out = vec![0u8; PAGE_SIZE];
        dev.read_page(8, &mut out).unwrap();
        assert_eq!(out, data);

        let stats = dev.stats();
        assert_eq!(stats.writes_completed, 1);
        assert_eq!(stats.reads_completed, 1);
    }

    #[test]
    fn test_mem_unwritten_reads_zero() {
        let dev = MemBlockDevice::new(16);
        let mut out = vec![0xFFu8; PAGE_SIZE];
        dev.read_page(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_wrong_buffer_size() {
        let dev = MemBlockDevice::new(16);
        let result = dev.write_page(0, &[0u8; 100]);
        assert!(matches!(result, Err(RemapError::ShortBuffer { .. })));
    }

    #[test]
    fn test_page_beyond_end() {
        let dev = MemBlockDevice::new(16);
        let mut out = vec![0u8; PAGE_SIZE];
        assert!(dev.read_page(9, &mut out).is_err());
        assert!(dev.read_page(8, &mut out).is_ok());
    }

    #[test]
    fn test_injected_failures() {
        let dev = MemBlockDevice::new(64);
        let page = vec![1u8; PAGE_SIZE];
        dev.fail_writes_after(1);
        assert!(dev.write_page(0, &page).is_ok());
        assert!(dev.write_page(8, &page).is_err());
        assert_eq!(dev.stats().errors, 1);

        dev.set_fail_reads(true);
        let mut out = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            dev.read_page(0, &mut out),
            Err(RemapError::DeviceIo { sector: 0, .. })
        ));
    }

    #[test]
    fn test_multi_page_helpers() {
        let dev = MemBlockDevice::new(64);
        let mut data = vec![0u8; 2 * PAGE_SIZE];
        data[PAGE_SIZE] = 9;
        write_pages(&dev, 8, &data).unwrap();
        let back = read_pages(&dev, 8, 2).unwrap();
        assert_eq!(back, data);
        assert_eq!(dev.raw_bytes(16 * SECTOR_SIZE as usize, 1), vec![9]);
    }

    #[test]
    fn test_file_device_roundtrip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(64 * SECTOR_SIZE).unwrap();
        let dev = FileBlockDevice::open(tmp.path()).unwrap();
        assert_eq!(dev.size_sectors(), 64);

        let data = vec![0x5A; PAGE_SIZE];
        dev.write_page(16, &data).unwrap();
        dev.flush().unwrap();

        let mut out = vec![0u8; PAGE_SIZE];
        dev.read_page(16, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(dev.stats().flushes_completed, 1);
    }

    #[tokio::test]
    async fn test_gate_timeout() {
        let fast: DeviceHandle = Arc::new(MemBlockDevice::new(16));
        let mem = MemBlockDevice::new(16);
        mem.set_delay(Duration::from_millis(200));
        let slow: DeviceHandle = Arc::new(mem);
        let mut gate = IoGate::new();

        let ok = gate
            .run("read", Duration::from_secs(5), move || read_pages(fast.as_ref(), 0, 1))
            .await;
        assert!(ok.is_ok());
        assert!(!gate.has_straggler());

        let err = gate
            .run("read", Duration::from_millis(20), move || read_pages(slow.as_ref(), 0, 1))
            .await;
        assert!(matches!(err, Err(RemapError::IoTimeout { op: "read", .. })));
        assert!(gate.has_straggler());
    }

    #[tokio::test]
    async fn test_gate_waits_for_timed_out_transfer() {
        let mem = Arc::new(MemBlockDevice::new(16));
        mem.set_delay(Duration::from_millis(100));
        let mut gate = IoGate::new();

        let dev = mem.clone();
        let err = gate
            .run("write", Duration::from_millis(20), move || {
                write_pages(dev.as_ref(), 0, &vec![1u8; PAGE_SIZE])
            })
            .await;
        assert!(matches!(err, Err(RemapError::IoTimeout { .. })));

        // The next transfer only starts once the first has landed.
        mem.set_delay(Duration::ZERO);
        let dev = mem.clone();
        gate.run("write", Duration::from_secs(5), move || {
            write_pages(dev.as_ref(), 0, &vec![2u8; PAGE_SIZE])
        })
        .await
        .unwrap();
        assert!(!gate.has_straggler());
        assert_eq!(mem.raw_bytes(0, 1), vec![2]);
        assert_eq!(mem.stats().writes_completed, 2);
    }

    #[tokio::test]
    async fn test_gate_straggler_outlasting_timeout() {
        let mem = Arc::new(MemBlockDevice::new(16));
        mem.set_delay(Duration::from_millis(300));
        let mut gate = IoGate::new();

        let dev = mem.clone();
        let _ = gate
            .run("read", Duration::from_millis(20), move || read_pages(dev.as_ref(), 0, 1))
            .await;
        let dev = mem.clone();
        let err = gate
            .run("read", Duration::from_millis(20), move || read_pages(dev.as_ref(), 0, 1))
            .await;
        assert!(matches!(err, Err(RemapError::IoTimeout { .. })));
        assert_eq!(mem.stats().reads_completed, 0);
    }
}
