//! Persistent metadata store for the remap table.
//!
//! The store keeps an in-memory mirror of the on-disk header and entry array.
//! All mirror mutations happen under one `parking_lot` mutex; device transfers
//! are serialized by a separate async lock and run on the blocking pool so
//! that no caller ever holds the mirror lock across I/O.
//!
//! Writes are two-phase: the header is first written with state `Writing`,
//! then the entries, then the header again with state `Clean`. A header found
//! in state `Writing` at read time means the previous write was torn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::autosave::SaveSignal;
use crate::block_io::{read_pages, write_pages, DeviceHandle, IoGate};
use crate::checksum::verify_metadata;
use crate::config::MetadataConfig;
use crate::error::{RemapError, RemapResult};
use crate::layout::{
    decode_entries, encode_entries, encode_entry_pages, entry_pages, MetadataEntry,
    MetadataHeader, MetadataState, ENTRIES_SECTOR, ENTRY_REGION_PAGES, HEADER_SECTOR,
    MAX_ENTRIES_ON_DISK, METADATA_MAGIC, METADATA_SECTORS, METADATA_VERSION,
};
use crate::sector::{PAGE_SIZE, SENTINEL_SECTOR};
use crate::table::{ChangeSink, TableChange};

/// Counters exposed for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataStats {
    /// Successful reads
    pub reads: u64,
    /// Successful writes
    pub writes: u64,
    /// Reads that failed at the device
    pub read_errors: u64,
    /// Writes that failed at the device
    pub write_errors: u64,
    /// Reads rejected by the checksum
    pub checksum_errors: u64,
    /// Reads rejected for magic, version, bounds or torn state
    pub integrity_errors: u64,
    /// Writes currently in flight
    pub pending_writes: u64,
    /// Destructive recoveries performed
    pub recoveries: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    checksum_errors: AtomicU64,
    integrity_errors: AtomicU64,
    pending_writes: AtomicU64,
    recoveries: AtomicU64,
}

struct StoreInner {
    header: MetadataHeader,
    entries: Vec<MetadataEntry>,
    dirty: bool,
}

impl StoreInner {
    /// Recomputes the header checksum after a mutation.
    fn seal(&mut self) {
        let StoreInner {
            header, entries, ..
        } = self;
        header.update_checksum(entries);
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        if self.header.state != MetadataState::Writing {
            self.header.state = MetadataState::Dirty;
        }
        self.seal();
    }

    /// Marks the mirror as failed to persist; it stays dirty for a retry.
    fn fail(&mut self) {
        self.header.state = MetadataState::Error;
        self.dirty = true;
        self.seal();
    }
}

/// In-memory mirror of the spare device's metadata region.
pub struct MetadataStore {
    device: DeviceHandle,
    config: MetadataConfig,
    inner: Mutex<StoreInner>,
    io_gate: AsyncMutex<IoGate>,
    signal: Mutex<Option<SaveSignal>>,
    counters: Counters,
}

impl MetadataStore {
    /// Creates a store with a fresh clean header at generation 0.
    pub fn create(
        device: DeviceHandle,
        main_sectors: u64,
        spare_sectors: u64,
        config: MetadataConfig,
    ) -> RemapResult<Self> {
        if device.size_sectors() < METADATA_SECTORS {
            return Err(RemapError::InvalidConfig {
                reason: format!(
                    "spare device has {} sectors, metadata needs {}",
                    device.size_sectors(),
                    METADATA_SECTORS
                ),
            });
        }

        let max_entries = config
            .max_entries
            .unwrap_or(MAX_ENTRIES_ON_DISK)
            .min(MAX_ENTRIES_ON_DISK);
        let mut inner = StoreInner {
            header: MetadataHeader::new(main_sectors, spare_sectors, max_entries),
            entries: Vec::with_capacity(max_entries as usize),
            dirty: false,
        };
        inner.seal();

        info!(
            main_sectors,
            spare_sectors, max_entries, "metadata store created"
        );
        Ok(Self {
            device,
            config,
            inner: Mutex::new(inner),
            io_gate: AsyncMutex::new(IoGate::new()),
            signal: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.config.io_timeout_ms)
    }

    /// Connects the store to the auto-save scheduler's trigger.
    pub fn attach_signal(&self, signal: SaveSignal) {
        *self.signal.lock() = Some(signal);
    }

    /// Disconnects the auto-save trigger.
    pub fn detach_signal(&self) {
        *self.signal.lock() = None;
    }

    fn request_save(&self) {
        if let Some(signal) = self.signal.lock().as_ref() {
            signal.request_soon();
        }
    }

    /// Reads and validates the metadata region, replacing the mirror on success.
    ///
    /// On failure the mirror is left untouched; only counters change.
    pub async fn read(&self) -> RemapResult<()> {
        let mut gate = self.io_gate.lock().await;

        let dev = self.device.clone();
        let page = gate
            .run("read", self.io_timeout(), move || {
                read_pages(dev.as_ref(), HEADER_SECTOR, 1)
            })
            .await
        .inspect_err(|e| {
            self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "metadata header read failed");
        })?;

        let header = MetadataHeader::decode(&page).inspect_err(|e| {
            self.counters.integrity_errors.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "metadata header rejected");
        })?;

        if header.state == MetadataState::Writing {
            self.counters.integrity_errors.fetch_add(1, Ordering::Relaxed);
            warn!(generation = header.generation, "metadata header left in writing state");
            return Err(RemapError::TornWrite {
                generation: header.generation,
            });
        }

        let count = header.entry_count as usize;
        let entries = if count > 0 {
            let dev = self.device.clone();
            let pages = entry_pages(count);
            let raw = gate
                .run("read", self.io_timeout(), move || {
                    read_pages(dev.as_ref(), ENTRIES_SECTOR, pages)
                })
                .await
            .inspect_err(|_| {
                self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
            })?;
            decode_entries(&raw, count)
        } else {
            Vec::new()
        };

        if let Err(actual) = verify_metadata(header.checksum, &page, &encode_entries(&entries)) {
            self.counters.checksum_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                stored = header.checksum,
                computed = actual,
                "metadata checksum mismatch"
            );
            return Err(RemapError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        let mut inner = self.inner.lock();
        if header.main_sectors != inner.header.main_sectors
            || header.spare_sectors != inner.header.spare_sectors
        {
            warn!(
                disk_main = header.main_sectors,
                disk_spare = header.spare_sectors,
                main = inner.header.main_sectors,
                spare = inner.header.spare_sectors,
                "metadata device sizes differ from the attached devices"
            );
        }
        info!(
            entries = header.entry_count,
            generation = header.generation,
            "metadata read"
        );
        inner.header = header;
        inner.entries = entries;
        inner.dirty = false;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Persists the mirror with the two-phase header protocol.
    ///
    /// A write that times out leaves the store dirty and in state `Error`;
    /// the next device operation waits for the abandoned transfer to finish.
    pub async fn write(&self) -> RemapResult<()> {
        let mut gate = self.io_gate.lock().await;
        self.write_locked(&mut gate).await
    }

    async fn write_locked(&self, gate: &mut IoGate) -> RemapResult<()> {
        self.counters.pending_writes.fetch_add(1, Ordering::Relaxed);

        let (writing_page, entry_bytes, clean_header, generation) = {
            let mut inner = self.inner.lock();
            inner.header.touch();
            inner.header.state = MetadataState::Writing;
            inner.seal();

            let writing_page = inner.header.encode();
            let entry_bytes = encode_entry_pages(&inner.entries);
            let mut clean = inner.header.clone();
            clean.state = MetadataState::Clean;
            clean.update_checksum(&inner.entries);
            (writing_page, entry_bytes, clean, inner.header.generation)
        };

        let dev = self.device.clone();
        let clean_page = clean_header.encode();
        let result = gate
            .run("write", self.io_timeout(), move || {
                write_pages(dev.as_ref(), HEADER_SECTOR, &writing_page)?;
                if !entry_bytes.is_empty() {
                    write_pages(dev.as_ref(), ENTRIES_SECTOR, &entry_bytes)?;
                }
                dev.flush()?;
                write_pages(dev.as_ref(), HEADER_SECTOR, &clean_page)?;
                dev.flush()
            })
            .await;

        self.counters.pending_writes.fetch_sub(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match result {
            Ok(()) => {
                if inner.header.generation == generation {
                    inner.header = clean_header;
                    inner.dirty = false;
                } else {
                    // Mutated while the write was in flight; stay dirty.
                    inner.header.state = MetadataState::Dirty;
                    inner.seal();
                }
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                debug!(generation, "metadata written");
                Ok(())
            }
            Err(e) => {
                inner.fail();
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                error!(generation, error = %e, "metadata write failed");
                Err(e)
            }
        }
    }

    /// Writes only if the mirror has unpersisted changes.
    pub async fn sync(&self) -> RemapResult<()> {
        if !self.is_dirty() {
            debug!("metadata clean, sync skipped");
            return Ok(());
        }
        self.write().await
    }

    /// Checks magic, version, bounds and checksum of the mirror.
    pub fn validate(&self) -> bool {
        let inner = self.inner.lock();
        let header = &inner.header;
        if header.magic != METADATA_MAGIC || header.version != METADATA_VERSION {
            return false;
        }
        if header.check_bounds().is_err() || header.entry_count as usize != inner.entries.len() {
            return false;
        }
        header.compute_checksum(&inner.entries) == header.checksum
    }

    /// Discards all persisted remaps and writes a fresh clean header.
    ///
    /// The generation advances by one; the lifetime remap counter is kept.
    pub async fn recover(&self) -> RemapResult<()> {
        let mut gate = self.io_gate.lock().await;

        let generation = {
            let mut inner = self.inner.lock();
            let old = &inner.header;
            let mut fresh =
                MetadataHeader::new(old.main_sectors, old.spare_sectors, old.max_entries);
            fresh.generation = old.generation.wrapping_add(1);
            fresh.lifetime_remaps = old.lifetime_remaps;
            inner.header = fresh;
            inner.entries.clear();
            inner.mark_dirty();
            inner.header.generation
        };
        self.counters.recoveries.fetch_add(1, Ordering::Relaxed);
        warn!(generation, "metadata recovery: discarding persisted remaps");

        let dev = self.device.clone();
        let zeros = vec![0u8; ENTRY_REGION_PAGES * PAGE_SIZE];
        if let Err(e) = gate
            .run("write", self.io_timeout(), move || {
                write_pages(dev.as_ref(), ENTRIES_SECTOR, &zeros)
            })
            .await
        {
            self.inner.lock().fail();
            self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
            error!(generation, error = %e, "clearing persisted entries failed");
            return Err(e);
        }

        self.write_locked(&mut gate).await
    }

    /// Appends a persisted remap and requests a deferred save.
    pub fn add_entry(&self, main_sector: u64, spare_sector: u64) -> RemapResult<()> {
        {
            let mut inner = self.inner.lock();
            inner.header.check_bounds()?;
            if main_sector == SENTINEL_SECTOR || inner.entries.len() != inner.header.entry_count as usize {
                return Err(RemapError::Corrupt {
                    reason: format!(
                        "cannot add entry {} -> {} (entries {}, header count {})",
                        main_sector,
                        spare_sector,
                        inner.entries.len(),
                        inner.header.entry_count
                    ),
                });
            }
            for entry in &inner.entries {
                if entry.main_sector == main_sector {
                    return Err(RemapError::AlreadyRemapped { main_sector });
                }
                if entry.spare_sector == spare_sector {
                    return Err(RemapError::SpareInUse { spare_sector });
                }
            }
            if inner.header.entry_count >= inner.header.max_entries {
                return Err(RemapError::MetadataFull {
                    max_entries: inner.header.max_entries,
                });
            }

            inner.entries.push(MetadataEntry::new(main_sector, spare_sector));
            inner.header.entry_count += 1;
            inner.header.generation = inner.header.generation.wrapping_add(1);
            inner.header.lifetime_remaps += 1;
            inner.mark_dirty();
            debug!(
                main_sector,
                spare_sector,
                entries = inner.header.entry_count,
                "metadata entry added"
            );
        }
        self.request_save();
        Ok(())
    }

    /// Returns the spare sector persisted for `main_sector`.
    pub fn find_entry(&self, main_sector: u64) -> Option<u64> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|e| e.main_sector == main_sector)
            .map(|e| e.spare_sector)
    }

    /// Drops every entry and requests a deferred save.
    pub fn clear_entries(&self) {
        {
            let mut inner = self.inner.lock();
            inner.entries.clear();
            inner.header.entry_count = 0;
            inner.header.generation = inner.header.generation.wrapping_add(1);
            inner.mark_dirty();
        }
        info!("metadata entries cleared");
        self.request_save();
    }

    /// Replaces the entry array, keeping at most `max_entries`.
    ///
    /// Returns the number of entries stored. Does not request a save; callers
    /// that replace entries force one themselves.
    pub fn replace_entries(&self, entries: &[MetadataEntry]) -> usize {
        let mut inner = self.inner.lock();
        let max = inner.header.max_entries as usize;
        let kept = entries.len().min(max);
        if kept < entries.len() {
            warn!(
                table_entries = entries.len(),
                max_entries = max,
                "metadata capacity smaller than table, truncating"
            );
        }
        inner.entries.clear();
        inner.entries.extend_from_slice(&entries[..kept]);
        inner.header.entry_count = kept as u32;
        inner.header.generation = inner.header.generation.wrapping_add(1);
        inner.mark_dirty();
        kept
    }

    /// Marks the mirror dirty without changing any entry.
    pub fn mark_dirty(&self) {
        self.inner.lock().mark_dirty();
    }

    /// Returns true if the mirror has unpersisted changes.
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Current in-memory state.
    pub fn state(&self) -> MetadataState {
        self.inner.lock().header.state
    }

    /// Snapshot of the in-memory header.
    pub fn header(&self) -> MetadataHeader {
        self.inner.lock().header.clone()
    }

    /// Snapshot of the live entries.
    pub fn entries(&self) -> Vec<MetadataEntry> {
        self.inner.lock().entries.clone()
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> u32 {
        self.inner.lock().header.entry_count
    }

    /// Generation counter of the mirror.
    pub fn generation(&self) -> u32 {
        self.inner.lock().header.generation
    }

    /// The device this store persists to.
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Operator-visible counters.
    pub fn stats(&self) -> MetadataStats {
        let c = &self.counters;
        MetadataStats {
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            read_errors: c.read_errors.load(Ordering::Relaxed),
            write_errors: c.write_errors.load(Ordering::Relaxed),
            checksum_errors: c.checksum_errors.load(Ordering::Relaxed),
            integrity_errors: c.integrity_errors.load(Ordering::Relaxed),
            pending_writes: c.pending_writes.load(Ordering::Relaxed),
            recoveries: c.recoveries.load(Ordering::Relaxed),
        }
    }
}

impl ChangeSink for MetadataStore {
    fn on_change(&self, change: &TableChange) {
        match *change {
            TableChange::Inserted {
                main_sector,
                spare_sector,
            } => {
                if let Err(e) = self.add_entry(main_sector, spare_sector) {
                    warn!(main_sector, spare_sector, error = %e, "remap not mirrored to metadata");
                }
            }
            TableChange::Cleared => self.clear_entries(),
        }
    }
}
