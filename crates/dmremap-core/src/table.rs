//! In-memory remap table consulted on every I/O.
//!
//! Slots are indexed by their offset inside the spare pool, so slot `i`
//! always maps to spare sector `pool.start + i`. A secondary index keyed by
//! main sector makes lookups O(1); duplicate detection and capacity checks
//! behave exactly as a linear scan over the slots would.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RemapError, RemapResult};
use crate::sector::{now_secs, IoDirection, SectorRange};

/// Why a sector was remapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemapReason {
    /// Requested by an operator or restored from metadata
    Manual,
    /// Reported by a health monitor
    AutoDetected,
}

/// Health of the main-device sector behind an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Sector is healthy
    Normal,
    /// Sector has been redirected to the spare pool
    Remapped,
}

/// One redirected sector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapEntry {
    /// Sector on the main device
    pub main_sector: u64,
    /// Replacement sector on the spare device
    pub spare_sector: u64,
    /// False when the original data is presumed lost
    pub valid: bool,
    /// I/O errors observed on this sector
    pub error_count: u32,
    /// I/Os routed through this entry
    pub access_count: u32,
    /// Unix seconds of the last recorded error, 0 if none
    pub last_error_time: u64,
    /// Why the entry exists
    pub remap_reason: RemapReason,
    /// Health of the underlying sector
    pub health_status: HealthStatus,
}

impl RemapEntry {
    fn new(main_sector: u64, spare_sector: u64, valid: bool, reason: RemapReason) -> Self {
        Self {
            main_sector,
            spare_sector,
            valid,
            error_count: 0,
            access_count: 0,
            last_error_time: 0,
            remap_reason: reason,
            health_status: HealthStatus::Remapped,
        }
    }

    fn note_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error_time = now_secs();
    }
}

/// A table mutation forwarded to the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableChange {
    /// A new remap was inserted
    Inserted {
        /// Main-device sector
        main_sector: u64,
        /// Assigned spare sector
        spare_sector: u64,
    },
    /// Every remap was dropped
    Cleared,
}

/// Receives table mutations after the table lock has been released.
pub trait ChangeSink: Send + Sync {
    /// Called once per successful mutation.
    fn on_change(&self, change: &TableChange);
}

/// Why a persisted entry could not be placed back into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSkip {
    /// Offset falls outside the table capacity
    OutOfRange,
    /// Another entry already owns the slot
    SlotOccupied,
    /// The main sector is already mapped
    DuplicateMain,
}

/// Summary reported by the status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatus {
    /// Live remaps
    pub remapped: u64,
    /// Remaps whose data is presumed lost
    pub lost: u64,
    /// Spare sectors consumed
    pub spare_used: u64,
    /// Spare pool size
    pub spare_total: u64,
}

impl TableStatus {
    /// Spare pool usage in whole percent.
    pub fn usage_percent(&self) -> u64 {
        if self.spare_total == 0 {
            0
        } else {
            self.spare_used * 100 / self.spare_total
        }
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "remapped={} lost={} spare_used={}/{} ({}%)",
            self.remapped,
            self.lost,
            self.spare_used,
            self.spare_total,
            self.usage_percent()
        )
    }
}

#[derive(Debug, Default)]
struct TableInner {
    slots: BTreeMap<u64, RemapEntry>,
    by_main: HashMap<u64, u64>,
    spare_used: u64,
    next_free: u64,
}

impl TableInner {
    fn check_room(&self, capacity: u64) -> RemapResult<()> {
        if self.slots.len() as u64 >= capacity || self.spare_used >= capacity {
            return Err(RemapError::TableFull { capacity });
        }
        Ok(())
    }

    fn free_offset(&self, capacity: u64) -> Option<u64> {
        (self.next_free..capacity)
            .chain(0..self.next_free.min(capacity))
            .find(|off| !self.slots.contains_key(off))
    }

    fn place(&mut self, offset: u64, entry: RemapEntry) {
        self.by_main.insert(entry.main_sector, offset);
        self.slots.insert(offset, entry);
    }

    fn entry_mut(&mut self, main_sector: u64) -> Option<&mut RemapEntry> {
        let offset = *self.by_main.get(&main_sector)?;
        self.slots.get_mut(&offset)
    }
}

/// Fixed-capacity map from main sectors to spare-pool sectors.
pub struct RemapTable {
    pool: SectorRange,
    inner: Mutex<TableInner>,
    sink: RwLock<Option<Arc<dyn ChangeSink>>>,
}

impl RemapTable {
    /// Creates an empty table whose capacity is the spare pool size.
    pub fn new(pool: SectorRange) -> Self {
        debug!(pool = %pool, capacity = pool.len, "remap table created");
        Self {
            pool,
            inner: Mutex::new(TableInner::default()),
            sink: RwLock::new(None),
        }
    }

    /// Installs the persistence hook.
    pub fn set_sink(&self, sink: Arc<dyn ChangeSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Removes the persistence hook.
    pub fn clear_sink(&self) {
        *self.sink.write() = None;
    }

    fn notify(&self, change: TableChange) {
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_change(&change);
        }
    }

    /// Returns a copy of the entry for `sector`.
    pub fn lookup(&self, sector: u64) -> Option<RemapEntry> {
        let inner = self.inner.lock();
        let offset = inner.by_main.get(&sector)?;
        inner.slots.get(offset).cloned()
    }

    /// Remaps `main_sector` onto the next free spare sector.
    ///
    /// The new entry starts with `valid = false`. Returns the spare sector.
    pub fn remap(&self, main_sector: u64, reason: RemapReason) -> RemapResult<u64> {
        let capacity = self.capacity();
        let spare_sector = {
            let mut inner = self.inner.lock();
            if inner.by_main.contains_key(&main_sector) {
                return Err(RemapError::AlreadyRemapped { main_sector });
            }
            inner.check_room(capacity)?;
            let offset = inner
                .free_offset(capacity)
                .ok_or(RemapError::TableFull { capacity })?;
            let spare_sector = self.pool.start + offset;
            inner.place(offset, RemapEntry::new(main_sector, spare_sector, false, reason));
            inner.spare_used += 1;
            inner.next_free = offset + 1;
            spare_sector
        };
        debug!(main_sector, spare_sector, ?reason, "sector remapped");
        self.notify(TableChange::Inserted {
            main_sector,
            spare_sector,
        });
        Ok(spare_sector)
    }

    /// Inserts a precomputed mapping.
    ///
    /// `spare_sector` must lie inside the spare pool. Does not count towards
    /// `spare_used`.
    pub fn load(&self, main_sector: u64, spare_sector: u64, valid: bool) -> RemapResult<()> {
        let capacity = self.capacity();
        let offset = self
            .pool
            .offset_of(spare_sector)
            .ok_or(RemapError::InvalidSpareSector {
                spare_sector,
                pool_start: self.pool.start,
                pool_end: self.pool.end(),
            })?;
        {
            let mut inner = self.inner.lock();
            if inner.by_main.contains_key(&main_sector) {
                return Err(RemapError::AlreadyRemapped { main_sector });
            }
            if inner.slots.contains_key(&offset) {
                return Err(RemapError::SpareInUse { spare_sector });
            }
            inner.check_room(capacity)?;
            inner.place(
                offset,
                RemapEntry::new(main_sector, spare_sector, valid, RemapReason::Manual),
            );
        }
        debug!(main_sector, spare_sector, valid, "remap loaded");
        self.notify(TableChange::Inserted {
            main_sector,
            spare_sector,
        });
        Ok(())
    }

    /// Drops every entry and resets `spare_used`.
    pub fn clear(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            let dropped = inner.slots.len();
            *inner = TableInner::default();
            dropped
        };
        info!(dropped, "remap table cleared");
        self.notify(TableChange::Cleared);
    }

    /// Looks up `sector` for an I/O and updates the entry counters.
    ///
    /// A read of a lost sector counts as an error on that entry.
    pub fn touch(&self, sector: u64, direction: IoDirection) -> Option<RemapEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(sector)?;
        entry.access_count = entry.access_count.saturating_add(1);
        if !direction.is_write() && !entry.valid {
            entry.note_error();
        }
        Some(entry.clone())
    }

    /// Lowest remapped main sector inside `range`, if any.
    pub fn first_remapped_in(&self, range: SectorRange) -> Option<u64> {
        let inner = self.inner.lock();
        if range.len <= inner.by_main.len() as u64 {
            (range.start..range.end()).find(|s| inner.by_main.contains_key(s))
        } else {
            inner
                .by_main
                .keys()
                .copied()
                .filter(|s| range.contains(*s))
                .min()
        }
    }

    /// Records a failed I/O completion on a remapped sector.
    ///
    /// Returns false if `sector` is not remapped.
    pub fn record_io_error(&self, sector: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.entry_mut(sector) {
            Some(entry) => {
                entry.note_error();
                true
            }
            None => false,
        }
    }

    /// Places a persisted entry at pool offset `offset` without notifying
    /// the persistence hook. The entry comes back valid with zeroed counters.
    pub fn restore_entry(&self, main_sector: u64, offset: u64) -> Result<u64, RestoreSkip> {
        if offset >= self.capacity() {
            return Err(RestoreSkip::OutOfRange);
        }
        let mut inner = self.inner.lock();
        if inner.slots.contains_key(&offset) {
            return Err(RestoreSkip::SlotOccupied);
        }
        if inner.by_main.contains_key(&main_sector) {
            return Err(RestoreSkip::DuplicateMain);
        }
        let spare_sector = self.pool.start + offset;
        inner.place(
            offset,
            RemapEntry::new(main_sector, spare_sector, true, RemapReason::Manual),
        );
        Ok(spare_sector)
    }

    /// Overrides the spare usage counter, capped at capacity.
    pub fn set_spare_used(&self, spare_used: u64) {
        self.inner.lock().spare_used = spare_used.min(self.capacity());
    }

    /// Copies of all live entries in spare-pool order.
    pub fn snapshot(&self) -> Vec<RemapEntry> {
        self.inner.lock().slots.values().cloned().collect()
    }

    /// Live `(main_sector, spare_sector)` pairs in spare-pool order.
    pub fn pairs(&self) -> Vec<(u64, u64)> {
        self.inner
            .lock()
            .slots
            .values()
            .map(|e| (e.main_sector, e.spare_sector))
            .collect()
    }

    /// Number of live entries.
    pub fn count(&self) -> u64 {
        self.inner.lock().slots.len() as u64
    }

    /// Spare sectors consumed by fresh allocations.
    pub fn spare_used(&self) -> u64 {
        self.inner.lock().spare_used
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> u64 {
        self.pool.len
    }

    /// The spare pool backing this table.
    pub fn pool(&self) -> SectorRange {
        self.pool
    }

    /// Entries whose data is presumed lost.
    pub fn lost_count(&self) -> u64 {
        self.inner.lock().slots.values().filter(|e| !e.valid).count() as u64
    }

    /// Returns true if no further entry can be inserted.
    pub fn is_full(&self) -> bool {
        self.inner.lock().check_room(self.capacity()).is_err()
    }

    /// Snapshot for the status query.
    pub fn status(&self) -> TableStatus {
        let inner = self.inner.lock();
        TableStatus {
            remapped: inner.slots.len() as u64,
            lost: inner.slots.values().filter(|e| !e.valid).count() as u64,
            spare_used: inner.spare_used,
            spare_total: self.pool.len,
        }
    }
}

impl fmt::Debug for RemapTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemapTable")
            .field("pool", &self.pool)
            .field("status", &self.status())
            .finish()
    }
}
