//! Core sector types shared by the table, router and metadata layers.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Logical sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;
/// Page size used for every metadata transfer.
pub const PAGE_SIZE: usize = 4096;
/// Number of sectors covered by one page.
pub const SECTORS_PER_PAGE: u64 = PAGE_SIZE as u64 / SECTOR_SIZE;

/// Marker for an unused on-disk entry slot.
pub const SENTINEL_SECTOR: u64 = u64::MAX;

/// Which device an I/O is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// The primary device whose bad sectors are being remapped
    Main,
    /// The device hosting the spare pool and the metadata region
    Spare,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Main => write!(f, "main"),
            DeviceKind::Spare => write!(f, "spare"),
        }
    }
}

/// Direction of an incoming I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoDirection {
    /// Read from the device
    Read,
    /// Write to the device
    Write,
}

impl IoDirection {
    /// Returns true for writes.
    pub fn is_write(&self) -> bool {
        matches!(self, IoDirection::Write)
    }
}

/// A half-open range of sectors `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorRange {
    /// First sector of the range
    pub start: u64,
    /// Number of sectors in the range
    pub len: u64,
}

impl SectorRange {
    /// Creates a new range.
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// One past the last sector, saturating at `u64::MAX`.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }

    /// Returns true if the range has no sectors.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if `sector` lies inside the range.
    pub fn contains(&self, sector: u64) -> bool {
        sector >= self.start && sector < self.end()
    }

    /// Returns true if the two ranges share at least one sector.
    pub fn overlaps(&self, other: &SectorRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }

    /// Offset of `sector` from the start of the range, if inside it.
    pub fn offset_of(&self, sector: u64) -> Option<u64> {
        if self.contains(sector) {
            Some(sector - self.start)
        } else {
            None
        }
    }
}

impl fmt::Display for SectorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// Current time in seconds since the Unix epoch.
pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
