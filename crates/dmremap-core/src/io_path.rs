//! Per-I/O routing decisions.
//!
//! The router only decides where an I/O goes. It never touches a device and
//! never waits on the metadata layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::sector::{DeviceKind, IoDirection, SectorRange};
use crate::table::RemapTable;

/// An incoming I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoRequest {
    /// First sector addressed
    pub sector: u64,
    /// Length in sectors
    pub len: u64,
    /// Read or write
    pub direction: IoDirection,
}

impl IoRequest {
    /// A read of `len` sectors at `sector`.
    pub fn read(sector: u64, len: u64) -> Self {
        Self {
            sector,
            len,
            direction: IoDirection::Read,
        }
    }

    /// A write of `len` sectors at `sector`.
    pub fn write(sector: u64, len: u64) -> Self {
        Self {
            sector,
            len,
            direction: IoDirection::Write,
        }
    }

    fn range(&self) -> SectorRange {
        SectorRange::new(self.sector, self.len.max(1))
    }
}

/// Why an I/O was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The I/O touches the reserved spare-pool range
    ReservedArea,
    /// Read of a remapped sector whose data is lost
    DataLost,
    /// Multi-sector I/O covering a remapped sector; resubmit one sector at a time
    SplitRequired,
}

/// Outcome of routing one I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoDecision {
    /// Send to the main device unchanged
    PassThrough {
        /// Sector on the main device
        sector: u64,
    },
    /// Send to the spare device
    Redirect {
        /// Sector on the spare device
        spare_sector: u64,
    },
    /// Fail the I/O
    Reject(RejectReason),
}

impl IoDecision {
    /// Device and sector the I/O should be submitted to.
    pub fn target(&self) -> Option<(DeviceKind, u64)> {
        match *self {
            IoDecision::PassThrough { sector } => Some((DeviceKind::Main, sector)),
            IoDecision::Redirect { spare_sector } => Some((DeviceKind::Spare, spare_sector)),
            IoDecision::Reject(_) => None,
        }
    }

    /// Returns true if the I/O must be failed.
    pub fn is_reject(&self) -> bool {
        matches!(self, IoDecision::Reject(_))
    }
}

/// Routing counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoPathStats {
    /// I/Os routed
    pub total: u64,
    /// Sent to the main device
    pub passthrough: u64,
    /// Sent to the spare device
    pub redirected: u64,
    /// Refused because they touched the reserved range
    pub rejected_reserved: u64,
    /// Refused because the data is lost
    pub rejected_lost: u64,
    /// Refused because a multi-sector I/O covered a remapped sector
    pub rejected_split: u64,
    /// Failed completions reported back
    pub completion_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    passthrough: AtomicU64,
    redirected: AtomicU64,
    rejected_reserved: AtomicU64,
    rejected_lost: AtomicU64,
    rejected_split: AtomicU64,
    completion_errors: AtomicU64,
}

/// Maps I/Os onto the main or spare device.
#[derive(Debug)]
pub struct IoRouter {
    table: Arc<RemapTable>,
    reserved: Option<SectorRange>,
    counters: Counters,
}

impl IoRouter {
    /// Creates a router. I/O overlapping `reserved` is refused.
    pub fn new(table: Arc<RemapTable>, reserved: Option<SectorRange>) -> Self {
        Self {
            table,
            reserved,
            counters: Counters::default(),
        }
    }

    /// Decides where `req` goes and updates the entry counters.
    ///
    /// Remapped sectors are redirected one at a time: spare slots of
    /// neighbouring main sectors are not contiguous, so a longer I/O that
    /// covers any remapped sector is refused with `SplitRequired`.
    pub fn route(&self, req: &IoRequest) -> IoDecision {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        if let Some(reserved) = self.reserved {
            if req.range().overlaps(&reserved) {
                self.counters.rejected_reserved.fetch_add(1, Ordering::Relaxed);
                warn!(sector = req.sector, len = req.len, reserved = %reserved, "I/O into reserved area rejected");
                return IoDecision::Reject(RejectReason::ReservedArea);
            }
        }

        if req.len > 1 {
            if let Some(remapped) = self.table.first_remapped_in(req.range()) {
                self.counters.rejected_split.fetch_add(1, Ordering::Relaxed);
                debug!(sector = req.sector, len = req.len, remapped, "multi-sector I/O over remap rejected");
                return IoDecision::Reject(RejectReason::SplitRequired);
            }
        }

        let decision = match self.table.touch(req.sector, req.direction) {
            None => {
                self.counters.passthrough.fetch_add(1, Ordering::Relaxed);
                IoDecision::PassThrough { sector: req.sector }
            }
            Some(entry) if !req.direction.is_write() && !entry.valid => {
                self.counters.rejected_lost.fetch_add(1, Ordering::Relaxed);
                IoDecision::Reject(RejectReason::DataLost)
            }
            Some(entry) => {
                self.counters.redirected.fetch_add(1, Ordering::Relaxed);
                IoDecision::Redirect {
                    spare_sector: entry.spare_sector,
                }
            }
        };
        trace!(sector = req.sector, direction = ?req.direction, ?decision, "I/O routed");
        decision
    }

    /// Records a failed completion for an I/O that started at `sector`.
    pub fn complete_with_error(&self, sector: u64) {
        self.counters.completion_errors.fetch_add(1, Ordering::Relaxed);
        self.table.record_io_error(sector);
    }

    /// The table consulted by this router.
    pub fn table(&self) -> &Arc<RemapTable> {
        &self.table
    }

    /// Reserved range, if any.
    pub fn reserved(&self) -> Option<SectorRange> {
        self.reserved
    }

    /// Counter snapshot.
    pub fn stats(&self) -> IoPathStats {
        let c = &self.counters;
        IoPathStats {
            total: c.total.load(Ordering::Relaxed),
            passthrough: c.passthrough.load(Ordering::Relaxed),
            redirected: c.redirected.load(Ordering::Relaxed),
            rejected_reserved: c.rejected_reserved.load(Ordering::Relaxed),
            rejected_lost: c.rejected_lost.load(Ordering::Relaxed),
            rejected_split: c.rejected_split.load(Ordering::Relaxed),
            completion_errors: c.completion_errors.load(Ordering::Relaxed),
        }
    }
}
