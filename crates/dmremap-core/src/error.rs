//! Error types for the remap core.

use thiserror::Error;

/// Result type alias for remap operations.
pub type RemapResult<T> = Result<T, RemapError>;

/// Error variants for remap table, metadata and scheduler operations.
#[derive(Debug, Error)]
pub enum RemapError {
    /// Wraps standard I/O errors from a block device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A device read or write at a given sector failed.
    #[error("Device I/O failed at sector {sector}: {reason}")]
    DeviceIo {
        /// First sector of the failed transfer.
        sector: u64,
        /// Description of the failure.
        reason: String,
    },

    /// A metadata device operation did not complete in time.
    #[error("Metadata {op} timed out after {timeout_ms} ms")]
    IoTimeout {
        /// The operation that timed out ("read" or "write").
        op: &'static str,
        /// The timeout that expired.
        timeout_ms: u64,
    },

    /// A buffer handed to the block layer had the wrong size.
    #[error("Short buffer: expected {expected} bytes, got {actual}")]
    ShortBuffer {
        /// Required length in bytes.
        expected: usize,
        /// Supplied length in bytes.
        actual: usize,
    },

    /// The remap table has no free slot or no free spare sector.
    #[error("Remap table full: capacity {capacity}")]
    TableFull {
        /// Table capacity in entries.
        capacity: u64,
    },

    /// The metadata entry array is full.
    #[error("Metadata full: max {max_entries} entries")]
    MetadataFull {
        /// Maximum persisted entries.
        max_entries: u32,
    },

    /// The main sector already has a live remap.
    #[error("Sector {main_sector} is already remapped")]
    AlreadyRemapped {
        /// The duplicated main sector.
        main_sector: u64,
    },

    /// The spare sector is already assigned to another remap.
    #[error("Spare sector {spare_sector} is already in use")]
    SpareInUse {
        /// The duplicated spare sector.
        spare_sector: u64,
    },

    /// The spare sector lies outside the spare pool.
    #[error("Spare sector {spare_sector} outside spare pool [{pool_start}, {pool_end})")]
    InvalidSpareSector {
        /// The rejected spare sector.
        spare_sector: u64,
        /// First sector of the spare pool.
        pool_start: u64,
        /// One past the last sector of the spare pool.
        pool_end: u64,
    },

    /// Metadata magic signature did not match.
    #[error("Bad metadata magic: {found:?}")]
    BadMagic {
        /// The eight bytes found on disk.
        found: [u8; 8],
    },

    /// Metadata format version is not supported.
    #[error("Metadata version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Supported version.
        expected: u32,
        /// Version found on disk.
        found: u32,
    },

    /// Stored checksum does not match the recomputed one.
    #[error("Metadata checksum mismatch: stored {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum stored in the header.
        expected: u32,
        /// Checksum computed over the read bytes.
        actual: u32,
    },

    /// Header fields are structurally invalid.
    #[error("Corrupt metadata: {reason}")]
    Corrupt {
        /// Description of the corruption.
        reason: String,
    },

    /// The on-disk header was left in the Writing state.
    #[error("Torn metadata write detected at generation {generation}")]
    TornWrite {
        /// Generation recorded in the torn header.
        generation: u32,
    },

    /// Configuration values are inconsistent.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// A control message could not be parsed.
    #[error("Invalid command: {reason}")]
    InvalidCommand {
        /// Description of the parse failure.
        reason: String,
    },

    /// The operation needs a metadata store but none is attached.
    #[error("No metadata store attached")]
    NoMetadata,

    /// The auto-save scheduler has been cleaned up.
    #[error("Auto-save scheduler stopped")]
    SchedulerStopped,
}

impl RemapError {
    /// True for on-disk integrity failures that `recover()` can clear.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            RemapError::BadMagic { .. }
                | RemapError::VersionMismatch { .. }
                | RemapError::ChecksumMismatch { .. }
                | RemapError::Corrupt { .. }
                | RemapError::TornWrite { .. }
        )
    }

    /// True when the operation was rejected for lack of room.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            RemapError::TableFull { .. } | RemapError::MetadataFull { .. }
        )
    }

    /// True when the operation was rejected as a duplicate mapping.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            RemapError::AlreadyRemapped { .. } | RemapError::SpareInUse { .. }
        )
    }

    /// True for device I/O failures, including timeouts.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            RemapError::Io(_)
                | RemapError::DeviceIo { .. }
                | RemapError::IoTimeout { .. }
                | RemapError::ShortBuffer { .. }
        )
    }
}
