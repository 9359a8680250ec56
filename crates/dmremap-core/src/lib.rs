#![warn(missing_docs)]

//! dm-remap core: bad-sector remapping with a persistent, checksummed remap table
//!
//! This crate decides where each I/O to a failing block device should go.
//! Sectors known to be bad are redirected to a spare pool on a second device;
//! the remap table lives in memory for the I/O path and is mirrored to a
//! versioned, CRC32-protected metadata region at the start of the spare
//! device. A background task keeps that copy current.

pub mod autosave;
pub mod block_io;
pub mod checksum;
pub mod config;
pub mod control;
pub mod error;
pub mod io_path;
pub mod layout;
pub mod metadata;
pub mod reconcile;
pub mod sector;
pub mod table;
pub mod target;

pub use autosave::{AutosaveScheduler, AutosaveStats, SaveSignal, SchedulerState};
pub use block_io::{BlockDevice, DeviceHandle, FileBlockDevice, IoGate, IoStats, MemBlockDevice};
pub use config::{AutosaveConfig, MetadataConfig, TargetConfig};
pub use control::{verify_reply, ControlCommand};
pub use error::{RemapError, RemapResult};
pub use io_path::{IoDecision, IoPathStats, IoRequest, IoRouter, RejectReason};
pub use layout::{
    MetadataEntry, MetadataHeader, MetadataState, MAX_ENTRIES_ON_DISK, METADATA_MAGIC,
    METADATA_SECTORS, METADATA_VERSION,
};
pub use metadata::{MetadataStats, MetadataStore};
pub use reconcile::{restore_table_from_metadata, sync_table_to_metadata, validate_consistency};
pub use sector::{DeviceKind, IoDirection, SectorRange, SECTOR_SIZE};
pub use table::{
    ChangeSink, HealthStatus, RemapEntry, RemapReason, RemapTable, RestoreSkip, TableChange,
    TableStatus,
};
pub use target::RemapTarget;
