//! On-disk metadata layout for the spare device.
//!
//! Layout:
//! - Sectors 0..8: header page (fields below, rest reserved and zero)
//! - Sectors 8..128: entry region, 16-byte `{main, spare}` records
//!
//! Header fields (little-endian):
//!
//! | bytes | field |
//! |-------|-------|
//! | 0..8   | magic `"DMREMAP3"` |
//! | 8..12  | format version |
//! | 12..16 | CRC32 of bytes 16..4096 plus the live entries |
//! | 16..24 | creation time (secs) |
//! | 24..32 | last update time (secs) |
//! | 32..36 | entry count |
//! | 36..40 | max entries |
//! | 40..48 | main device size (sectors) |
//! | 48..56 | spare device size (sectors) |
//! | 56..60 | state |
//! | 60..64 | generation |
//! | 64..72 | lifetime remap counter |

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checksum::{get_u32, get_u64, metadata_checksum, put_u32, put_u64};
use crate::error::{RemapError, RemapResult};
use crate::sector::{now_secs, PAGE_SIZE, SECTORS_PER_PAGE, SENTINEL_SECTOR};

/// Metadata magic signature.
pub const METADATA_MAGIC: [u8; 8] = *b"DMREMAP3";
/// Current metadata format version.
pub const METADATA_VERSION: u32 = 3;
/// Size of one on-disk entry.
pub const ENTRY_SIZE: usize = 16;
/// Entries that fit in one page.
pub const ENTRIES_PER_PAGE: usize = PAGE_SIZE / ENTRY_SIZE;
/// Pages reserved for the entry region.
pub const ENTRY_REGION_PAGES: usize = 15;
/// Largest entry count the fixed on-disk region can hold.
pub const MAX_ENTRIES_ON_DISK: u32 = (ENTRY_REGION_PAGES * ENTRIES_PER_PAGE) as u32;
/// Header sector.
pub const HEADER_SECTOR: u64 = 0;
/// First sector of the entry region.
pub const ENTRIES_SECTOR: u64 = SECTORS_PER_PAGE;
/// Total sectors occupied by the metadata region.
pub const METADATA_SECTORS: u64 = SECTORS_PER_PAGE * (1 + ENTRY_REGION_PAGES as u64);

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_CHECKSUM: usize = 12;
const OFF_CREATED: usize = 16;
const OFF_UPDATED: usize = 24;
const OFF_ENTRY_COUNT: usize = 32;
const OFF_MAX_ENTRIES: usize = 36;
const OFF_MAIN_SECTORS: usize = 40;
const OFF_SPARE_SECTORS: usize = 48;
const OFF_STATE: usize = 56;
const OFF_GENERATION: usize = 60;
const OFF_LIFETIME_REMAPS: usize = 64;

/// Persisted state of the metadata region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum MetadataState {
    /// Disk content matches the in-memory mirror
    #[default]
    Clean = 0,
    /// In-memory mirror has unpersisted changes
    Dirty = 1,
    /// A write is in progress; entries on disk may be torn
    Writing = 2,
    /// The last write failed
    Error = 3,
}

impl TryFrom<u32> for MetadataState {
    type Error = RemapError;

    fn try_from(value: u32) -> Result<Self, RemapError> {
        match value {
            0 => Ok(MetadataState::Clean),
            1 => Ok(MetadataState::Dirty),
            2 => Ok(MetadataState::Writing),
            3 => Ok(MetadataState::Error),
            other => Err(RemapError::Corrupt {
                reason: format!("unknown state {}", other),
            }),
        }
    }
}

impl fmt::Display for MetadataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataState::Clean => write!(f, "clean"),
            MetadataState::Dirty => write!(f, "dirty"),
            MetadataState::Writing => write!(f, "writing"),
            MetadataState::Error => write!(f, "error"),
        }
    }
}

/// Metadata header stored in the first page of the spare device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataHeader {
    /// Magic signature
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// CRC32 over bytes 16.. of the header and the live entries
    pub checksum: u32,
    /// Creation timestamp (seconds since epoch)
    pub created_secs: u64,
    /// Last update timestamp (seconds since epoch)
    pub updated_secs: u64,
    /// Number of live entries
    pub entry_count: u32,
    /// Entry capacity of this metadata instance
    pub max_entries: u32,
    /// Main device size in sectors
    pub main_sectors: u64,
    /// Spare device size in sectors
    pub spare_sectors: u64,
    /// Persisted state
    pub state: MetadataState,
    /// Bumped on every metadata-modifying operation
    pub generation: u32,
    /// Remaps ever recorded on this device
    pub lifetime_remaps: u64,
}

impl MetadataHeader {
    /// Creates a fresh, clean header at generation 0.
    pub fn new(main_sectors: u64, spare_sectors: u64, max_entries: u32) -> Self {
        let now = now_secs();
        Self {
            magic: METADATA_MAGIC,
            version: METADATA_VERSION,
            checksum: 0,
            created_secs: now,
            updated_secs: now,
            entry_count: 0,
            max_entries: max_entries.min(MAX_ENTRIES_ON_DISK),
            main_sectors,
            spare_sectors,
            state: MetadataState::Clean,
            generation: 0,
            lifetime_remaps: 0,
        }
    }

    /// Serializes the header into one zero-padded page.
    pub fn encode(&self) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&self.magic);
        put_u32(&mut page, OFF_VERSION, self.version);
        put_u32(&mut page, OFF_CHECKSUM, self.checksum);
        put_u64(&mut page, OFF_CREATED, self.created_secs);
        put_u64(&mut page, OFF_UPDATED, self.updated_secs);
        put_u32(&mut page, OFF_ENTRY_COUNT, self.entry_count);
        put_u32(&mut page, OFF_MAX_ENTRIES, self.max_entries);
        put_u64(&mut page, OFF_MAIN_SECTORS, self.main_sectors);
        put_u64(&mut page, OFF_SPARE_SECTORS, self.spare_sectors);
        put_u32(&mut page, OFF_STATE, self.state as u32);
        put_u32(&mut page, OFF_GENERATION, self.generation);
        put_u64(&mut page, OFF_LIFETIME_REMAPS, self.lifetime_remaps);
        page
    }

    /// Parses a header page, checking magic, version, state and bounds.
    ///
    /// The checksum is not verified here because it also covers the entries.
    pub fn decode(page: &[u8]) -> RemapResult<Self> {
        if page.len() < PAGE_SIZE {
            return Err(RemapError::ShortBuffer {
                expected: PAGE_SIZE,
                actual: page.len(),
            });
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&page[OFF_MAGIC..OFF_MAGIC + 8]);
        if magic != METADATA_MAGIC {
            debug!(found = ?magic, "invalid metadata magic");
            return Err(RemapError::BadMagic { found: magic });
        }

        let version = get_u32(page, OFF_VERSION);
        if version != METADATA_VERSION {
            debug!(expected = METADATA_VERSION, actual = version, "unsupported metadata version");
            return Err(RemapError::VersionMismatch {
                expected: METADATA_VERSION,
                found: version,
            });
        }

        let header = Self {
            magic,
            version,
            checksum: get_u32(page, OFF_CHECKSUM),
            created_secs: get_u64(page, OFF_CREATED),
            updated_secs: get_u64(page, OFF_UPDATED),
            entry_count: get_u32(page, OFF_ENTRY_COUNT),
            max_entries: get_u32(page, OFF_MAX_ENTRIES),
            main_sectors: get_u64(page, OFF_MAIN_SECTORS),
            spare_sectors: get_u64(page, OFF_SPARE_SECTORS),
            state: MetadataState::try_from(get_u32(page, OFF_STATE))?,
            generation: get_u32(page, OFF_GENERATION),
            lifetime_remaps: get_u64(page, OFF_LIFETIME_REMAPS),
        };
        header.check_bounds()?;
        Ok(header)
    }

    /// Checks `entry_count <= max_entries <= MAX_ENTRIES_ON_DISK`.
    pub fn check_bounds(&self) -> RemapResult<()> {
        if self.max_entries > MAX_ENTRIES_ON_DISK {
            return Err(RemapError::Corrupt {
                reason: format!(
                    "max_entries {} exceeds on-disk limit {}",
                    self.max_entries, MAX_ENTRIES_ON_DISK
                ),
            });
        }
        if self.entry_count > self.max_entries {
            return Err(RemapError::Corrupt {
                reason: format!(
                    "entry_count {} exceeds max_entries {}",
                    self.entry_count, self.max_entries
                ),
            });
        }
        Ok(())
    }

    /// Computes the checksum this header would carry with `entries`.
    pub fn compute_checksum(&self, entries: &[MetadataEntry]) -> u32 {
        let live = &entries[..(self.entry_count as usize).min(entries.len())];
        metadata_checksum(&self.encode(), &encode_entries(live))
    }

    /// Recomputes and stores the checksum.
    pub fn update_checksum(&mut self, entries: &[MetadataEntry]) {
        self.checksum = self.compute_checksum(entries);
    }

    /// Stamps the last-update time.
    pub fn touch(&mut self) {
        self.updated_secs = now_secs();
    }
}

/// One persisted remap: the durable subset of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Original sector on the main device
    pub main_sector: u64,
    /// Replacement sector on the spare device
    pub spare_sector: u64,
}

impl MetadataEntry {
    /// Creates a new entry.
    pub fn new(main_sector: u64, spare_sector: u64) -> Self {
        Self {
            main_sector,
            spare_sector,
        }
    }

    /// An unused slot.
    pub fn sentinel() -> Self {
        Self::new(SENTINEL_SECTOR, SENTINEL_SECTOR)
    }

    /// Returns true for unused slots.
    pub fn is_sentinel(&self) -> bool {
        self.main_sector == SENTINEL_SECTOR
    }

    /// Serializes to 16 little-endian bytes.
    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0..8].copy_from_slice(&self.main_sector.to_le_bytes());
        raw[8..16].copy_from_slice(&self.spare_sector.to_le_bytes());
        raw
    }

    /// Parses 16 little-endian bytes.
    pub fn from_bytes(raw: &[u8]) -> Self {
        Self::new(get_u64(raw, 0), get_u64(raw, 8))
    }
}

/// Serializes entries back to back, without padding.
pub fn encode_entries(entries: &[MetadataEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * ENTRY_SIZE);
    for entry in entries {
        out.extend_from_slice(&entry.to_bytes());
    }
    out
}

/// Parses the first `count` entries from `raw`.
pub fn decode_entries(raw: &[u8], count: usize) -> Vec<MetadataEntry> {
    raw.chunks_exact(ENTRY_SIZE)
        .take(count)
        .map(MetadataEntry::from_bytes)
        .collect()
}

/// Number of pages needed to hold `count` entries.
pub fn entry_pages(count: usize) -> usize {
    count.div_ceil(ENTRIES_PER_PAGE)
}

/// Serializes entries into whole pages, zero padded.
pub fn encode_entry_pages(entries: &[MetadataEntry]) -> Vec<u8> {
    let mut out = encode_entries(entries);
    out.resize(entry_pages(entries.len()) * PAGE_SIZE, 0);
    out
}
