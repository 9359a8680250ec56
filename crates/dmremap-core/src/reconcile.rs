//! Reconciliation between the remap table and its persisted copy.

use tracing::{debug, info, warn};

use crate::autosave::AutosaveScheduler;
use crate::error::RemapResult;
use crate::layout::MetadataEntry;
use crate::metadata::MetadataStore;
use crate::table::{RemapTable, RestoreSkip};

/// Rebuilds the table from persisted entries.
///
/// Expected to run against an empty table during activation. Entries that
/// cannot be placed are logged and skipped. `spare_used` is set to the
/// number of entries restored, which is returned.
///
/// The on-disk entry has no validity flag, so every restored remap comes
/// back `valid = true`. A sector that was lost before the restart becomes
/// readable again and returns whatever its spare slot holds. Lost-data flags
/// do not survive a reboot; restore data to such sectors before relying on
/// reads from them.
pub fn restore_table_from_metadata(table: &RemapTable, store: &MetadataStore) -> usize {
    let pool = table.pool();
    let mut restored = 0usize;

    for entry in store.entries() {
        if entry.is_sentinel() {
            continue;
        }
        let outcome = match entry.spare_sector.checked_sub(pool.start) {
            Some(offset) => table.restore_entry(entry.main_sector, offset),
            None => Err(RestoreSkip::OutOfRange),
        };
        match outcome {
            Ok(spare_sector) => {
                debug!(main_sector = entry.main_sector, spare_sector, "remap restored");
                restored += 1;
            }
            Err(skip) => {
                warn!(
                    main_sector = entry.main_sector,
                    spare_sector = entry.spare_sector,
                    pool = %pool,
                    reason = ?skip,
                    "persisted remap skipped"
                );
            }
        }
    }

    table.set_spare_used(restored as u64);
    info!(restored, persisted = store.entry_count(), "remap table restored");
    restored
}

/// Copies every live remap into the metadata store and forces a save.
///
/// Returns the number of entries persisted, which is lower than the table
/// count when the metadata capacity is smaller.
pub async fn sync_table_to_metadata(
    table: &RemapTable,
    scheduler: &AutosaveScheduler,
) -> RemapResult<usize> {
    let entries: Vec<MetadataEntry> = table
        .pairs()
        .into_iter()
        .map(|(main, spare)| MetadataEntry::new(main, spare))
        .collect();
    let synced = scheduler.store().replace_entries(&entries);
    scheduler.force().await?;
    info!(synced, table_entries = entries.len(), "remap table synced to metadata");
    Ok(synced)
}

/// Counts live remaps that are missing from metadata or persisted with a
/// different spare sector. Zero means consistent.
pub fn validate_consistency(table: &RemapTable, store: &MetadataStore) -> usize {
    let mismatches = table
        .pairs()
        .into_iter()
        .filter(|&(main, spare)| store.find_entry(main) != Some(spare))
        .count();
    if mismatches > 0 {
        warn!(mismatches, "remap table and metadata disagree");
    }
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::block_io::MemBlockDevice;
    use crate::config::{AutosaveConfig, MetadataConfig};
    use crate::layout::METADATA_SECTORS;
    use crate::sector::SectorRange;
    use crate::table::RemapReason;

    const POOL: SectorRange = SectorRange {
        start: METADATA_SECTORS,
        len: 8,
    };

    fn store() -> (Arc<MemBlockDevice>, Arc<MetadataStore>) {
        let dev = Arc::new(MemBlockDevice::new(512));
        let store = MetadataStore::create(dev.clone(), 4096, 512, MetadataConfig::default()).unwrap();
        (dev, Arc::new(store))
    }

    fn disabled() -> AutosaveConfig {
        AutosaveConfig {
            enabled: false,
            ..AutosaveConfig::default()
        }
    }

    #[test]
    fn test_restore_places_by_offset() {
        let (_dev, store) = store();
        store.add_entry(10, POOL.start + 3).unwrap();
        store.add_entry(11, POOL.start).unwrap();

        let table = RemapTable::new(POOL);
        assert_eq!(restore_table_from_metadata(&table, &store), 2);
        let e = table.lookup(10).unwrap();
        assert_eq!(e.spare_sector, POOL.start + 3);
        assert!(e.valid);
        assert_eq!(e.remap_reason, RemapReason::Manual);
        assert_eq!(e.access_count, 0);
        assert_eq!(table.spare_used(), 2);
    }

    #[test]
    fn test_restore_skips_bad_entries() {
        let (_dev, store) = store();
        let table = RemapTable::new(POOL);
        table.load(4, POOL.start + 1, true).unwrap();
        store.add_entry(1, POOL.start).unwrap();
        store.add_entry(2, POOL.end() + 5).unwrap();
        store.add_entry(3, 2).unwrap();
        store.add_entry(5, POOL.start + 1).unwrap();

        assert_eq!(restore_table_from_metadata(&table, &store), 1);
        assert!(table.lookup(1).is_some());
        assert!(table.lookup(2).is_none());
        assert!(table.lookup(3).is_none());
        assert!(table.lookup(5).is_none());
        assert_eq!(table.count(), 2);
    }

    #[tokio::test]
    async fn test_sync_then_restore_roundtrip() {
        let (dev, store) = store();
        let sched = AutosaveScheduler::init(disabled(), store.clone());
        let table = RemapTable::new(POOL);
        table.remap(100, RemapReason::Manual).unwrap();
        table.remap(101, RemapReason::AutoDetected).unwrap();
        table.load(102, POOL.start + 6, true).unwrap();

        assert_eq!(sync_table_to_metadata(&table, &sched).await.unwrap(), 3);
        assert!(!store.is_dirty());
        assert_eq!(validate_consistency(&table, &store), 0);

        let reread = MetadataStore::create(dev, 4096, 512, MetadataConfig::default()).unwrap();
        reread.read().await.unwrap();
        let fresh = RemapTable::new(POOL);
        assert_eq!(restore_table_from_metadata(&fresh, &reread), 3);

        let mut before = table.pairs();
        let mut after = fresh.pairs();
        before.sort_unstable();
        after.sort_unstable();
        assert_eq!(before, after);
        assert!(fresh.snapshot().iter().all(|e| e.error_count == 0 && e.access_count == 0));
    }

    #[tokio::test]
    async fn test_sync_truncates_to_metadata_capacity() {
        let dev = Arc::new(MemBlockDevice::new(512));
        let config = MetadataConfig {
            max_entries: Some(2),
            ..MetadataConfig::default()
        };
        let store = Arc::new(MetadataStore::create(dev, 4096, 512, config).unwrap());
        let sched = AutosaveScheduler::init(disabled(), store.clone());
        let table = RemapTable::new(POOL);
        for s in 0..3 {
            table.remap(s, RemapReason::Manual).unwrap();
        }
        assert_eq!(sync_table_to_metadata(&table, &sched).await.unwrap(), 2);
        assert_eq!(validate_consistency(&table, &store), 1);
    }

    #[tokio::test]
    async fn test_sync_reports_write_failure() {
        let (dev, store) = store();
        let sched = AutosaveScheduler::init(disabled(), store.clone());
        let table = RemapTable::new(POOL);
        table.remap(1, RemapReason::Manual).unwrap();
        dev.set_fail_writes(true);
        assert!(sync_table_to_metadata(&table, &sched).await.unwrap_err().is_io());
        assert!(store.is_dirty());
    }

    #[test]
    fn test_validate_consistency_counts_mismatches() {
        let (_dev, store) = store();
        let table = RemapTable::new(POOL);
        table.load(1, POOL.start, true).unwrap();
        table.load(2, POOL.start + 1, true).unwrap();
        table.load(3, POOL.start + 2, true).unwrap();
        store.add_entry(1, POOL.start).unwrap();
        store.add_entry(2, POOL.start + 5).unwrap();
        assert_eq!(validate_consistency(&table, &store), 2);
    }
}
