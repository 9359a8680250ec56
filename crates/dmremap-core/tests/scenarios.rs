//! End-to-end remap scenarios against an in-memory spare device.

mod common;

use std::sync::Arc;

use common::{active_target, manual_config, spare_device, MAIN_SECTORS, SPARE_SECTORS};
use dmremap_core::{
    BlockDevice, IoDecision, IoRequest, MemBlockDevice, MetadataConfig, MetadataState,
    MetadataStore, RejectReason, RemapError, RemapTarget, SectorRange, METADATA_SECTORS,
};

fn store_on(dev: &Arc<MemBlockDevice>) -> MetadataStore {
    MetadataStore::create(dev.clone(), MAIN_SECTORS, SPARE_SECTORS, MetadataConfig::default())
        .unwrap()
}

#[tokio::test]
async fn scenario_remap_duplicate_and_status() {
    let dev = spare_device();
    let target = active_target(manual_config(4), &dev).await;

    let s0 = target.remap(100).unwrap();
    assert_eq!(s0, METADATA_SECTORS);
    assert!(!target.table().lookup(100).unwrap().valid);

    assert!(matches!(
        target.remap(100),
        Err(RemapError::AlreadyRemapped { main_sector: 100 })
    ));
    assert_eq!(
        target.status().to_string(),
        "remapped=1 lost=1 spare_used=1/4 (25%)"
    );
}

#[tokio::test]
async fn scenario_load_valid_mapping() {
    let dev = spare_device();
    let mut config = manual_config(4);
    config.spare_pool = SectorRange::new(500, 4);
    let target = active_target(config, &dev).await;

    target.load(200, 500, true).unwrap();
    assert_eq!(target.verify(200), "remapped to 500 valid=1");
    assert_eq!(
        target.map_io(&IoRequest::read(200, 1)),
        IoDecision::Redirect { spare_sector: 500 }
    );
}

#[tokio::test]
async fn scenario_lost_sector_reads_fail_writes_redirect() {
    let dev = spare_device();
    let target = active_target(manual_config(4), &dev).await;
    let s0 = target.remap(100).unwrap();

    assert_eq!(
        target.map_io(&IoRequest::read(100, 1)),
        IoDecision::Reject(RejectReason::DataLost)
    );
    assert_eq!(
        target.map_io(&IoRequest::write(100, 1)),
        IoDecision::Redirect { spare_sector: s0 }
    );
    assert_eq!(
        target.map_io(&IoRequest::read(100, 1)),
        IoDecision::Reject(RejectReason::DataLost)
    );
}

#[tokio::test]
async fn scenario_corrupt_checksum_then_recover() {
    let dev = spare_device();
    let store = store_on(&dev);
    store.add_entry(10, 130).unwrap();
    store.write().await.unwrap();

    // checksum field lives at bytes 12..16 of the header
    dev.corrupt_byte(12, 0x80);
    let reader = store_on(&dev);
    assert!(matches!(
        reader.read().await,
        Err(RemapError::ChecksumMismatch { .. })
    ));
    assert_eq!(reader.stats().checksum_errors, 1);

    reader.recover().await.unwrap();
    let after = store_on(&dev);
    after.read().await.unwrap();
    assert_eq!(after.entry_count(), 0);
    assert!(after.validate());
}

#[tokio::test]
async fn scenario_full_table_rejects_remap() {
    let dev = spare_device();
    let target = active_target(manual_config(4), &dev).await;
    for sector in 0..4 {
        target.remap(1_000 + sector).unwrap();
    }

    let err = target.remap(2_000).unwrap_err();
    assert!(matches!(err, RemapError::TableFull { capacity: 4 }));
    assert_eq!(target.status().remapped, 4);
    assert_eq!(target.status().spare_used, 4);
    assert_eq!(target.verify(2_000), "not remapped");
    assert_eq!(target.store().unwrap().entry_count(), 4);
}

#[tokio::test]
async fn write_then_read_reproduces_header_and_entries() {
    let dev = spare_device();
    let store = store_on(&dev);
    for i in 0..300u64 {
        store.add_entry(i * 7, 128 + i).unwrap();
    }
    store.write().await.unwrap();

    let reader = store_on(&dev);
    reader.read().await.unwrap();
    assert_eq!(reader.header(), store.header());
    assert_eq!(reader.entries(), store.entries());
    assert!(reader.validate());
    assert_eq!(reader.state(), MetadataState::Clean);
}

#[tokio::test]
async fn sync_twice_writes_once() {
    let dev = spare_device();
    let store = store_on(&dev);
    store.add_entry(1, 200).unwrap();

    store.sync().await.unwrap();
    let pages = dev.stats().writes_completed;
    store.sync().await.unwrap();
    assert_eq!(dev.stats().writes_completed, pages);
    assert_eq!(store.stats().writes, 1);
}

#[tokio::test]
async fn entry_bit_flip_is_detected() {
    let dev = spare_device();
    let store = store_on(&dev);
    store.add_entry(42, 300).unwrap();
    store.add_entry(43, 301).unwrap();
    store.write().await.unwrap();

    dev.corrupt_byte(8 * 512 + 17, 0x04);
    let reader = store_on(&dev);
    assert!(reader.read().await.unwrap_err().is_integrity());
    assert!(reader.entries().is_empty());
}

#[tokio::test]
async fn recover_bumps_generation_once() {
    let dev = spare_device();
    let store = store_on(&dev);
    store.add_entry(1, 200).unwrap();
    store.write().await.unwrap();
    let before = store.generation();

    store.recover().await.unwrap();
    assert_eq!(store.entry_count(), 0);
    assert_eq!(store.generation(), before + 1);

    let reader = store_on(&dev);
    reader.read().await.unwrap();
    assert_eq!(reader.generation(), before + 1);
    assert!(reader.validate());
}

#[tokio::test]
async fn torn_header_blocks_activation() {
    let dev = spare_device();
    let target = active_target(manual_config(8), &dev).await;
    target.remap(9).unwrap();
    target.shutdown().await.unwrap();

    // Entry writes fail after the first header page lands in state Writing.
    let store = store_on(&dev);
    store.read().await.unwrap();
    store.add_entry(10, 140).unwrap();
    dev.fail_writes_after(1);
    assert!(store.write().await.is_err());
    assert_eq!(store.state(), MetadataState::Error);
    dev.fail_writes_after(u64::MAX);

    let again = RemapTarget::with_metadata(manual_config(8), dev.clone()).unwrap();
    assert!(matches!(
        again.activate().await,
        Err(RemapError::TornWrite { .. })
    ));
}

#[tokio::test]
async fn shutdown_and_restart_restores_table() {
    let dev = spare_device();
    let target = active_target(manual_config(16), &dev).await;
    target.remap(100).unwrap();
    target.remap(101).unwrap();
    target.load(300, 140, true).unwrap();
    let before = target.table().pairs();
    target.shutdown().await.unwrap();

    let again = active_target(manual_config(16), &dev).await;
    assert_eq!(again.table().pairs(), before);
    assert_eq!(again.status().spare_used, 3);
    assert!(again
        .table()
        .snapshot()
        .iter()
        .all(|e| e.valid && e.access_count == 0 && e.error_count == 0));
    assert_eq!(again.check_consistency().unwrap(), 0);
}

#[tokio::test]
async fn sync_after_recover_repersists_table() {
    let dev = spare_device();
    let target = active_target(manual_config(8), &dev).await;
    target.remap(1).unwrap();
    target.remap(2).unwrap();
    target.save().await.unwrap();

    target.recover_metadata().await.unwrap();
    assert_eq!(target.check_consistency().unwrap(), 2);
    assert_eq!(target.sync_metadata().await.unwrap(), 2);
    assert_eq!(target.check_consistency().unwrap(), 0);
    assert!(!target.store().unwrap().is_dirty());
}

#[tokio::test]
async fn autosave_persists_remaps_in_background() {
    let dev = spare_device();
    let mut config = manual_config(8);
    config.autosave.enabled = true;
    config.autosave.debounce_ms = 20;
    let target = active_target(config, &dev).await;

    target.remap(77).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(!target.store().unwrap().is_dirty());
    assert_eq!(target.scheduler().unwrap().stats().saves_ok, 1);

    let reader = store_on(&dev);
    reader.read().await.unwrap();
    assert_eq!(reader.find_entry(77), Some(METADATA_SECTORS));
    target.shutdown().await.unwrap();
}
