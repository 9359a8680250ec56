//! One remap target instance: table, router and optional persistence.

use std::sync::Arc;

use tracing::{info, warn};

use crate::autosave::AutosaveScheduler;
use crate::block_io::DeviceHandle;
use crate::config::TargetConfig;
use crate::control::{verify_reply, ControlCommand};
use crate::error::{RemapError, RemapResult};
use crate::io_path::{IoDecision, IoPathStats, IoRequest, IoRouter};
use crate::metadata::MetadataStore;
use crate::reconcile;
use crate::table::{RemapReason, RemapTable, TableStatus};

struct Persistence {
    store: Arc<MetadataStore>,
    scheduler: AutosaveScheduler,
}

/// A remap target owning its table and, when a spare device is attached,
/// the metadata store and auto-save scheduler that persist it.
pub struct RemapTarget {
    config: TargetConfig,
    table: Arc<RemapTable>,
    router: IoRouter,
    persistence: Option<Persistence>,
}

impl RemapTarget {
    /// Creates a target without persistence.
    pub fn new(config: TargetConfig) -> RemapResult<Self> {
        config.validate(false)?;
        let table = Arc::new(RemapTable::new(config.spare_pool));
        let reserved = config.protect_spare_range.then_some(config.spare_pool);
        let router = IoRouter::new(table.clone(), reserved);
        Ok(Self {
            config,
            table,
            router,
            persistence: None,
        })
    }

    /// Creates a target persisting its table to the start of `spare`.
    ///
    /// Call [`activate`](Self::activate) before routing I/O.
    pub fn with_metadata(config: TargetConfig, spare: DeviceHandle) -> RemapResult<Self> {
        config.validate(true)?;
        if spare.size_sectors() < config.spare_pool.end() {
            return Err(RemapError::InvalidConfig {
                reason: format!(
                    "spare device has {} sectors, pool {} does not fit",
                    spare.size_sectors(),
                    config.spare_pool
                ),
            });
        }
        let store = Arc::new(MetadataStore::create(
            spare,
            config.main_sectors,
            config.spare_sectors,
            config.metadata.clone(),
        )?);
        let scheduler = AutosaveScheduler::init(config.autosave.clone(), store.clone());

        let mut target = Self::new(config)?;
        target.table.set_sink(store.clone());
        target.persistence = Some(Persistence { store, scheduler });
        Ok(target)
    }

    fn persistence(&self) -> RemapResult<&Persistence> {
        self.persistence.as_ref().ok_or(RemapError::NoMetadata)
    }

    /// Loads persisted remaps into the table and starts auto-save.
    ///
    /// A blank spare device (all-zero magic) is initialized with a fresh
    /// header. Any other integrity failure is returned so the operator can
    /// choose between aborting and [`recover_metadata`](Self::recover_metadata).
    /// Returns the number of remaps restored.
    pub async fn activate(&self) -> RemapResult<usize> {
        let Some(p) = self.persistence.as_ref() else {
            return Ok(0);
        };

        let restored = match p.store.read().await {
            Ok(()) => reconcile::restore_table_from_metadata(&self.table, &p.store),
            Err(RemapError::BadMagic { found }) if found == [0u8; 8] => {
                info!("blank spare device, writing fresh metadata");
                p.store.mark_dirty();
                p.store.write().await?;
                0
            }
            Err(e) => {
                warn!(error = %e, "metadata unusable, target not activated");
                return Err(e);
            }
        };

        p.scheduler.start();
        info!(restored, status = %self.table.status(), "remap target active");
        Ok(restored)
    }

    /// Routes one I/O.
    pub fn map_io(&self, req: &IoRequest) -> IoDecision {
        self.router.route(req)
    }

    /// Reports a failed completion for an I/O starting at `sector`.
    pub fn complete_io_error(&self, sector: u64) {
        self.router.complete_with_error(sector);
    }

    /// Remaps `sector` on operator request. Returns the spare sector.
    pub fn remap(&self, sector: u64) -> RemapResult<u64> {
        self.table.remap(sector, RemapReason::Manual)
    }

    /// Remaps `sector` on behalf of a health monitor.
    pub fn report_bad_sector(&self, sector: u64) -> RemapResult<u64> {
        self.table.remap(sector, RemapReason::AutoDetected)
    }

    /// Inserts a precomputed mapping.
    pub fn load(&self, main_sector: u64, spare_sector: u64, valid: bool) -> RemapResult<()> {
        self.table.load(main_sector, spare_sector, valid)
    }

    /// Drops every remap.
    pub fn clear(&self) {
        self.table.clear();
    }

    /// `"remapped to <spare> valid=<0|1>"` or `"not remapped"`.
    pub fn verify(&self, sector: u64) -> String {
        verify_reply(self.table.lookup(sector).as_ref())
    }

    /// Table usage.
    pub fn status(&self) -> TableStatus {
        self.table.status()
    }

    /// Copies the table into metadata and saves it before returning.
    pub async fn sync_metadata(&self) -> RemapResult<usize> {
        let p = self.persistence()?;
        reconcile::sync_table_to_metadata(&self.table, &p.scheduler).await
    }

    /// Saves metadata now if it is dirty.
    pub async fn save(&self) -> RemapResult<()> {
        self.persistence()?.scheduler.force().await
    }

    /// Discards persisted remaps and writes a fresh header.
    ///
    /// The in-memory table is untouched; follow with
    /// [`sync_metadata`](Self::sync_metadata) to persist it again.
    pub async fn recover_metadata(&self) -> RemapResult<()> {
        self.persistence()?.store.recover().await
    }

    /// Number of live remaps missing from or disagreeing with metadata.
    pub fn check_consistency(&self) -> RemapResult<usize> {
        let p = self.persistence()?;
        Ok(reconcile::validate_consistency(&self.table, &p.store))
    }

    /// Parses and executes a control message, returning the reply text.
    pub async fn handle_message(&self, message: &str) -> RemapResult<String> {
        let cmd: ControlCommand = message.parse()?;
        let reply = match cmd {
            ControlCommand::Remap { sector } => {
                let spare = self.remap(sector)?;
                format!("remapped to {} valid=0", spare)
            }
            ControlCommand::Load {
                main_sector,
                spare_sector,
                valid,
            } => {
                self.load(main_sector, spare_sector, valid)?;
                self.verify(main_sector)
            }
            ControlCommand::Clear => {
                self.clear();
                "cleared".to_string()
            }
            ControlCommand::Verify { sector } => self.verify(sector),
            ControlCommand::Status => self.status().to_string(),
            ControlCommand::Sync => format!("synced {}", self.sync_metadata().await?),
            ControlCommand::Save => {
                self.save().await?;
                "saved".to_string()
            }
        };
        Ok(reply)
    }

    /// Stops auto-save and writes any outstanding metadata.
    pub async fn shutdown(self) -> RemapResult<()> {
        let Some(p) = self.persistence else {
            return Ok(());
        };
        p.scheduler.stop().await;
        let result = p.store.sync().await;
        if let Err(e) = &result {
            warn!(error = %e, "final metadata save failed");
        }
        self.table.clear_sink();
        p.scheduler.cleanup().await;
        info!("remap target shut down");
        result
    }

    /// The remap table.
    pub fn table(&self) -> &Arc<RemapTable> {
        &self.table
    }

    /// Routing counters.
    pub fn io_stats(&self) -> IoPathStats {
        self.router.stats()
    }

    /// The metadata store, if attached.
    pub fn store(&self) -> Option<&Arc<MetadataStore>> {
        self.persistence.as_ref().map(|p| &p.store)
    }

    /// The auto-save scheduler, if attached.
    pub fn scheduler(&self) -> Option<&AutosaveScheduler> {
        self.persistence.as_ref().map(|p| &p.scheduler)
    }

    /// Configuration this target was built from.
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::MemBlockDevice;
    use crate::config::AutosaveConfig;
    use crate::io_path::RejectReason;

    fn config() -> TargetConfig {
        let mut config = TargetConfig::new(1 << 20, 512, 16);
        config.autosave = AutosaveConfig {
            enabled: false,
            ..AutosaveConfig::default()
        };
        config
    }

    #[tokio::test]
    async fn test_without_metadata() {
        let target = RemapTarget::new(config()).unwrap();
        assert_eq!(target.activate().await.unwrap(), 0);
        let spare = target.remap(10).unwrap();
        assert_eq!(
            target.map_io(&IoRequest::write(10, 1)),
            IoDecision::Redirect { spare_sector: spare }
        );
        assert!(matches!(target.save().await, Err(RemapError::NoMetadata)));
        assert!(matches!(target.check_consistency(), Err(RemapError::NoMetadata)));
        target.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_activate_blank_device() {
        let dev = Arc::new(MemBlockDevice::new(512));
        let target = RemapTarget::with_metadata(config(), dev.clone()).unwrap();
        assert_eq!(target.activate().await.unwrap(), 0);
        let store = target.store().unwrap();
        assert!(!store.is_dirty());
        assert_eq!(store.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_remap_persists_across_restart() {
        let dev = Arc::new(MemBlockDevice::new(512));
        let target = RemapTarget::with_metadata(config(), dev.clone()).unwrap();
        target.activate().await.unwrap();
        let spare = target.remap(100).unwrap();
        target.load(200, 140, true).unwrap();
        assert_eq!(target.check_consistency().unwrap(), 0);
        target.shutdown().await.unwrap();

        let again = RemapTarget::with_metadata(config(), dev).unwrap();
        assert_eq!(again.activate().await.unwrap(), 2);
        assert_eq!(again.verify(100), format!("remapped to {} valid=1", spare));
        assert_eq!(again.verify(200), "remapped to 140 valid=1");
        assert_eq!(again.status().spare_used, 2);
    }

    #[tokio::test]
    async fn test_activate_surfaces_corruption() {
        let dev = Arc::new(MemBlockDevice::new(512));
        let target = RemapTarget::with_metadata(config(), dev.clone()).unwrap();
        target.activate().await.unwrap();
        target.remap(5).unwrap();
        target.shutdown().await.unwrap();

        dev.corrupt_byte(crate::layout::ENTRIES_SECTOR as usize * 512, 0x01);
        let again = RemapTarget::with_metadata(config(), dev).unwrap();
        let err = again.activate().await.unwrap_err();
        assert!(err.is_integrity());

        again.recover_metadata().await.unwrap();
        assert_eq!(again.store().unwrap().entry_count(), 0);
        assert_eq!(again.verify(5), "not remapped");
    }

    #[tokio::test]
    async fn test_handle_message() {
        let dev = Arc::new(MemBlockDevice::new(512));
        let target = RemapTarget::with_metadata(config(), dev).unwrap();
        target.activate().await.unwrap();

        assert_eq!(
            target.handle_message("remap 100").await.unwrap(),
            "remapped to 128 valid=0"
        );
        assert!(target.handle_message("remap 100").await.unwrap_err().is_duplicate());
        assert_eq!(
            target.handle_message("load 200 130 1").await.unwrap(),
            "remapped to 130 valid=1"
        );
        assert_eq!(
            target.handle_message("status").await.unwrap(),
            "remapped=2 lost=1 spare_used=1/16 (6%)"
        );
        assert_eq!(target.handle_message("sync").await.unwrap(), "synced 2");
        assert_eq!(target.handle_message("save").await.unwrap(), "saved");
        assert_eq!(target.handle_message("verify 7").await.unwrap(), "not remapped");
        assert_eq!(target.handle_message("clear").await.unwrap(), "cleared");
        assert_eq!(target.status().remapped, 0);
        assert!(matches!(
            target.handle_message("bogus").await,
            Err(RemapError::InvalidCommand { .. })
        ));
    }

    #[tokio::test]
    async fn test_report_bad_sector_and_completion_errors() {
        let dev = Arc::new(MemBlockDevice::new(512));
        let target = RemapTarget::with_metadata(config(), dev).unwrap();
        target.activate().await.unwrap();

        let spare = target.report_bad_sector(42).unwrap();
        let entry = target.table().lookup(42).unwrap();
        assert_eq!(entry.remap_reason, RemapReason::AutoDetected);
        assert!(!entry.valid);
        assert_eq!(target.store().unwrap().find_entry(42), Some(spare));
        assert!(target.report_bad_sector(42).unwrap_err().is_duplicate());

        target.complete_io_error(42);
        target.complete_io_error(43);
        assert_eq!(target.table().lookup(42).unwrap().error_count, 1);
        assert!(target.table().lookup(43).is_none());
        assert_eq!(target.io_stats().completion_errors, 2);
    }

    #[tokio::test]
    async fn test_reserved_area_protected() {
        let target = RemapTarget::new(config()).unwrap();
        assert_eq!(
            target.map_io(&IoRequest::read(130, 1)),
            IoDecision::Reject(RejectReason::ReservedArea)
        );
        assert_eq!(target.io_stats().rejected_reserved, 1);
    }

    #[test]
    fn test_spare_device_too_small() {
        let dev = Arc::new(MemBlockDevice::new(136));
        assert!(matches!(
            RemapTarget::with_metadata(config(), dev),
            Err(RemapError::InvalidConfig { .. })
        ));
    }
}
