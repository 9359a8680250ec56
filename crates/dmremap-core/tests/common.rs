//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use dmremap_core::{AutosaveConfig, MemBlockDevice, RemapTarget, TargetConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Spare device size used by the fixtures, in sectors
pub const SPARE_SECTORS: u64 = 1024;
/// Main device size used by the fixtures, in sectors
pub const MAIN_SECTORS: u64 = 1 << 20;

/// Installs a test-friendly subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// Target config with a pool of `pool_len` sectors right after the metadata
/// region and auto-save switched off, so tests control every write.
pub fn manual_config(pool_len: u64) -> TargetConfig {
    let mut config = TargetConfig::new(MAIN_SECTORS, SPARE_SECTORS, pool_len);
    config.autosave = AutosaveConfig {
        enabled: false,
        ..AutosaveConfig::default()
    };
    config
}

/// A blank in-memory spare device.
pub fn spare_device() -> Arc<MemBlockDevice> {
    init_tracing();
    Arc::new(MemBlockDevice::new(SPARE_SECTORS))
}

/// An activated target persisting to `dev`.
pub async fn active_target(config: TargetConfig, dev: &Arc<MemBlockDevice>) -> RemapTarget {
    let target = RemapTarget::with_metadata(config, dev.clone()).unwrap();
    target.activate().await.unwrap();
    target
}
