//! The concrete playbook catalogue (closed set).
//!
//! Construction is by explicit factory: [`register_all`] builds every
//! playbook against one [`PlaybookHost`] and registers it. Nothing is
//! discovered by scanning.

pub mod core_files;
pub mod database;
pub mod disk;
pub mod maintenance;
pub mod plugins;
pub mod restore;
pub mod services;
pub mod themes;
pub mod wp_config;

use std::sync::Arc;

use crate::host::PlaybookHost;
use crate::registry::PlaybookRegistry;

pub use core_files::{CoreIntegrityRestore, HtaccessRegenerate};
pub use database::DbTableRepair;
pub use disk::DiskSpaceCleanup;
pub use maintenance::MaintenanceMode;
pub use plugins::{PluginConflictDetection, PluginDeactivation};
pub use restore::SiteRestoreFromBackup;
pub use services::{DbConnectionRestart, ObjectCacheFlush, WebServerRestart};
pub use themes::{ThemeRollback, ThemeSwitchDefault};
pub use wp_config::{MemoryLimitIncrease, PhpErrorVisibility, WpConfigValidate};

/// Build and register the whole catalogue.
pub fn register_all(registry: &PlaybookRegistry, host: &PlaybookHost) {
    // Tier 1: cheap, reversible or reversibility-waived.
    registry.register(Arc::new(DiskSpaceCleanup::new(host.clone())));
    registry.register(Arc::new(MemoryLimitIncrease::new(host.clone())));
    registry.register(Arc::new(PhpErrorVisibility::new(host.clone())));
    registry.register(Arc::new(WebServerRestart::new(host.clone())));
    registry.register(Arc::new(DbConnectionRestart::new(host.clone())));
    registry.register(Arc::new(ObjectCacheFlush::new(host.clone())));
    // Tier 2: integrity and configuration repair.
    registry.register(Arc::new(CoreIntegrityRestore::new(host.clone())));
    registry.register(Arc::new(WpConfigValidate::new(host.clone())));
    registry.register(Arc::new(DbTableRepair::new(host.clone())));
    registry.register(Arc::new(HtaccessRegenerate::new(host.clone())));
    // Tier 3: plugin/theme surgery.
    registry.register(Arc::new(PluginConflictDetection::new(host.clone())));
    registry.register(Arc::new(PluginDeactivation::new(host.clone())));
    registry.register(Arc::new(ThemeSwitchDefault::new(host.clone())));
    registry.register(Arc::new(ThemeRollback::new(host.clone())));
    // Tier 4: restore from durable backups.
    registry.register(Arc::new(SiteRestoreFromBackup::new(host.clone())));
    // Tier 5: stop the bleeding.
    registry.register(Arc::new(MaintenanceMode::new(host.clone())));
}
