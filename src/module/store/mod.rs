//! Persistence for module installations
//!
//! Descriptors, configurations and version history, one set per
//! (tenant, module name), plus the catalogue entries of the registry. The
//! manager is the only writer of installation state.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};
use crate::module::descriptor::{ConfigMap, InstalledVersion, ModuleConfiguration, ModuleDescriptor};
use crate::module::registry::RegistryEntry;
use crate::module::traits::{ModuleError, ModuleStatus};

pub mod memory;
#[cfg(feature = "redb")]
pub mod redb;

pub use memory::MemoryModuleStore;
#[cfg(feature = "redb")]
pub use self::redb::RedbModuleStore;

/// Persistence collaborator used by the manager
#[async_trait]
pub trait ModuleStore: Send + Sync {
    async fn get_descriptor(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<ModuleDescriptor>, ModuleError>;

    async fn upsert_descriptor(&self, descriptor: &ModuleDescriptor) -> Result<(), ModuleError>;

    async fn get_configuration(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<ModuleConfiguration>, ModuleError>;

    async fn upsert_configuration(
        &self,
        tenant: &str,
        name: &str,
        data: &ConfigMap,
    ) -> Result<(), ModuleError>;

    /// Remove descriptor, configuration and version history
    async fn delete_descriptor_and_configuration(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<(), ModuleError>;

    /// Every descriptor of `tenant`, sorted by name
    async fn list_descriptors(&self, tenant: &str) -> Result<Vec<ModuleDescriptor>, ModuleError>;

    async fn list_active_descriptors(
        &self,
        tenant: &str,
    ) -> Result<Vec<ModuleDescriptor>, ModuleError> {
        Ok(self
            .list_descriptors(tenant)
            .await?
            .into_iter()
            .filter(|d| d.status == ModuleStatus::Active)
            .collect())
    }

    async fn record_version(
        &self,
        tenant: &str,
        name: &str,
        version: InstalledVersion,
    ) -> Result<(), ModuleError>;

    /// Version history, oldest first
    async fn version_history(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Vec<InstalledVersion>, ModuleError>;

    /// Persist one catalogue entry, replacing any entry with the same name
    async fn upsert_registry_entry(&self, entry: &RegistryEntry) -> Result<(), ModuleError>;

    /// Every persisted catalogue entry, sorted by name
    async fn list_registry_entries(&self) -> Result<Vec<RegistryEntry>, ModuleError>;
}

/// Open the configured store backend
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn ModuleStore>, ModuleError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryModuleStore::new())),
        #[cfg(feature = "redb")]
        StoreBackend::Redb => Ok(Arc::new(RedbModuleStore::open(&config.path)?)),
        #[cfg(not(feature = "redb"))]
        StoreBackend::Redb => Err(ModuleError::Storage(
            "redb backend requested but the 'redb' feature is disabled".to_string(),
        )),
    }
}
