//! In-memory module store

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::module::descriptor::{ConfigMap, InstalledVersion, ModuleConfiguration, ModuleDescriptor};
use crate::module::registry::RegistryEntry;
use crate::module::store::ModuleStore;
use crate::module::traits::{ModuleError, ModuleKey};
use crate::utils::current_timestamp;

/// Process-local store; contents are lost on restart
#[derive(Default)]
pub struct MemoryModuleStore {
    descriptors: RwLock<BTreeMap<ModuleKey, ModuleDescriptor>>,
    configurations: RwLock<HashMap<ModuleKey, ModuleConfiguration>>,
    versions: RwLock<HashMap<ModuleKey, Vec<InstalledVersion>>>,
    registry: RwLock<BTreeMap<String, RegistryEntry>>,
}

impl MemoryModuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModuleStore for MemoryModuleStore {
    async fn get_descriptor(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<ModuleDescriptor>, ModuleError> {
        Ok(self
            .descriptors
            .read()
            .await
            .get(&ModuleKey::new(tenant, name))
            .cloned())
    }

    async fn upsert_descriptor(&self, descriptor: &ModuleDescriptor) -> Result<(), ModuleError> {
        self.descriptors
            .write()
            .await
            .insert(descriptor.key(), descriptor.clone());
        Ok(())
    }

    async fn get_configuration(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<ModuleConfiguration>, ModuleError> {
        Ok(self
            .configurations
            .read()
            .await
            .get(&ModuleKey::new(tenant, name))
            .cloned())
    }

    async fn upsert_configuration(
        &self,
        tenant: &str,
        name: &str,
        data: &ConfigMap,
    ) -> Result<(), ModuleError> {
        self.configurations.write().await.insert(
            ModuleKey::new(tenant, name),
            ModuleConfiguration {
                tenant: tenant.to_string(),
                name: name.to_string(),
                data: data.clone(),
                updated_at: current_timestamp(),
            },
        );
        Ok(())
    }

    async fn delete_descriptor_and_configuration(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<(), ModuleError> {
        let key = ModuleKey::new(tenant, name);
        self.descriptors.write().await.remove(&key);
        self.configurations.write().await.remove(&key);
        self.versions.write().await.remove(&key);
        Ok(())
    }

    async fn list_descriptors(&self, tenant: &str) -> Result<Vec<ModuleDescriptor>, ModuleError> {
        Ok(self
            .descriptors
            .read()
            .await
            .values()
            .filter(|d| d.tenant == tenant)
            .cloned()
            .collect())
    }

    async fn record_version(
        &self,
        tenant: &str,
        name: &str,
        version: InstalledVersion,
    ) -> Result<(), ModuleError> {
        self.versions
            .write()
            .await
            .entry(ModuleKey::new(tenant, name))
            .or_default()
            .push(version);
        Ok(())
    }

    async fn version_history(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Vec<InstalledVersion>, ModuleError> {
        Ok(self
            .versions
            .read()
            .await
            .get(&ModuleKey::new(tenant, name))
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_registry_entry(&self, entry: &RegistryEntry) -> Result<(), ModuleError> {
        self.registry
            .write()
            .await
            .insert(entry.name.clone(), entry.clone());
        Ok(())
    }

    async fn list_registry_entries(&self) -> Result<Vec<RegistryEntry>, ModuleError> {
        Ok(self.registry.read().await.values().cloned().collect())
    }
}
