//! redb-backed module store
//!
//! Installation rows are keyed by `tenant \x1f name`, catalogue rows by module
//! name; values are JSON documents.

use ::redb::{Database, ReadableTable, TableDefinition};
use async_trait::async_trait;
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::module::descriptor::{ConfigMap, InstalledVersion, ModuleConfiguration, ModuleDescriptor};
use crate::module::registry::RegistryEntry;
use crate::module::store::ModuleStore;
use crate::module::traits::ModuleError;
use crate::utils::current_timestamp;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

static DESCRIPTORS_TABLE: JsonTable = TableDefinition::new("descriptors");
static CONFIGURATIONS_TABLE: JsonTable = TableDefinition::new("configurations");
static VERSIONS_TABLE: JsonTable = TableDefinition::new("versions");
static REGISTRY_TABLE: JsonTable = TableDefinition::new("registry");

const KEY_SEPARATOR: char = '\x1f';

fn row_key(tenant: &str, name: &str) -> String {
    format!("{}{}{}", tenant, KEY_SEPARATOR, name)
}

fn storage_err<E: Display>(e: E) -> ModuleError {
    ModuleError::Storage(e.to_string())
}

/// Module store persisted in a redb database file
pub struct RedbModuleStore {
    db: Arc<Database>,
}

impl RedbModuleStore {
    /// Open or create the database and make sure every table exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path).map_err(storage_err)?;
        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            write_txn.open_table(DESCRIPTORS_TABLE).map_err(storage_err)?;
            write_txn.open_table(CONFIGURATIONS_TABLE).map_err(storage_err)?;
            write_txn.open_table(VERSIONS_TABLE).map_err(storage_err)?;
            write_txn.open_table(REGISTRY_TABLE).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;

        info!("Opened module store at {:?}", path);
        Ok(Self { db: Arc::new(db) })
    }

    fn put(
        &self,
        table: JsonTable,
        key: &str,
        value: &[u8],
    ) -> Result<(), ModuleError> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(table).map_err(storage_err)?;
            table.insert(key, value).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn fetch(
        &self,
        table: JsonTable,
        key: &str,
    ) -> Result<Option<Vec<u8>>, ModuleError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(table).map_err(storage_err)?;
        let value = table
            .get(key)
            .map_err(storage_err)?
            .map(|v| v.value().to_vec());
        Ok(value)
    }
}

#[async_trait]
impl ModuleStore for RedbModuleStore {
    async fn get_descriptor(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<ModuleDescriptor>, ModuleError> {
        self.fetch(DESCRIPTORS_TABLE, &row_key(tenant, name))?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(ModuleError::from))
            .transpose()
    }

    async fn upsert_descriptor(&self, descriptor: &ModuleDescriptor) -> Result<(), ModuleError> {
        let bytes = serde_json::to_vec(descriptor)?;
        self.put(
            DESCRIPTORS_TABLE,
            &row_key(&descriptor.tenant, &descriptor.name),
            &bytes,
        )
    }

    async fn get_configuration(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<ModuleConfiguration>, ModuleError> {
        self.fetch(CONFIGURATIONS_TABLE, &row_key(tenant, name))?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(ModuleError::from))
            .transpose()
    }

    async fn upsert_configuration(
        &self,
        tenant: &str,
        name: &str,
        data: &ConfigMap,
    ) -> Result<(), ModuleError> {
        let configuration = ModuleConfiguration {
            tenant: tenant.to_string(),
            name: name.to_string(),
            data: data.clone(),
            updated_at: current_timestamp(),
        };
        let bytes = serde_json::to_vec(&configuration)?;
        self.put(CONFIGURATIONS_TABLE, &row_key(tenant, name), &bytes)
    }

    async fn delete_descriptor_and_configuration(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<(), ModuleError> {
        let key = row_key(tenant, name);
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        for definition in [DESCRIPTORS_TABLE, CONFIGURATIONS_TABLE, VERSIONS_TABLE] {
            let mut table = write_txn.open_table(definition).map_err(storage_err)?;
            table.remove(key.as_str()).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    async fn list_descriptors(&self, tenant: &str) -> Result<Vec<ModuleDescriptor>, ModuleError> {
        let prefix = format!("{}{}", tenant, KEY_SEPARATOR);
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(DESCRIPTORS_TABLE).map_err(storage_err)?;

        let mut descriptors = Vec::new();
        for entry in table.range::<&str>(prefix.as_str()..).map_err(storage_err)? {
            let (key, value) = entry.map_err(storage_err)?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            descriptors.push(serde_json::from_slice(value.value())?);
        }
        Ok(descriptors)
    }

    async fn record_version(
        &self,
        tenant: &str,
        name: &str,
        version: InstalledVersion,
    ) -> Result<(), ModuleError> {
        let mut history = self.version_history(tenant, name).await?;
        history.push(version);
        let bytes = serde_json::to_vec(&history)?;
        self.put(VERSIONS_TABLE, &row_key(tenant, name), &bytes)
    }

    async fn version_history(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Vec<InstalledVersion>, ModuleError> {
        match self.fetch(VERSIONS_TABLE, &row_key(tenant, name))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn upsert_registry_entry(&self, entry: &RegistryEntry) -> Result<(), ModuleError> {
        let bytes = serde_json::to_vec(entry)?;
        self.put(REGISTRY_TABLE, &entry.name, &bytes)
    }

    async fn list_registry_entries(&self) -> Result<Vec<RegistryEntry>, ModuleError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(REGISTRY_TABLE).map_err(storage_err)?;

        let mut entries = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let (_, value) = entry.map_err(storage_err)?;
            entries.push(serde_json::from_slice(value.value())?);
        }
        Ok(entries)
    }
}
