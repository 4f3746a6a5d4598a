//! Module catalogue
//!
//! Durable list of known modules and their published versions. Pure data
//! access: nothing here ever executes module code.
//!
//! A registry opened over a [`ModuleStore`] writes every changed entry through
//! before it becomes visible, and reloads the catalogue on open.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::module::descriptor::ConfigMap;
use crate::module::registry::discovery::DiscoveredModule;
use crate::module::store::ModuleStore;
use crate::module::traits::ModuleError;
use crate::module::validation::{is_valid_version, ManifestValidator};
use crate::utils::current_timestamp;

/// Human-readable and structural metadata of a catalogue entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Installations of this module are load-bearing
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub config_schema: serde_json::Value,
    #[serde(default)]
    pub default_config: ConfigMap,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub min_host_version: Option<String>,
    #[serde(default)]
    pub max_host_version: Option<String>,
}

/// One published version of a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    #[serde(default)]
    pub changelog: String,
    /// Artifact directory for this version
    pub artifact_path: PathBuf,
    /// Offered for installation
    #[serde(default = "default_true")]
    pub available: bool,
    /// Publisher-declared compatibility with current hosts
    #[serde(default = "default_true")]
    pub compatible: bool,
    pub published_at: u64,
}

fn default_true() -> bool {
    true
}

impl VersionRecord {
    pub fn new(version: impl Into<String>, artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            version: version.into(),
            changelog: String::new(),
            artifact_path: artifact_path.into(),
            available: true,
            compatible: true,
            published_at: current_timestamp(),
        }
    }
}

/// Catalogue entry, keyed by globally unique module name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub metadata: RegistryMetadata,
    /// Versions in publication order
    pub versions: Vec<VersionRecord>,
    /// Highest available version
    pub latest_version: Option<String>,
}

impl RegistryEntry {
    pub fn version(&self, version: &str) -> Option<&VersionRecord> {
        self.versions.iter().find(|v| v.version == version)
    }

    fn refresh_latest(&mut self) {
        self.latest_version = self
            .versions
            .iter()
            .filter(|v| v.available)
            .filter_map(|v| semver::Version::parse(&v.version).ok().map(|p| (p, &v.version)))
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, v)| v.clone());
    }
}

/// Catalogue of modules
pub struct ModuleRegistry {
    entries: RwLock<BTreeMap<String, RegistryEntry>>,
    validator: ManifestValidator,
    /// Write-through persistence; `None` keeps the catalogue in memory only
    store: Option<Arc<dyn ModuleStore>>,
}

impl ModuleRegistry {
    /// Catalogue that lives only as long as this process
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            validator: ManifestValidator::new(),
            store: None,
        }
    }

    /// Catalogue persisted in `store`, loaded with every entry saved earlier
    pub async fn open(store: Arc<dyn ModuleStore>) -> Result<Self, ModuleError> {
        let entries: BTreeMap<String, RegistryEntry> = store
            .list_registry_entries()
            .await?
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();
        info!("Loaded {} registry entries", entries.len());

        Ok(Self {
            entries: RwLock::new(entries),
            validator: ManifestValidator::new(),
            store: Some(store),
        })
    }

    async fn persist(&self, entry: &RegistryEntry) -> Result<(), ModuleError> {
        match &self.store {
            Some(store) => store.upsert_registry_entry(entry).await,
            None => Ok(()),
        }
    }

    /// Create or update an entry; existing versions are preserved
    pub async fn register(&self, name: &str, metadata: RegistryMetadata) -> Result<(), ModuleError> {
        let errors = self.validate_metadata(name, &metadata);
        if !errors.is_empty() {
            return Err(ModuleError::InvalidManifest(errors.join("; ")));
        }

        let mut entries = self.entries.write().await;
        let entry = match entries.get(name) {
            Some(existing) => {
                debug!("Updating registry entry {}", name);
                RegistryEntry {
                    metadata,
                    ..existing.clone()
                }
            }
            None => {
                info!("Registering module {}", name);
                RegistryEntry {
                    name: name.to_string(),
                    metadata,
                    versions: Vec::new(),
                    latest_version: None,
                }
            }
        };
        self.persist(&entry).await?;
        entries.insert(name.to_string(), entry);
        Ok(())
    }

    /// Publish a version; a duplicate version string replaces the earlier record
    pub async fn add_version(&self, name: &str, record: VersionRecord) -> Result<(), ModuleError> {
        if !is_valid_version(&record.version) {
            return Err(ModuleError::InvalidManifest(format!(
                "Invalid version format: {} (expected major.minor.patch[-pre][+build])",
                record.version
            )));
        }

        let mut entries = self.entries.write().await;
        let mut entry = entries
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?;

        match entry.versions.iter_mut().find(|v| v.version == record.version) {
            Some(existing) => {
                debug!("Replacing version {} of {}", record.version, name);
                *existing = record;
            }
            None => {
                info!("Adding version {} of {}", record.version, name);
                entry.versions.push(record);
            }
        }
        entry.refresh_latest();
        self.persist(&entry).await?;
        entries.insert(name.to_string(), entry);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.read().await.get(name).cloned()
    }

    /// Case-insensitive match on name, description and tags
    pub async fn search(&self, query: &str) -> Vec<RegistryEntry> {
        let needle = query.trim().to_lowercase();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| {
                needle.is_empty()
                    || entry.name.to_lowercase().contains(&needle)
                    || entry.metadata.description.to_lowercase().contains(&needle)
                    || entry
                        .metadata
                        .tags
                        .iter()
                        .any(|t| t.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect()
    }

    pub async fn latest_version(&self, name: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(name)
            .and_then(|e| e.latest_version.clone())
    }

    pub fn validate_metadata(&self, name: &str, metadata: &RegistryMetadata) -> Vec<String> {
        self.validator.validate_metadata(name, metadata)
    }

    /// Publish discovered artifacts as catalogue entries
    ///
    /// Metadata of already-registered modules is kept; only the version record
    /// is upserted. Returns the number of versions published.
    pub async fn publish_discovered(&self, discovered: &[DiscoveredModule]) -> usize {
        let mut published = 0;
        for module in discovered {
            let name = &module.manifest.name;
            if self.get(name).await.is_none() {
                let metadata = RegistryMetadata {
                    description: module.manifest.description.clone().unwrap_or_default(),
                    author: module.manifest.author.clone().unwrap_or_default(),
                    ..RegistryMetadata::default()
                };
                if let Err(e) = self.register(name, metadata).await {
                    warn!("Skipping discovered module {}: {}", name, e);
                    continue;
                }
            }

            let record = VersionRecord::new(module.manifest.version.clone(), module.directory.clone());
            match self.add_version(name, record).await {
                Ok(()) => published += 1,
                Err(e) => warn!("Skipping discovered module {}: {}", name, e),
            }
        }
        published
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::store::MemoryModuleStore;

    #[tokio::test]
    async fn test_register_is_upsert_and_keeps_versions() {
        let registry = ModuleRegistry::new();
        registry.register("billing", RegistryMetadata::default()).await.unwrap();
        registry
            .add_version("billing", VersionRecord::new("1.0.0", "/artifacts/billing"))
            .await
            .unwrap();

        let metadata = RegistryMetadata {
            description: "Invoices".to_string(),
            ..RegistryMetadata::default()
        };
        registry.register("billing", metadata).await.unwrap();

        let entry = registry.get("billing").await.unwrap();
        assert_eq!(entry.metadata.description, "Invoices");
        assert_eq!(entry.versions.len(), 1);
    }

    #[tokio::test]
    async fn test_add_version_replaces_duplicates_and_tracks_latest() {
        let registry = ModuleRegistry::new();
        registry.register("billing", RegistryMetadata::default()).await.unwrap();

        for v in ["1.0.0", "1.10.0", "1.2.0"] {
            registry
                .add_version("billing", VersionRecord::new(v, format!("/a/{}", v)))
                .await
                .unwrap();
        }
        assert_eq!(registry.latest_version("billing").await.as_deref(), Some("1.10.0"));

        let mut replacement = VersionRecord::new("1.10.0", "/a/replaced");
        replacement.available = false;
        registry.add_version("billing", replacement).await.unwrap();

        let entry = registry.get("billing").await.unwrap();
        assert_eq!(entry.versions.len(), 3);
        assert_eq!(
            entry.version("1.10.0").unwrap().artifact_path,
            PathBuf::from("/a/replaced")
        );
        assert_eq!(entry.latest_version.as_deref(), Some("1.2.0"));
    }

    #[tokio::test]
    async fn test_add_version_rejects_bad_grammar() {
        let registry = ModuleRegistry::new();
        registry.register("billing", RegistryMetadata::default()).await.unwrap();
        let err = registry
            .add_version("billing", VersionRecord::new("1.0", "/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidManifest(_)));
    }

    #[tokio::test]
    async fn test_search_matches_tags_and_description() {
        let registry = ModuleRegistry::new();
        registry
            .register(
                "billing",
                RegistryMetadata {
                    description: "Invoice generation".to_string(),
                    tags: vec!["Finance".to_string()],
                    ..RegistryMetadata::default()
                },
            )
            .await
            .unwrap();
        registry.register("crm", RegistryMetadata::default()).await.unwrap();

        assert_eq!(registry.search("finance").await.len(), 1);
        assert_eq!(registry.search("INVOICE").await.len(), 1);
        assert_eq!(registry.search("").await.len(), 2);
        assert!(registry.search("payroll").await.is_empty());
    }

    #[tokio::test]
    async fn test_opened_registry_sees_entries_saved_earlier() {
        let store: Arc<dyn ModuleStore> = Arc::new(MemoryModuleStore::new());
        {
            let registry = ModuleRegistry::open(store.clone()).await.unwrap();
            registry.register("billing", RegistryMetadata::default()).await.unwrap();
            registry
                .add_version("billing", VersionRecord::new("1.0.0", "/a/1.0.0"))
                .await
                .unwrap();
            registry
                .add_version("billing", VersionRecord::new("1.1.0", "/a/1.1.0"))
                .await
                .unwrap();
        }

        let reopened = ModuleRegistry::open(store.clone()).await.unwrap();
        let entry = reopened.get("billing").await.unwrap();
        assert_eq!(entry.versions.len(), 2);
        assert_eq!(entry.latest_version.as_deref(), Some("1.1.0"));
        assert_eq!(store.list_registry_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_version_is_not_persisted() {
        let store: Arc<dyn ModuleStore> = Arc::new(MemoryModuleStore::new());
        let registry = ModuleRegistry::open(store.clone()).await.unwrap();
        registry.register("billing", RegistryMetadata::default()).await.unwrap();
        registry
            .add_version("billing", VersionRecord::new("1.0", "/a"))
            .await
            .unwrap_err();

        let saved = store.list_registry_entries().await.unwrap();
        assert!(saved[0].versions.is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_metadata() {
        let registry = ModuleRegistry::new();
        let err = registry
            .register("bad name", RegistryMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidManifest(_)));
        assert!(registry.get("bad name").await.is_none());
    }
}
