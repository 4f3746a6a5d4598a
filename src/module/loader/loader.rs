//! Module loader implementation
//!
//! Turns an artifact directory into a verified, executable unit and caches it
//! by module key together with the artifact checksum.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::module::loader::checksum::compute_checksum;
use crate::module::loader::factory::ModuleFactoryTable;
use crate::module::loader::script::ScriptModule;
use crate::module::registry::manifest::{ModuleManifest, ModuleRuntime, MANIFEST_FILE_NAME};
use crate::module::sandbox::Sandbox;
use crate::module::traits::{Module, ModuleError, ModuleHooks, ModuleKey};
use crate::module::validation::{ManifestValidator, ValidationResult};
use crate::utils::current_timestamp;

/// A verified, constructed module instance
pub struct LoadedModule {
    pub key: ModuleKey,
    pub manifest: ModuleManifest,
    /// Artifact checksum at load time
    pub checksum: String,
    pub artifact_path: PathBuf,
    pub instance: Arc<dyn Module>,
    pub instance_id: Uuid,
    pub loaded_at: u64,
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("key", &self.key)
            .field("version", &self.manifest.version)
            .field("checksum", &self.checksum)
            .field("artifact_path", &self.artifact_path)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

/// Module loader for loading and verifying modules
pub struct ModuleLoader {
    factories: ModuleFactoryTable,
    sandbox: Arc<Sandbox>,
    validator: ManifestValidator,
    cache: Mutex<HashMap<ModuleKey, Arc<LoadedModule>>>,
}

impl ModuleLoader {
    pub fn new(factories: ModuleFactoryTable, sandbox: Arc<Sandbox>) -> Self {
        Self {
            factories,
            sandbox,
            validator: ManifestValidator::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Check that an artifact has a valid manifest, its entry point and the
    /// mandatory hooks; returns the parsed manifest
    pub fn validate_structure(&self, artifact_path: &Path) -> Result<ModuleManifest, ModuleError> {
        if !artifact_path.is_dir() {
            return Err(ModuleError::StructuralValidation(format!(
                "Artifact {:?} is not a directory",
                artifact_path
            )));
        }

        let manifest_path = artifact_path.join(MANIFEST_FILE_NAME);
        if !manifest_path.is_file() {
            return Err(ModuleError::StructuralValidation(format!(
                "Artifact {:?} has no {}",
                artifact_path, MANIFEST_FILE_NAME
            )));
        }

        let manifest = ModuleManifest::from_file(&manifest_path)
            .map_err(|e| ModuleError::StructuralValidation(e.to_string()))?;

        if let ValidationResult::Invalid(errors) = self.validator.validate(&manifest) {
            return Err(ModuleError::StructuralValidation(format!(
                "Manifest of {} is invalid: {}",
                manifest.name,
                errors.join("; ")
            )));
        }

        if !artifact_path.join(&manifest.entry_point).is_file() {
            return Err(ModuleError::StructuralValidation(format!(
                "Entry point {} of {} does not exist",
                manifest.entry_point, manifest.name
            )));
        }

        if let Some(preflight) = &manifest.preflight {
            if !artifact_path.join(preflight).is_file() {
                return Err(ModuleError::StructuralValidation(format!(
                    "Preflight script {} of {} does not exist",
                    preflight, manifest.name
                )));
            }
        }

        let (declared, _) = manifest.declared_hooks();
        let missing = declared.missing_mandatory();
        if !missing.is_empty() {
            return Err(ModuleError::InterfaceValidation {
                module: manifest.name.clone(),
                missing: missing.into_iter().map(String::from).collect(),
            });
        }

        Ok(manifest)
    }

    /// Load, verify and cache the module at `artifact_path`
    pub async fn load(
        &self,
        key: &ModuleKey,
        artifact_path: &Path,
    ) -> Result<Arc<LoadedModule>, ModuleError> {
        let checksum = checksum_of(artifact_path).await?;
        self.load_with_checksum(key, artifact_path, checksum).await
    }

    /// Return the cached unit when the artifact is byte-identical, otherwise
    /// evict it and load afresh
    pub async fn reload(
        &self,
        key: &ModuleKey,
        artifact_path: &Path,
    ) -> Result<Arc<LoadedModule>, ModuleError> {
        let checksum = checksum_of(artifact_path).await?;

        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(key) {
                if cached.checksum == checksum && cached.artifact_path == artifact_path {
                    debug!("Module {} unchanged ({}), keeping cached unit", key, checksum);
                    return Ok(cached.clone());
                }
            }
        }

        info!("Module {} changed, loading new unit", key);
        self.load_with_checksum(key, artifact_path, checksum).await
    }

    /// Drop the cached unit for `key`
    pub async fn unload(&self, key: &ModuleKey) -> Option<Arc<LoadedModule>> {
        let removed = self.cache.lock().await.remove(key);
        if removed.is_some() {
            debug!("Unloaded module {}", key);
        }
        removed
    }

    /// Put a previously loaded unit back into the cache
    pub async fn restore(&self, loaded: Arc<LoadedModule>) {
        self.cache.lock().await.insert(loaded.key.clone(), loaded);
    }

    pub async fn get(&self, key: &ModuleKey) -> Option<Arc<LoadedModule>> {
        self.cache.lock().await.get(key).cloned()
    }

    pub async fn cached_count(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub fn factories(&self) -> &ModuleFactoryTable {
        &self.factories
    }

    async fn load_with_checksum(
        &self,
        key: &ModuleKey,
        artifact_path: &Path,
        checksum: String,
    ) -> Result<Arc<LoadedModule>, ModuleError> {
        info!("Loading module {} from {:?}", key, artifact_path);

        let manifest = self.validate_structure(artifact_path)?;
        if manifest.name != key.name {
            return Err(ModuleError::StructuralValidation(format!(
                "Artifact {:?} contains module {}, expected {}",
                artifact_path, manifest.name, key.name
            )));
        }

        let instance = self.construct(key, &manifest, artifact_path).await?;

        let (declared, _) = manifest.declared_hooks();
        let provided = instance.hooks();
        let missing = (declared | ModuleHooks::MANDATORY).difference(provided);
        if !missing.is_empty() {
            return Err(ModuleError::InterfaceValidation {
                module: manifest.name.clone(),
                missing: missing.names().into_iter().map(String::from).collect(),
            });
        }

        if let Some(preflight) = &manifest.preflight {
            self.run_preflight(key, &artifact_path.join(preflight)).await?;
        }

        let loaded = Arc::new(LoadedModule {
            key: key.clone(),
            manifest,
            checksum,
            artifact_path: artifact_path.to_path_buf(),
            instance,
            instance_id: Uuid::new_v4(),
            loaded_at: current_timestamp(),
        });

        if let Some(previous) = self.cache.lock().await.insert(key.clone(), loaded.clone()) {
            debug!("Evicted previous unit {} of {}", previous.instance_id, key);
        }
        info!(
            "Loaded module {} v{} ({})",
            key, loaded.manifest.version, loaded.checksum
        );
        Ok(loaded)
    }

    async fn construct(
        &self,
        key: &ModuleKey,
        manifest: &ModuleManifest,
        artifact_path: &Path,
    ) -> Result<Arc<dyn Module>, ModuleError> {
        match manifest.runtime {
            ModuleRuntime::Native => self.factories.build(manifest),
            ModuleRuntime::Script => {
                let script = tokio::fs::read_to_string(artifact_path.join(&manifest.entry_point))
                    .await
                    .map_err(|e| {
                        ModuleError::StructuralValidation(format!(
                            "Cannot read entry point of {}: {}",
                            manifest.name, e
                        ))
                    })?;
                self.sandbox.prescan(&key.to_string(), &script)?;
                Ok(Arc::new(ScriptModule::new(
                    manifest.clone(),
                    script,
                    self.sandbox.clone(),
                )))
            }
        }
    }

    async fn run_preflight(&self, key: &ModuleKey, path: &Path) -> Result<(), ModuleError> {
        let code = tokio::fs::read_to_string(path).await?;
        let context = self.sandbox.create_context(&key.to_string(), None);
        let output = self
            .sandbox
            .execute(&context, &code, &HashMap::new())
            .await?;
        if !output.success() {
            warn!("Preflight of {} failed: {}", key, output.stderr.trim());
            return Err(ModuleError::StructuralValidation(format!(
                "Preflight of {} exited with status {}",
                key, output.exit_code
            )));
        }
        Ok(())
    }
}

pub(crate) async fn checksum_of(artifact_path: &Path) -> Result<String, ModuleError> {
    let path = artifact_path.to_path_buf();
    tokio::task::spawn_blocking(move || compute_checksum(&path))
        .await
        .map_err(|e| ModuleError::OperationError(format!("Checksum task failed: {}", e)))?
}
