//! Module discovery
//!
//! Scans an artifacts directory and reports every module artifact found.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::module::loader::checksum::compute_checksum;
use crate::module::registry::manifest::{ModuleManifest, MANIFEST_FILE_NAME};
use crate::module::traits::ModuleError;
use crate::module::validation::{ManifestValidator, ValidationResult};

/// Discovered module information
#[derive(Debug, Clone)]
pub struct DiscoveredModule {
    /// Artifact directory path
    pub directory: PathBuf,
    /// Module manifest
    pub manifest: ModuleManifest,
    /// Content checksum of the artifact
    pub checksum: String,
}

/// Module discovery scanner
pub struct ModuleDiscovery {
    /// Base directory to scan for module artifacts
    artifacts_dir: PathBuf,
}

impl ModuleDiscovery {
    /// Create a new module discovery scanner
    pub fn new<P: AsRef<Path>>(artifacts_dir: P) -> Self {
        Self {
            artifacts_dir: artifacts_dir.as_ref().to_path_buf(),
        }
    }

    /// Discover all module artifacts in the artifacts directory
    ///
    /// Artifacts with unreadable or invalid manifests are logged and skipped.
    /// Results are sorted by module name, then version.
    pub fn discover_modules(&self) -> Result<Vec<DiscoveredModule>, ModuleError> {
        info!("Discovering modules in {:?}", self.artifacts_dir);

        if !self.artifacts_dir.exists() {
            debug!("Artifacts directory does not exist: {:?}", self.artifacts_dir);
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.artifacts_dir).map_err(|e| {
            ModuleError::OperationError(format!("Failed to read artifacts directory: {}", e))
        })?;

        let validator = ManifestValidator::new();
        let mut modules = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| {
                ModuleError::OperationError(format!("Failed to read directory entry: {}", e))
            })?;

            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            match self.inspect(&path, &validator) {
                Ok(Some(module)) => modules.push(module),
                Ok(None) => {}
                Err(e) => warn!("Skipping artifact {:?}: {}", path, e),
            }
        }

        modules.sort_by(|a, b| {
            (a.manifest.name.as_str(), a.manifest.version.as_str())
                .cmp(&(b.manifest.name.as_str(), b.manifest.version.as_str()))
        });

        info!("Discovered {} modules", modules.len());
        Ok(modules)
    }

    /// Discover a specific artifact directory by name
    pub fn discover_module(&self, directory_name: &str) -> Result<DiscoveredModule, ModuleError> {
        let dir = self.artifacts_dir.join(directory_name);
        self.inspect(&dir, &ManifestValidator::new())?
            .ok_or_else(|| {
                ModuleError::ModuleNotFound(format!(
                    "Module {} not found (no {} in {:?})",
                    directory_name, MANIFEST_FILE_NAME, dir
                ))
            })
    }

    fn inspect(
        &self,
        dir: &Path,
        validator: &ManifestValidator,
    ) -> Result<Option<DiscoveredModule>, ModuleError> {
        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        if !manifest_path.exists() {
            debug!("No {} found in {:?}, skipping", MANIFEST_FILE_NAME, dir);
            return Ok(None);
        }

        let manifest = ModuleManifest::from_file(&manifest_path)?;
        if let ValidationResult::Invalid(errors) = validator.validate(&manifest) {
            return Err(ModuleError::InvalidManifest(errors.join("; ")));
        }

        let checksum = compute_checksum(dir)?;
        Ok(Some(DiscoveredModule {
            directory: dir.to_path_buf(),
            manifest,
            checksum,
        }))
    }
}
