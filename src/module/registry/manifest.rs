//! Module manifest parsing
//!
//! Handles parsing `module.toml` manifests found at the root of an artifact.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::module::traits::{Capabilities, ModuleError, ModuleHooks};

/// File name of the manifest inside an artifact directory
pub const MANIFEST_FILE_NAME: &str = "module.toml";

/// How the executable unit is constructed from the entry point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleRuntime {
    /// Linked into the host and looked up in the factory table
    #[default]
    Native,
    /// Entry point is a script executed inside the sandbox
    Script,
}

/// Module manifest (module.toml structure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Module name
    pub name: String,
    /// Module version (semantic versioning)
    pub version: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Module author
    pub author: Option<String>,
    /// Entry point file, relative to the artifact directory
    pub entry_point: String,
    #[serde(default)]
    pub runtime: ModuleRuntime,
    /// Factory table key for native modules (defaults to the module name)
    #[serde(default)]
    pub factory: Option<String>,
    /// Declared lifecycle hooks
    #[serde(default)]
    pub hooks: Vec<String>,
    /// Optional script run inside the sandbox at load time
    #[serde(default)]
    pub preflight: Option<String>,
    /// Declared capability surface
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl ModuleManifest {
    /// Load manifest from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ModuleError::InvalidManifest(format!("Failed to read manifest file: {}", e))
        })?;
        Self::parse(&contents)
    }

    /// Parse manifest TOML
    pub fn parse(contents: &str) -> Result<Self, ModuleError> {
        let manifest: ModuleManifest = toml::from_str(contents).map_err(|e| {
            ModuleError::InvalidManifest(format!("Failed to parse manifest TOML: {}", e))
        })?;

        if manifest.name.is_empty() {
            return Err(ModuleError::InvalidManifest(
                "Module name cannot be empty".to_string(),
            ));
        }
        if manifest.entry_point.is_empty() {
            return Err(ModuleError::InvalidManifest(
                "Entry point cannot be empty".to_string(),
            ));
        }

        Ok(manifest)
    }

    /// Factory table key for native modules
    pub fn factory_name(&self) -> &str {
        self.factory.as_deref().unwrap_or(&self.name)
    }

    /// Declared hooks as a set; unknown names are returned separately
    pub fn declared_hooks(&self) -> (ModuleHooks, Vec<String>) {
        let mut hooks = ModuleHooks::empty();
        let mut unknown = Vec::new();
        for name in &self.hooks {
            match ModuleHooks::from_hook_name(name) {
                Some(hook) => hooks |= hook,
                None => unknown.push(name.clone()),
            }
        }
        (hooks, unknown)
    }
}
