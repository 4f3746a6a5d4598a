//! Persisted module state
//!
//! One descriptor and one configuration blob exist per (tenant, module name).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::module::traits::{ModuleKey, ModuleStatus};

/// Key/value configuration blob
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Persisted record of a module installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Owning tenant
    pub tenant: String,
    /// Module name
    pub name: String,
    /// Installed version (semantic versioning)
    pub version: String,
    /// Lifecycle status
    pub status: ModuleStatus,
    /// Load-bearing modules may never be uninstalled
    #[serde(default)]
    pub is_system: bool,
    /// Artifact directory the module is loaded from
    pub artifact_path: PathBuf,
    /// JSON schema for the configuration blob
    #[serde(default)]
    pub config_schema: serde_json::Value,
    /// Defaults applied on install
    #[serde(default)]
    pub default_config: ConfigMap,
    /// Modules that must be installed for the same tenant first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Minimum compatible host version
    #[serde(default)]
    pub min_host_version: Option<String>,
    /// Maximum compatible host version
    #[serde(default)]
    pub max_host_version: Option<String>,
    pub installed_at: Option<u64>,
    pub activated_at: Option<u64>,
    pub last_used_at: Option<u64>,
    /// Message of the failure that moved the module to `error`
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ModuleDescriptor {
    pub fn key(&self) -> ModuleKey {
        ModuleKey::new(self.tenant.clone(), self.name.clone())
    }
}

/// Tenant-scoped configuration of an installed module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfiguration {
    pub tenant: String,
    pub name: String,
    pub data: ConfigMap,
    pub updated_at: u64,
}

/// Entry in a module's version history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub version: String,
    /// Artifact checksum at the time, when known
    pub checksum: Option<String>,
    pub recorded_at: u64,
}
