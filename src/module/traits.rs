//! Module system traits and interfaces
//!
//! Defines the lifecycle contract every module implements, the context a module
//! receives on initialization, and the error taxonomy shared by the runtime.

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::module::api::ProtocolClient;
use crate::module::descriptor::ConfigMap;
use crate::module::sandbox::Sandbox;
use crate::module::tasks::BackgroundTasks;

/// Identity of a module installation: one per (tenant, module name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleKey {
    /// Owning tenant
    pub tenant: String,
    /// Module name (globally unique in the registry)
    pub name: String,
}

impl ModuleKey {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.name)
    }
}

/// Persisted lifecycle status of a module installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    /// Installed but not running
    Inactive,
    /// Install in progress
    Installing,
    /// Running with a live instance
    Active,
    /// A lifecycle operation failed
    Error,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleStatus::Inactive => "inactive",
            ModuleStatus::Installing => "installing",
            ModuleStatus::Active => "active",
            ModuleStatus::Error => "error",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// Lifecycle entry points a module exposes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModuleHooks: u32 {
        const INITIALIZE = 1 << 0;
        const CLEANUP = 1 << 1;
        const START_BACKGROUND_TASKS = 1 << 2;
        const STOP_BACKGROUND_TASKS = 1 << 3;
        const HEALTH_CHECK = 1 << 4;
        const ON_CONFIG_UPDATE = 1 << 5;
        const GET_CAPABILITIES = 1 << 6;
        const PREPARE_HANDOVER = 1 << 7;

        /// Hooks every module must provide
        const MANDATORY = Self::INITIALIZE.bits() | Self::CLEANUP.bits();
    }
}

const HOOK_NAMES: &[(ModuleHooks, &str)] = &[
    (ModuleHooks::INITIALIZE, "initialize"),
    (ModuleHooks::CLEANUP, "cleanup"),
    (ModuleHooks::START_BACKGROUND_TASKS, "start_background_tasks"),
    (ModuleHooks::STOP_BACKGROUND_TASKS, "stop_background_tasks"),
    (ModuleHooks::HEALTH_CHECK, "health_check"),
    (ModuleHooks::ON_CONFIG_UPDATE, "on_config_update"),
    (ModuleHooks::GET_CAPABILITIES, "get_capabilities"),
    (ModuleHooks::PREPARE_HANDOVER, "prepare_handover"),
];

impl ModuleHooks {
    /// Parse a hook name as written in a manifest
    pub fn from_hook_name(name: &str) -> Option<Self> {
        HOOK_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(hook, _)| *hook)
    }

    /// Names of every hook in this set, in declaration order
    pub fn names(&self) -> Vec<&'static str> {
        HOOK_NAMES
            .iter()
            .filter(|(hook, _)| self.contains(*hook))
            .map(|(_, n)| *n)
            .collect()
    }

    /// Mandatory hooks absent from this set
    pub fn missing_mandatory(&self) -> Vec<&'static str> {
        ModuleHooks::MANDATORY.difference(*self).names()
    }
}

/// Result of a module health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy(_))
    }
}

/// Capability surface a module exposes through the protocol layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub prompts: Vec<String>,
}

impl Capabilities {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.resources.is_empty() && self.prompts.is_empty()
    }
}

/// Module trait that all modules must implement
///
/// Instances are shared between the manager, the protocol layer and the health
/// sweep, so every hook takes `&self`; modules keep mutable state behind their
/// own locks. Optional hooks have no-op defaults and are only invoked when the
/// module lists them in [`Module::hooks`].
#[async_trait]
pub trait Module: Send + Sync {
    /// Lifecycle entry points this implementation provides
    fn hooks(&self) -> ModuleHooks;

    /// Prepare for operation with the tenant configuration and protocol client
    async fn initialize(&self, context: ModuleContext) -> Result<(), ModuleError>;

    /// Release everything acquired in `initialize`
    async fn cleanup(&self) -> Result<(), ModuleError>;

    /// Spawn long-running work into the manager-owned task set
    async fn start_background_tasks(&self, _tasks: &BackgroundTasks) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Called before the manager cancels the task set
    async fn stop_background_tasks(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthStatus, ModuleError> {
        Ok(HealthStatus::Healthy)
    }

    async fn on_config_update(&self, _config: &ConfigMap) -> Result<(), ModuleError> {
        Ok(())
    }

    fn get_capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Called on the outgoing instance before a hot swap
    async fn prepare_handover(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Handle a tool invocation routed by the protocol layer
    async fn invoke(
        &self,
        tool: &str,
        _arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ModuleError> {
        Err(ModuleError::OperationError(format!(
            "Tool {} is not handled by this module",
            tool
        )))
    }
}

/// Context provided to modules on initialization
#[derive(Clone)]
pub struct ModuleContext {
    /// Installation this instance serves
    pub key: ModuleKey,
    /// Unique identifier of this instance
    pub instance_id: uuid::Uuid,
    /// Current tenant configuration
    pub config: ConfigMap,
    /// Protocol client scoped to (tenant, module)
    pub client: Arc<dyn ProtocolClient>,
    /// Scratch directory owned by this installation
    pub data_dir: PathBuf,
    /// Sandbox for running untrusted code on behalf of the module
    pub sandbox: Arc<Sandbox>,
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("key", &self.key)
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl ModuleContext {
    /// Get a configuration value
    pub fn get_config(&self, key: &str) -> Option<&serde_json::Value> {
        self.config.get(key)
    }

    /// Get a string configuration value with default
    pub fn get_config_or(&self, key: &str, default: &str) -> String {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or(default)
            .to_string()
    }
}

/// Module system errors
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Structural validation failed: {0}")]
    StructuralValidation(String),

    #[error("Module {module} is missing mandatory entry points: {}", missing.join(", "))]
    InterfaceValidation { module: String, missing: Vec<String> },

    #[error("Module version incompatible: {0}")]
    VersionIncompatible(String),

    #[error("Security violation in {module}: blocked operation '{operation}'")]
    SecurityViolation { module: String, operation: String },

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("Module {0} is a system module and cannot be uninstalled")]
    SystemModuleProtected(String),

    #[error("Cannot {operation} module {module} while it is {status}")]
    LifecycleState {
        module: String,
        operation: String,
        status: String,
    },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Module dependency missing: {0}")]
    DependencyMissing(String),

    #[error("Invalid module manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid module configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Module initialization failed: {0}")]
    InitializationError(String),

    #[error("Module operation failed: {0}")]
    OperationError(String),

    #[error("Sandbox execution terminated: {0}")]
    Terminated(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timeout waiting for module response")]
    Timeout,
}

impl ModuleError {
    /// Stable identifier for structured error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            ModuleError::StructuralValidation(_) => "structural_validation",
            ModuleError::InterfaceValidation { .. } => "interface_validation",
            ModuleError::VersionIncompatible(_) => "version_incompatible",
            ModuleError::SecurityViolation { .. } => "security_violation",
            ModuleError::ResourceLimitExceeded(_) => "resource_limit_exceeded",
            ModuleError::SystemModuleProtected(_) => "system_module_protected",
            ModuleError::LifecycleState { .. } => "lifecycle_state",
            ModuleError::ModuleNotFound(_) => "module_not_found",
            ModuleError::DependencyMissing(_) => "dependency_missing",
            ModuleError::InvalidManifest(_) => "invalid_manifest",
            ModuleError::InvalidConfiguration(_) => "invalid_configuration",
            ModuleError::InitializationError(_) => "initialization_error",
            ModuleError::OperationError(_) => "operation_error",
            ModuleError::Terminated(_) => "terminated",
            ModuleError::Storage(_) => "storage",
            ModuleError::SerializationError(_) => "serialization",
            ModuleError::Timeout => "timeout",
        }
    }

    pub(crate) fn lifecycle(key: &ModuleKey, operation: &str, status: ModuleStatus) -> Self {
        ModuleError::LifecycleState {
            module: key.to_string(),
            operation: operation.to_string(),
            status: status.to_string(),
        }
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(e: serde_json::Error) -> Self {
        ModuleError::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for ModuleError {
    fn from(e: toml::de::Error) -> Self {
        ModuleError::InvalidManifest(e.to_string())
    }
}

impl From<std::io::Error> for ModuleError {
    fn from(e: std::io::Error) -> Self {
        ModuleError::OperationError(e.to_string())
    }
}

impl From<anyhow::Error> for ModuleError {
    fn from(e: anyhow::Error) -> Self {
        ModuleError::OperationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_names_round_trip_through_manifest_spelling() {
        assert_eq!(
            ModuleHooks::from_hook_name("prepare_handover"),
            Some(ModuleHooks::PREPARE_HANDOVER)
        );
        assert_eq!(ModuleHooks::from_hook_name("teardown"), None);

        // Manifest spelling is lowercase; constant names stay with bitflags
        assert_eq!(ModuleHooks::from_hook_name("INITIALIZE"), None);
        assert_eq!(
            ModuleHooks::from_name("INITIALIZE"),
            Some(ModuleHooks::INITIALIZE)
        );

        let hooks = ModuleHooks::INITIALIZE | ModuleHooks::HEALTH_CHECK;
        assert_eq!(hooks.names(), vec!["initialize", "health_check"]);
    }

    #[test]
    fn test_missing_mandatory_lists_every_absent_hook() {
        assert_eq!(
            ModuleHooks::HEALTH_CHECK.missing_mandatory(),
            vec!["initialize", "cleanup"]
        );
        assert!(ModuleHooks::MANDATORY.missing_mandatory().is_empty());
    }

    #[test]
    fn test_lifecycle_error_message() {
        let key = ModuleKey::new("acme", "billing");
        let err = ModuleError::lifecycle(&key, "activate", ModuleStatus::Active);
        assert_eq!(err.kind(), "lifecycle_state");
        assert_eq!(
            err.to_string(),
            "Cannot activate module acme/billing while it is active"
        );
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ModuleStatus::Installing).unwrap();
        assert_eq!(json, "\"installing\"");
    }
}
