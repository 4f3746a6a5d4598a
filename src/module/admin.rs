//! Administrative surface
//!
//! Thin facade for HTTP/CLI layers: every call maps onto one manager
//! operation and returns either the resulting descriptor or a structured error.

use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

use crate::module::descriptor::{ConfigMap, ModuleDescriptor};
use crate::module::manager::{ModuleHealth, ModuleManager};
use crate::module::registry::DiscoveredModule;
use crate::module::traits::ModuleError;

/// Structured error returned to administrative callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminError {
    /// Stable identifier, see [`ModuleError::kind`]
    pub kind: String,
    pub message: String,
}

impl AdminError {
    /// HTTP status a web layer should answer with
    pub fn status_code(&self) -> u16 {
        match self.kind.as_str() {
            "module_not_found" => 404,
            "system_module_protected" => 403,
            "lifecycle_state" => 409,
            "structural_validation"
            | "interface_validation"
            | "version_incompatible"
            | "dependency_missing"
            | "invalid_manifest"
            | "invalid_configuration"
            | "security_violation" => 422,
            "timeout" => 504,
            _ => 500,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
            }
        })
    }
}

impl From<ModuleError> for AdminError {
    fn from(e: ModuleError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl fmt::Display for AdminError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for AdminError {}

/// Result type for administrative operations
pub type AdminResult<T> = Result<T, AdminError>;

/// Administrative operations over a shared manager
#[derive(Clone)]
pub struct ModuleAdmin {
    manager: Arc<ModuleManager>,
}

impl ModuleAdmin {
    pub fn new(manager: Arc<ModuleManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ModuleManager> {
        &self.manager
    }

    pub async fn install(
        &self,
        tenant: &str,
        module: &str,
        version: Option<&str>,
        config: Option<ConfigMap>,
    ) -> AdminResult<ModuleDescriptor> {
        Ok(self.manager.install(tenant, module, version, config).await?)
    }

    pub async fn activate(&self, tenant: &str, module: &str) -> AdminResult<ModuleDescriptor> {
        Ok(self.manager.activate(tenant, module).await?)
    }

    pub async fn deactivate(&self, tenant: &str, module: &str) -> AdminResult<ModuleDescriptor> {
        Ok(self.manager.deactivate(tenant, module).await?)
    }

    pub async fn reload(&self, tenant: &str, module: &str) -> AdminResult<ModuleDescriptor> {
        Ok(self.manager.reload(tenant, module).await?)
    }

    /// Returns the descriptor as it was before removal
    pub async fn uninstall(&self, tenant: &str, module: &str) -> AdminResult<ModuleDescriptor> {
        let before = self.manager.get_descriptor(tenant, module).await?;
        self.manager.uninstall(tenant, module).await?;
        before.ok_or_else(|| {
            ModuleError::ModuleNotFound(format!("{}/{}", tenant, module)).into()
        })
    }

    pub async fn update_configuration(
        &self,
        tenant: &str,
        module: &str,
        config: ConfigMap,
    ) -> AdminResult<ModuleDescriptor> {
        Ok(self
            .manager
            .update_configuration(tenant, module, config)
            .await?)
    }

    pub async fn reset(&self, tenant: &str, module: &str) -> AdminResult<ModuleDescriptor> {
        Ok(self.manager.reset(tenant, module).await?)
    }

    pub async fn get_health(&self, tenant: &str, module: &str) -> AdminResult<ModuleHealth> {
        Ok(self.manager.get_health(tenant, module).await?)
    }

    pub async fn discover(&self) -> AdminResult<Vec<DiscoveredModule>> {
        Ok(self.manager.discover().await?)
    }

    pub async fn list(&self, tenant: &str) -> AdminResult<Vec<ModuleDescriptor>> {
        Ok(self.manager.list_modules(tenant).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::module::api::ProtocolHub;
    use crate::module::loader::ModuleFactoryTable;
    use crate::module::registry::ModuleRegistry;
    use crate::module::traits::{ModuleKey, ModuleStatus};

    #[test]
    fn test_error_body_carries_kind_and_status() {
        let err: AdminError = ModuleError::SystemModuleProtected("acme/auth".to_string()).into();
        assert_eq!(err.kind, "system_module_protected");
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.to_json()["error"]["kind"], "system_module_protected");

        let key = ModuleKey::new("acme", "billing");
        let err: AdminError = ModuleError::lifecycle(&key, "activate", ModuleStatus::Active).into();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_unknown_module_errors() {
        let manager = ModuleManager::with_config(
            RuntimeConfig::default(),
            Arc::new(ModuleRegistry::new()),
            ModuleFactoryTable::new(),
            Arc::new(ProtocolHub::new()),
        )
        .unwrap();
        let admin = ModuleAdmin::new(Arc::new(manager));

        let err = admin.activate("acme", "billing").await.unwrap_err();
        assert_eq!(err.kind, "lifecycle_state");
        assert_eq!(err.status_code(), 409);

        let err = admin.get_health("acme", "billing").await.unwrap_err();
        assert_eq!(err.kind, "module_not_found");
        assert_eq!(err.status_code(), 404);

        let err = admin.install("acme", "billing", None, None).await.unwrap_err();
        assert_eq!(err.kind, "module_not_found");
    }
}
