//! Module Communication Hub
//!
//! In-process protocol layer: keeps the capabilities each live instance
//! registered, routes tool invocations between modules of a tenant, and keeps
//! a bounded audit log.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::module::api::client::{ProtocolClient, ProtocolClientFactory};
use crate::module::traits::{Capabilities, Module, ModuleError, ModuleKey};
use crate::utils::current_timestamp;

const DEFAULT_MAX_AUDIT_ENTRIES: usize = 1000;

/// Audit entry for tracking tool invocations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    /// Calling module (`tenant/name`), or `external` for host calls
    pub caller: String,
    /// Resolved target (`tenant/name`)
    pub target: String,
    pub tool: String,
    pub timestamp: u64,
    pub success: bool,
}

struct Registration {
    client_id: Uuid,
    capabilities: Capabilities,
    instance: Arc<dyn Module>,
}

struct HubInner {
    registrations: RwLock<HashMap<ModuleKey, Registration>>,
    audit_log: Mutex<VecDeque<AuditEntry>>,
    max_audit_entries: usize,
}

/// API hub shared by every protocol client it creates
#[derive(Clone)]
pub struct ProtocolHub {
    inner: Arc<HubInner>,
}

impl ProtocolHub {
    pub fn new() -> Self {
        Self::with_audit_capacity(DEFAULT_MAX_AUDIT_ENTRIES)
    }

    pub fn with_audit_capacity(max_audit_entries: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registrations: RwLock::new(HashMap::new()),
                audit_log: Mutex::new(VecDeque::new()),
                max_audit_entries,
            }),
        }
    }

    /// Capabilities currently registered by `key`
    pub async fn capabilities(&self, key: &ModuleKey) -> Option<Capabilities> {
        self.inner
            .registrations
            .read()
            .await
            .get(key)
            .map(|r| r.capabilities.clone())
    }

    /// Client currently holding the registration for `key`
    pub async fn registered_client(&self, key: &ModuleKey) -> Option<Uuid> {
        self.inner
            .registrations
            .read()
            .await
            .get(key)
            .map(|r| r.client_id)
    }

    /// Every tool registered for `tenant`, qualified as `module:tool`
    pub async fn tools(&self, tenant: &str) -> Vec<String> {
        let mut tools: Vec<String> = self
            .inner
            .registrations
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.tenant == tenant)
            .flat_map(|(key, r)| {
                r.capabilities
                    .tools
                    .iter()
                    .map(move |tool| format!("{}:{}", key.name, tool))
            })
            .collect();
        tools.sort();
        tools
    }

    /// Route a tool invocation within `tenant`
    ///
    /// `name` is either `module:tool` or a bare tool name that exactly one
    /// module of the tenant registered.
    pub async fn invoke(
        &self,
        caller: &str,
        tenant: &str,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ModuleError> {
        let (target, tool, instance) = self.resolve(tenant, name).await?;
        debug!("Hub routing {} from {} to {}", tool, caller, target);

        let result = instance.invoke(&tool, arguments).await;
        self.log_audit(caller, &target.to_string(), &tool, result.is_ok())
            .await;
        result
    }

    /// Recent audit entries, oldest first
    pub async fn get_audit_log(&self, limit: usize) -> Vec<AuditEntry> {
        let log = self.inner.audit_log.lock().await;
        let start = log.len().saturating_sub(limit);
        log.range(start..).cloned().collect()
    }

    async fn resolve(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<(ModuleKey, String, Arc<dyn Module>), ModuleError> {
        let registrations = self.inner.registrations.read().await;

        if let Some((module, tool)) = name.split_once(':') {
            let key = ModuleKey::new(tenant, module);
            return match registrations.get(&key) {
                Some(r) if r.capabilities.tools.iter().any(|t| t == tool) => {
                    Ok((key, tool.to_string(), r.instance.clone()))
                }
                _ => Err(ModuleError::ModuleNotFound(format!(
                    "No tool {} registered by {}",
                    tool, key
                ))),
            };
        }

        let mut matches = registrations
            .iter()
            .filter(|(key, r)| key.tenant == tenant && r.capabilities.tools.iter().any(|t| t == name));
        match (matches.next(), matches.next()) {
            (Some((key, r)), None) => Ok((key.clone(), name.to_string(), r.instance.clone())),
            (None, _) => Err(ModuleError::ModuleNotFound(format!(
                "No tool {} registered for tenant {}",
                name, tenant
            ))),
            (Some(_), Some(_)) => Err(ModuleError::OperationError(format!(
                "Tool {} is registered by several modules; qualify it as module:tool",
                name
            ))),
        }
    }

    async fn register(
        &self,
        key: &ModuleKey,
        client_id: Uuid,
        capabilities: Capabilities,
        instance: Arc<dyn Module>,
    ) {
        info!(
            "Module {} registered {} tools, {} resources, {} prompts",
            key,
            capabilities.tools.len(),
            capabilities.resources.len(),
            capabilities.prompts.len()
        );
        self.inner.registrations.write().await.insert(
            key.clone(),
            Registration {
                client_id,
                capabilities,
                instance,
            },
        );
    }

    /// Drop the registration only if `client_id` still owns it
    async fn unregister(&self, key: &ModuleKey, client_id: Uuid) {
        let mut registrations = self.inner.registrations.write().await;
        if registrations.get(key).map(|r| r.client_id) == Some(client_id) {
            registrations.remove(key);
            debug!("Removed hub registration of {}", key);
        }
    }

    async fn log_audit(&self, caller: &str, target: &str, tool: &str, success: bool) {
        let mut log = self.inner.audit_log.lock().await;
        log.push_back(AuditEntry {
            caller: caller.to_string(),
            target: target.to_string(),
            tool: tool.to_string(),
            timestamp: current_timestamp(),
            success,
        });
        while log.len() > self.inner.max_audit_entries {
            log.pop_front();
        }
    }
}

impl Default for ProtocolHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolClientFactory for ProtocolHub {
    fn create_client(&self, key: &ModuleKey, instance: Arc<dyn Module>) -> Arc<dyn ProtocolClient> {
        Arc::new(HubClient {
            key: key.clone(),
            client_id: Uuid::new_v4(),
            hub: self.clone(),
            instance: Arc::downgrade(&instance),
            closed: AtomicBool::new(false),
        })
    }
}

/// Protocol client backed by a [`ProtocolHub`]
pub struct HubClient {
    key: ModuleKey,
    client_id: Uuid,
    hub: ProtocolHub,
    /// Weak so a module keeping its own client does not form a cycle
    instance: Weak<dyn Module>,
    closed: AtomicBool,
}

#[async_trait]
impl ProtocolClient for HubClient {
    fn key(&self) -> &ModuleKey {
        &self.key
    }

    fn client_id(&self) -> Uuid {
        self.client_id
    }

    async fn register_capabilities(&self, capabilities: Capabilities) -> Result<(), ModuleError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ModuleError::OperationError(format!(
                "Protocol client of {} is closed",
                self.key
            )));
        }
        let instance = self.instance.upgrade().ok_or_else(|| {
            ModuleError::OperationError(format!("Instance of {} no longer exists", self.key))
        })?;
        self.hub
            .register(&self.key, self.client_id, capabilities, instance)
            .await;
        Ok(())
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ModuleError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ModuleError::OperationError(format!(
                "Protocol client of {} is closed",
                self.key
            )));
        }
        self.hub
            .invoke(&self.key.to_string(), &self.key.tenant, name, arguments)
            .await
    }

    async fn close(&self) -> Result<(), ModuleError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hub.unregister(&self.key, self.client_id).await;
        }
        Ok(())
    }
}
