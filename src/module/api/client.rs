//! Protocol-layer contract
//!
//! The runtime does not define a wire format; it only creates exactly one
//! client per live module instance and closes it when the instance goes away.

use async_trait::async_trait;
use std::sync::Arc;

use crate::module::traits::{Capabilities, Module, ModuleError, ModuleKey};

/// Client scoped to one (tenant, module) instance
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Installation this client belongs to
    fn key(&self) -> &ModuleKey;

    /// Unique identifier of this client
    fn client_id(&self) -> uuid::Uuid;

    /// Publish the tools, resources and prompts the module exposes
    async fn register_capabilities(&self, capabilities: Capabilities) -> Result<(), ModuleError>;

    /// Invoke a tool exposed by any module of the same tenant
    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ModuleError>;

    /// Withdraw everything this client registered; idempotent
    async fn close(&self) -> Result<(), ModuleError>;
}

/// Creates protocol clients for newly started instances
pub trait ProtocolClientFactory: Send + Sync {
    fn create_client(&self, key: &ModuleKey, instance: Arc<dyn Module>) -> Arc<dyn ProtocolClient>;
}
