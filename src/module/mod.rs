//! Module runtime
//!
//! Discovers, loads, sandboxes, activates, hot-reloads and retires pluggable
//! modules on behalf of many tenants.
//!
//! ## Architecture
//!
//! - **Registry**: catalogue of module names and published versions; never runs code
//! - **Loader**: artifact verification, content checksums, unit construction
//! - **Sandbox**: one resource-limited OS process per execution of untrusted code
//! - **Manager**: lifecycle state machine, live instances, background tasks, health sweep

pub mod admin;
pub mod api;
pub mod descriptor;
pub mod loader;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod sandbox;
pub mod store;
pub mod tasks;
pub mod traits;
pub mod validation;

pub use admin::{AdminError, AdminResult, ModuleAdmin};
pub use api::{ProtocolClient, ProtocolClientFactory, ProtocolHub};
pub use descriptor::{ConfigMap, InstalledVersion, ModuleConfiguration, ModuleDescriptor};
pub use loader::{LoadedModule, ModuleFactoryTable, ModuleLoader};
pub use manager::{ModuleHealth, ModuleManager};
pub use registry::{ModuleRegistry, RegistryEntry, RegistryMetadata, VersionRecord};
pub use sandbox::{ResourceLimits, Sandbox, SandboxContext};
pub use store::{MemoryModuleStore, ModuleStore};
pub use tasks::BackgroundTasks;
pub use traits::{
    Capabilities, HealthStatus, Module, ModuleContext, ModuleError, ModuleHooks, ModuleKey,
    ModuleStatus,
};
