//! Module runtime for multi-tenant hosts
//!
//! Loads pluggable modules from on-disk artifacts, runs their untrusted code
//! inside a resource-limited sandbox and drives each (tenant, module) pair
//! through an explicit lifecycle state machine with checksum-driven hot reload.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//! use module_runtime::config::RuntimeConfig;
//! use module_runtime::module::store::open_store;
//! use module_runtime::module::{ModuleFactoryTable, ModuleManager, ModuleRegistry, ProtocolHub};
//!
//! # async fn run() -> Result<(), module_runtime::module::ModuleError> {
//! let config = RuntimeConfig::default();
//! let store = open_store(&config.store)?;
//! let registry = Arc::new(ModuleRegistry::open(store.clone()).await?);
//! let manager = Arc::new(ModuleManager::new(
//!     config,
//!     registry,
//!     ModuleFactoryTable::new(),
//!     store,
//!     Arc::new(ProtocolHub::new()),
//! )?);
//! manager.start_health_monitor().await;
//! manager.restore_active("acme").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod module;
pub mod utils;

pub use config::RuntimeConfig;
pub use module::{ModuleError, ModuleManager};
