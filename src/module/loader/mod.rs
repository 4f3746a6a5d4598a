//! Module loading
//!
//! Artifact verification, content checksums and unit construction.

pub mod checksum;
pub mod factory;
#[allow(clippy::module_inception)]
pub mod loader;
pub mod script;

pub use checksum::compute_checksum;
pub use factory::{ModuleConstructor, ModuleFactoryTable};
pub use loader::{LoadedModule, ModuleLoader};
pub use script::ScriptModule;
