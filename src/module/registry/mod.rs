//! Module registry and discovery
//!
//! Catalogue of known modules, artifact manifest parsing, filesystem discovery
//! and dependency ordering.

pub mod catalogue;
pub mod dependencies;
pub mod discovery;
pub mod manifest;

pub use catalogue::{ModuleRegistry, RegistryEntry, RegistryMetadata, VersionRecord};
pub use dependencies::{DependencyResolution, ModuleDependencies};
pub use discovery::{DiscoveredModule, ModuleDiscovery};
pub use manifest::{ModuleManifest, ModuleRuntime, MANIFEST_FILE_NAME};
