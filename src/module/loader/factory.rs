//! Build-time module registration
//!
//! Native modules are linked into the host and registered here under a
//! factory name; an artifact's manifest selects one by name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::module::registry::manifest::ModuleManifest;
use crate::module::traits::{Module, ModuleError};

/// Constructs a fresh module instance from its manifest
pub type ModuleConstructor =
    Arc<dyn Fn(&ModuleManifest) -> Result<Arc<dyn Module>, ModuleError> + Send + Sync>;

/// Factory name → constructor
#[derive(Clone, Default)]
pub struct ModuleFactoryTable {
    factories: HashMap<String, ModuleConstructor>,
}

impl ModuleFactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor; a later registration under the same name wins
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&ModuleManifest) -> Result<Arc<dyn Module>, ModuleError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<F>(mut self, name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&ModuleManifest) -> Result<Arc<dyn Module>, ModuleError> + Send + Sync + 'static,
    {
        self.register(name, constructor);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct a new instance for `manifest`
    pub fn build(&self, manifest: &ModuleManifest) -> Result<Arc<dyn Module>, ModuleError> {
        let name = manifest.factory_name();
        let constructor = self.factories.get(name).ok_or_else(|| {
            ModuleError::StructuralValidation(format!(
                "No module factory registered under '{}' for {}",
                name, manifest.name
            ))
        })?;
        constructor(manifest)
    }
}

impl fmt::Debug for ModuleFactoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleFactoryTable")
            .field("factories", &self.names())
            .finish()
    }
}
