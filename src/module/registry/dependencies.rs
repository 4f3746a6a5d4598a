//! Module dependency resolution
//!
//! Orders installed modules so that dependencies come before dependents.

use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

use crate::module::descriptor::ModuleDescriptor;
use crate::module::traits::ModuleError;

/// Dependency resolution result
#[derive(Debug, Clone)]
pub struct DependencyResolution {
    /// Modules in load order (dependencies first)
    pub load_order: Vec<String>,
    /// Module dependencies map
    pub dependencies: HashMap<String, Vec<String>>,
}

/// Dependency resolver
pub struct ModuleDependencies;

impl ModuleDependencies {
    /// Resolve load order for a set of descriptors
    ///
    /// Dependencies outside the set are reported as missing; cycles are rejected.
    pub fn resolve(descriptors: &[ModuleDescriptor]) -> Result<DependencyResolution, ModuleError> {
        let known: HashMap<&str, &ModuleDescriptor> =
            descriptors.iter().map(|d| (d.name.as_str(), d)).collect();

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut missing = Vec::new();

        for descriptor in descriptors {
            for dep in &descriptor.dependencies {
                if !known.contains_key(dep.as_str()) {
                    missing.push(format!("{} (required by {})", dep, descriptor.name));
                }
            }
            dependencies.insert(descriptor.name.clone(), descriptor.dependencies.clone());
        }

        if !missing.is_empty() {
            return Err(ModuleError::DependencyMissing(format!(
                "Missing dependencies: {}",
                missing.join(", ")
            )));
        }

        let load_order = Self::topological_sort(&dependencies).map_err(|e| {
            ModuleError::DependencyMissing(format!("Circular dependency detected: {}", e))
        })?;

        debug!("Dependency resolution complete: {:?}", load_order);

        Ok(DependencyResolution {
            load_order,
            dependencies,
        })
    }

    /// Kahn's algorithm; ties are broken by name so the order is deterministic
    fn topological_sort(dependencies: &HashMap<String, Vec<String>>) -> Result<Vec<String>, String> {
        let mut in_degree: BTreeMap<&str, usize> =
            dependencies.keys().map(|m| (m.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (module, deps) in dependencies {
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(module.as_str());
                if let Some(degree) = in_degree.get_mut(module.as_str()) {
                    *degree += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(m, _)| *m)
            .collect();

        let mut result = Vec::with_capacity(dependencies.len());
        while let Some(module) = queue.pop_front() {
            result.push(module.to_string());

            let mut ready = Vec::new();
            if let Some(children) = dependents.get(module) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(*child);
                        }
                    }
                }
            }
            ready.sort_unstable();
            queue.extend(ready);
        }

        if result.len() != dependencies.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(m, _)| *m)
                .collect();
            return Err(stuck.join(", "));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::traits::ModuleStatus;

    fn descriptor(name: &str, deps: &[&str]) -> ModuleDescriptor {
        ModuleDescriptor {
            tenant: "acme".to_string(),
            name: name.to_string(),
            version: "1.0.0".to_string(),
            status: ModuleStatus::Active,
            is_system: false,
            artifact_path: Default::default(),
            config_schema: serde_json::Value::Null,
            default_config: Default::default(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            min_host_version: None,
            max_host_version: None,
            installed_at: None,
            activated_at: None,
            last_used_at: None,
            last_error: None,
        }
    }

    #[test]
    fn test_dependencies_load_first() {
        let resolution = ModuleDependencies::resolve(&[
            descriptor("reports", &["billing", "crm"]),
            descriptor("billing", &["crm"]),
            descriptor("crm", &[]),
        ])
        .unwrap();
        assert_eq!(resolution.load_order, vec!["crm", "billing", "reports"]);
    }

    #[test]
    fn test_missing_dependency() {
        let err = ModuleDependencies::resolve(&[descriptor("billing", &["ledger"])]).unwrap_err();
        assert!(matches!(err, ModuleError::DependencyMissing(_)));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = ModuleDependencies::resolve(&[
            descriptor("a", &["b"]),
            descriptor("b", &["a"]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }
}
