//! Manifest and metadata validation
//!
//! Validates module manifests and registry metadata for naming, version
//! grammar, dependency declarations and configuration schema shape.

use std::path::{Component, Path};
use tracing::{debug, warn};

use crate::module::descriptor::ConfigMap;
use crate::module::registry::catalogue::RegistryMetadata;
use crate::module::registry::manifest::ModuleManifest;

/// Validation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Manifest is valid
    Valid,
    /// Manifest is invalid with specific errors
    Invalid(Vec<String>),
}

impl ValidationResult {
    fn from_errors(errors: Vec<String>) -> Self {
        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid(errors)
        }
    }
}

/// Manifest validator
pub struct ManifestValidator {
    /// Maximum module name length
    max_name_len: usize,
}

impl ManifestValidator {
    /// Create a new manifest validator
    pub fn new() -> Self {
        Self { max_name_len: 64 }
    }

    /// Validate a module manifest
    pub fn validate(&self, manifest: &ModuleManifest) -> ValidationResult {
        let mut errors = Vec::new();

        if !self.is_valid_name(&manifest.name) {
            errors.push(format!(
                "Invalid module name: {} (must be alphanumeric with dashes/underscores)",
                manifest.name
            ));
        }

        if !is_valid_version(&manifest.version) {
            errors.push(format!(
                "Invalid version format: {} (expected major.minor.patch[-pre][+build])",
                manifest.version
            ));
        }

        if manifest.entry_point.is_empty() {
            errors.push("Entry point cannot be empty".to_string());
        } else if !stays_inside_artifact(&manifest.entry_point) {
            errors.push(format!(
                "Entry point must stay inside the artifact: {}",
                manifest.entry_point
            ));
        }

        if let Some(preflight) = &manifest.preflight {
            if preflight.is_empty() || !stays_inside_artifact(preflight) {
                errors.push(format!(
                    "Preflight script must stay inside the artifact: {}",
                    preflight
                ));
            }
        }

        let (_, unknown) = manifest.declared_hooks();
        for hook in unknown {
            errors.push(format!("Unknown lifecycle hook: {}", hook));
        }

        let result = ValidationResult::from_errors(errors);
        match &result {
            ValidationResult::Valid => {
                debug!("Manifest validation passed for module: {}", manifest.name)
            }
            ValidationResult::Invalid(errors) => warn!(
                "Manifest validation failed for module {}: {:?}",
                manifest.name, errors
            ),
        }
        result
    }

    /// Validate registry metadata, reporting every problem found
    pub fn validate_metadata(&self, name: &str, metadata: &RegistryMetadata) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.is_valid_name(name) {
            errors.push(format!(
                "Invalid module name: {} (must be alphanumeric with dashes/underscores)",
                name
            ));
        }

        let min = self.parse_bound("min_host_version", &metadata.min_host_version, &mut errors);
        let max = self.parse_bound("max_host_version", &metadata.max_host_version, &mut errors);
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                errors.push(format!(
                    "min_host_version {} is greater than max_host_version {}",
                    min, max
                ));
            }
        }

        for dep in &metadata.dependencies {
            if !self.is_valid_name(dep) {
                errors.push(format!("Invalid dependency name: {}", dep));
            }
            if dep == name {
                errors.push(format!("Module {} cannot depend on itself", name));
            }
        }

        match &metadata.config_schema {
            serde_json::Value::Null | serde_json::Value::Object(_) => {
                for key in missing_required_keys(&metadata.config_schema, &metadata.default_config) {
                    errors.push(format!(
                        "Default configuration is missing required key: {}",
                        key
                    ));
                }
            }
            _ => errors.push("Configuration schema must be a JSON object".to_string()),
        }

        errors
    }

    fn parse_bound(
        &self,
        field: &str,
        value: &Option<String>,
        errors: &mut Vec<String>,
    ) -> Option<semver::Version> {
        let value = value.as_deref()?;
        match semver::Version::parse(value) {
            Ok(v) => Some(v),
            Err(e) => {
                errors.push(format!("Invalid {}: {} ({})", field, value, e));
                None
            }
        }
    }

    /// Validate module name format
    #[inline]
    pub fn is_valid_name(&self, name: &str) -> bool {
        if name.is_empty() || name.len() > self.max_name_len {
            return false;
        }

        // Must start with alphanumeric
        if !name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
            return false;
        }

        name.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl Default for ManifestValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys listed in the schema's `required` array that `config` lacks
pub fn missing_required_keys(schema: &serde_json::Value, config: &ConfigMap) -> Vec<String> {
    schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|required| {
            required
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|key| !config.contains_key(*key))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Relative path with no `..`, root or drive components
fn stays_inside_artifact(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Validate version format: `major.minor.patch[-pre][+build]`
pub fn is_valid_version(version: &str) -> bool {
    semver::Version::parse(version).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manifest(name: &str, version: &str) -> ModuleManifest {
        ModuleManifest::parse(&format!(
            "name = \"{}\"\nversion = \"{}\"\nentry_point = \"main.mod\"\nhooks = [\"initialize\", \"cleanup\"]\n",
            name, version
        ))
        .unwrap()
    }

    #[test]
    fn test_valid_manifest() {
        let validator = ManifestValidator::new();
        assert_eq!(validator.validate(&manifest("billing", "1.0.0")), ValidationResult::Valid);
    }

    #[test]
    fn test_two_part_version_is_rejected() {
        let validator = ManifestValidator::new();
        assert!(matches!(
            validator.validate(&manifest("billing", "1.0")),
            ValidationResult::Invalid(_)
        ));
    }

    #[test]
    fn test_version_grammar() {
        assert!(is_valid_version("1.2.3"));
        assert!(is_valid_version("1.2.3-beta.1"));
        assert!(is_valid_version("1.2.3-rc.1+build.5"));
        assert!(!is_valid_version("1.2"));
        assert!(!is_valid_version("v1.2.3"));
        assert!(!is_valid_version("1.2.x"));
    }

    #[test]
    fn test_metadata_reports_every_problem() {
        let validator = ManifestValidator::new();
        let metadata = RegistryMetadata {
            min_host_version: Some("2.0.0".to_string()),
            max_host_version: Some("1.0.0".to_string()),
            dependencies: vec!["bad name".to_string()],
            config_schema: serde_json::json!({"required": ["currency"]}),
            ..RegistryMetadata::default()
        };

        let errors = validator.validate_metadata("billing", &metadata);
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }

    #[test]
    fn test_metadata_rejects_non_object_schema() {
        let validator = ManifestValidator::new();
        let metadata = RegistryMetadata {
            config_schema: serde_json::json!(["not", "an", "object"]),
            ..RegistryMetadata::default()
        };
        let errors = validator.validate_metadata("billing", &metadata);
        assert_eq!(errors, vec!["Configuration schema must be a JSON object".to_string()]);
    }

    #[test]
    fn test_artifact_paths_must_stay_inside() {
        let validator = ManifestValidator::new();
        let with_paths = |entry_point: &str, preflight: Option<&str>| {
            let mut m = manifest("billing", "1.0.0");
            m.entry_point = entry_point.to_string();
            m.preflight = preflight.map(String::from);
            validator.validate(&m)
        };

        assert_eq!(with_paths("bin/main.mod", Some("./check.sh")), ValidationResult::Valid);
        assert_eq!(with_paths("main..mod", None), ValidationResult::Valid);
        for escaping in ["../outside.sh", "/usr/bin/id", "bin/../../x.sh", ""] {
            match with_paths("main.mod", Some(escaping)) {
                ValidationResult::Invalid(errors) => {
                    assert!(errors[0].starts_with("Preflight script"), "{:?}", errors)
                }
                ValidationResult::Valid => panic!("{:?} was accepted", escaping),
            }
        }
        assert!(matches!(
            with_paths("../main.mod", None),
            ValidationResult::Invalid(_)
        ));
    }

    proptest! {
        #[test]
        fn test_numeric_triples_are_valid(major in 0u32..1000, minor in 0u32..1000, patch in 0u32..1000) {
            let version = format!("{}.{}.{}", major, minor, patch);
            prop_assert!(is_valid_version(&version));
        }

        #[test]
        fn test_pairs_are_never_valid(major in 0u32..1000, minor in 0u32..1000) {
            let version = format!("{}.{}", major, minor);
            prop_assert!(!is_valid_version(&version));
        }
    }
}
