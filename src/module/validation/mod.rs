//! Module validation framework
//!
//! Provides manifest and registry metadata validation.

pub mod manifest_validator;

pub use manifest_validator::{
    is_valid_version, missing_required_keys, ManifestValidator, ValidationResult,
};
