//! Artifact content checksum
//!
//! SHA-256 over every file of an artifact. Files are sorted by relative path
//! before hashing so the digest does not depend on directory-walk order.
//! Paths are hashed as their raw OS bytes. Symbolic links are refused: their
//! target could change without the artifact changing.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::module::registry::manifest::MANIFEST_FILE_NAME;
use crate::module::traits::ModuleError;

/// Compute the hex-encoded checksum of an artifact directory
///
/// Every non-manifest file contributes its relative path and content, each
/// length-prefixed, in sorted path order; the manifest bytes come last.
pub fn compute_checksum(artifact_dir: &Path) -> Result<String, ModuleError> {
    let manifest_path = artifact_dir.join(MANIFEST_FILE_NAME);
    let manifest = fs::read(&manifest_path).map_err(|e| {
        ModuleError::StructuralValidation(format!(
            "Cannot read manifest {:?}: {}",
            manifest_path, e
        ))
    })?;

    let mut files = Vec::new();
    collect_files(artifact_dir, artifact_dir, &mut files)?;
    files.retain(|rel| rel.as_path() != Path::new(MANIFEST_FILE_NAME));
    files.sort();

    let mut hasher = Sha256::new();
    for rel in &files {
        let rel_bytes = rel.as_os_str().as_encoded_bytes();
        let content = fs::read(artifact_dir.join(rel))?;
        hasher.update((rel_bytes.len() as u64).to_le_bytes());
        hasher.update(rel_bytes);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }
    hasher.update((manifest.len() as u64).to_le_bytes());
    hasher.update(&manifest);

    Ok(hex::encode(hasher.finalize()))
}

/// Relative paths of all regular files under `dir`
///
/// Anything that is neither a directory nor a regular file is rejected.
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ModuleError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| ModuleError::OperationError(e.to_string()))?;
            out.push(rel.to_path_buf());
        } else if file_type.is_symlink() {
            return Err(ModuleError::StructuralValidation(format!(
                "Artifact contains a symbolic link: {:?}",
                path
            )));
        } else {
            return Err(ModuleError::StructuralValidation(format!(
                "Artifact contains a special file: {:?}",
                path
            )));
        }
    }
    Ok(())
}
