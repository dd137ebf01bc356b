//! Storage key derivation for uploaded artifacts.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid storage key input: {0}")]
pub struct InvalidKeyInput(pub &'static str);

/// Derive the canonical object-storage key for an artifact:
/// `/{service}/{version}/{filename}`.
///
/// Pure and deterministic: identical inputs always yield the identical key.
/// No character normalization is applied, so two uploads of a file with the
/// same name to the same service and version overwrite each other in the
/// bucket. That overwrite is intentional and relied upon by callers.
pub fn derive_storage_key(
    service_name: &str,
    version: &str,
    original_filename: &str,
) -> Result<String, InvalidKeyInput> {
    if service_name.trim().is_empty() {
        return Err(InvalidKeyInput("service name must be non-empty"));
    }
    if version.trim().is_empty() {
        return Err(InvalidKeyInput("version must be non-empty"));
    }
    if original_filename.trim().is_empty() {
        return Err(InvalidKeyInput("filename must be non-empty"));
    }
    Ok(format!("/{service_name}/{version}/{original_filename}"))
}
