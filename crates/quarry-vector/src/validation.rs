//! Local checks run before any request leaves the process.

use crate::error::VectorStoreError;
use crate::vector_store::VectorPoint;

pub const MAX_COLLECTION_NAME_LEN: usize = 255;

/// Collection names are lowercase ASCII letters, digits, `_` and `-`.
///
/// # Errors
///
/// Returns [`VectorStoreError::Validation`] describing the first violation.
pub fn validate_collection_name(name: &str) -> Result<(), VectorStoreError> {
    if name.is_empty() {
        return Err(VectorStoreError::Validation(
            "collection name must not be empty".into(),
        ));
    }
    if name.len() > MAX_COLLECTION_NAME_LEN {
        return Err(VectorStoreError::Validation(format!(
            "collection name exceeds {MAX_COLLECTION_NAME_LEN} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
    {
        return Err(VectorStoreError::Validation(format!(
            "collection name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// Vectors must be non-empty, finite and, when `expected_dim` is known, of that length.
///
/// # Errors
///
/// Returns [`VectorStoreError::Validation`] on the first violation.
pub fn validate_vector(vector: &[f32], expected_dim: Option<usize>) -> Result<(), VectorStoreError> {
    if vector.is_empty() {
        return Err(VectorStoreError::Validation("vector must not be empty".into()));
    }
    if let Some(dim) = expected_dim
        && vector.len() != dim
    {
        return Err(VectorStoreError::Validation(format!(
            "vector dimension {} does not match collection dimension {dim}",
            vector.len()
        )));
    }
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(VectorStoreError::Validation(format!(
            "vector contains non-finite value at index {pos}"
        )));
    }
    Ok(())
}

/// # Errors
///
/// Returns [`VectorStoreError::Validation`] naming the offending point.
pub fn validate_points(points: &[VectorPoint], expected_dim: Option<usize>) -> Result<(), VectorStoreError> {
    let dim = expected_dim.or_else(|| points.first().map(|p| p.vector.len()));
    for p in points {
        if p.id.trim().is_empty() {
            return Err(VectorStoreError::Validation("point id must not be empty".into()));
        }
        validate_vector(&p.vector, dim)
            .map_err(|e| VectorStoreError::Validation(format!("point {}: {e}", p.id)))?;
    }
    Ok(())
}
