//! Request idempotency: a client key binds a request-content hash to the
//! first recorded response.

use crate::models::StartRunRequest;
use service_core::error::AppError;
use sha2::{Digest, Sha256};

/// Stable hash of a run request body. The idempotency key itself is not part
/// of the hashed content, and serde_json's map keys are sorted, so two
/// semantically identical bodies hash identically.
pub fn request_hash(request: &StartRunRequest) -> Result<String, AppError> {
    let mut body = request.clone();
    body.idempotency_key = None;

    let value = serde_json::to_value(&body)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to hash request: {}", e)))?;
    let canonical = serde_json::to_string(&value)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to hash request: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
