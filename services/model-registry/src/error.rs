//! Domain error taxonomy and its HTTP status mapping.
use std::collections::BTreeMap;
use thiserror::Error;

use crate::deployment::DeploymentStatus;
use crate::store::StoreError;

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("validation failed: {message}")]
    Validation { message: String, details: BTreeMap<String, String> },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Duplicate(String),
    #[error("illegal deployment transition {from} -> {to}")]
    InvalidTransition { from: DeploymentStatus, to: DeploymentStatus },
    #[error("concurrent modification of {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    pub fn validation(field: &str, problem: impl Into<String>) -> Self {
        let problem = problem.into();
        let mut details = BTreeMap::new();
        details.insert(field.to_string(), problem.clone());
        RegistryError::Validation { message: format!("{field}: {problem}"), details }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Validation { .. } => "ValidationError",
            RegistryError::Unauthorized(_) => "Unauthorized",
            RegistryError::NotFound(_) => "ResourceNotFound",
            RegistryError::Duplicate(_) => "DuplicateResource",
            RegistryError::InvalidTransition { .. } => "InvalidTransition",
            RegistryError::Conflict(_) => "Conflict",
            RegistryError::Internal(_) => "InternalError",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            RegistryError::Validation { .. } => 400,
            RegistryError::Unauthorized(_) => 403,
            RegistryError::NotFound(_) => 404,
            RegistryError::Duplicate(_) | RegistryError::InvalidTransition { .. } | RegistryError::Conflict(_) => 409,
            RegistryError::Internal(_) => 500,
        }
    }

    /// Hide existence of a resource from callers that may not see it.
    pub fn mask_as_not_found(self, what: &str) -> Self {
        match self {
            RegistryError::Unauthorized(_) => RegistryError::NotFound(what.to_string()),
            other => other,
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::PreconditionFailed(key) => RegistryError::Conflict(key),
            other => RegistryError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self { RegistryError::Internal(format!("codec: {e}")) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_masks_to_not_found() {
        let err = RegistryError::Unauthorized("team mismatch".into()).mask_as_not_found("model fraud-model@1.0.0");
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.kind(), "ResourceNotFound");
    }

    #[test]
    fn validation_carries_field_detail() {
        let err = RegistryError::validation("version", "expected major.minor.patch");
        match err {
            RegistryError::Validation { details, .. } => assert_eq!(details.get("version").map(String::as_str), Some("expected major.minor.patch")),
            _ => panic!("expected validation"),
        }
    }
}
