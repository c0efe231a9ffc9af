use fleetmend_core::{CellId, CoreError, ServiceVersion};
use std::collections::HashMap;
use thiserror::Error;

/// Control plane specific errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlPlaneError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(
        "Relocation to a stopped target is not supported by the compute fleet: \
         minimum compute version is {currently}, expected {expected}"
    )]
    NotSupportedComputeForRelocate {
        currently: ServiceVersion,
        expected: ServiceVersion,
    },
    #[error("{0}")]
    Forbidden(String),
    /// The operation was removed from the API and will not come back.
    #[error("{0}")]
    Gone(String),
    #[error("Cell {cell} is unreachable: {reason}")]
    PartitionUnavailable { cell: CellId, reason: String },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlPlaneError {
    pub fn status_code(&self) -> u16 {
        match self {
            ControlPlaneError::BadRequest(_) => 400,
            ControlPlaneError::Forbidden(_) => 403,
            ControlPlaneError::NotFound(_) => 404,
            ControlPlaneError::Conflict(_)
            | ControlPlaneError::NotSupportedComputeForRelocate { .. } => 409,
            ControlPlaneError::Gone(_) => 410,
            ControlPlaneError::Internal(_) => 500,
            ControlPlaneError::PartitionUnavailable { .. } => 503,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ControlPlaneError::BadRequest(_) => "BAD_REQUEST",
            ControlPlaneError::NotFound(_) => "NOT_FOUND",
            ControlPlaneError::Conflict(_) => "CONFLICT",
            ControlPlaneError::NotSupportedComputeForRelocate { .. } => {
                "NOT_SUPPORTED_COMPUTE_FOR_RELOCATE"
            }
            ControlPlaneError::Forbidden(_) => "FORBIDDEN",
            ControlPlaneError::Gone(_) => "GONE",
            ControlPlaneError::PartitionUnavailable { .. } => "PARTITION_UNAVAILABLE",
            ControlPlaneError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<CoreError> for ControlPlaneError {
    fn from(err: CoreError) -> Self {
        ControlPlaneError::BadRequest(err.to_string())
    }
}

impl From<ControlPlaneError> for fleetmend_core::ErrorResponse {
    fn from(err: ControlPlaneError) -> Self {
        let response =
            fleetmend_core::ErrorResponse::new(err.error_code(), err.to_string(), err.status_code());

        match err {
            ControlPlaneError::NotSupportedComputeForRelocate {
                currently,
                expected,
            } => {
                let mut details = HashMap::new();
                details.insert("currently".to_string(), currently.to_string());
                details.insert("expected".to_string(), expected.to_string());
                response.with_details(details)
            }
            ControlPlaneError::PartitionUnavailable { cell, .. } => {
                let mut details = HashMap::new();
                details.insert("cell".to_string(), cell.to_string());
                response.with_details(details)
            }
            _ => response,
        }
    }
}

pub type ControlPlaneResult<T> = std::result::Result<T, ControlPlaneError>;
