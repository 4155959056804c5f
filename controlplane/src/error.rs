use axum::{Json, http::StatusCode, response::IntoResponse, response::Response};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Phase;

/// Store-level failure taxonomy. Mapped to HTTP exactly once, in
/// [`ApiError::into_response`]; background loops log and count instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} named '{name}' already exists")]
    NameConflict { kind: &'static str, name: String },

    #[error("{kind} {id} is being deleted")]
    PendingDeletion { kind: &'static str, id: Uuid },

    #[error("{kind} {id} cannot be deleted while phase is {phase}")]
    DeleteRefused {
        kind: &'static str,
        id: Uuid,
        phase: Phase,
    },

    #[error("stale resource version for {kind} {id}")]
    StaleVersion { kind: &'static str, id: Uuid },

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl StoreError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        StoreError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Machine-readable code surfaced to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Validation { .. } => "validation_failed",
            StoreError::NotFound { .. } => "not_found",
            StoreError::NameConflict { .. } => "name_conflict",
            StoreError::PendingDeletion { .. } => "resource_deleting",
            StoreError::DeleteRefused { .. } => "delete_refused",
            StoreError::StaleVersion { .. } => "stale_resource_version",
            StoreError::Transport(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            StoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::NameConflict { .. }
            | StoreError::PendingDeletion { .. }
            | StoreError::DeleteRefused { .. }
            | StoreError::StaleVersion { .. } => StatusCode::CONFLICT,
            StoreError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
}

pub fn is_foreign_key_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&tokio_postgres::error::SqlState::FOREIGN_KEY_VIOLATION)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Boundary wrapper giving every handler a uniform error response shape.
#[derive(Debug)]
pub struct ApiError(pub StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = ?self.0, "request failed");
        }
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        let cases = [
            (
                StoreError::validation("limit", "must be between 1 and 100"),
                StatusCode::BAD_REQUEST,
                "validation_failed",
            ),
            (
                StoreError::not_found("cluster", Uuid::nil()),
                StatusCode::NOT_FOUND,
                "not_found",
            ),
            (
                StoreError::NameConflict {
                    kind: "cluster",
                    name: "alpha".to_string(),
                },
                StatusCode::CONFLICT,
                "name_conflict",
            ),
            (
                StoreError::StaleVersion {
                    kind: "cluster",
                    id: Uuid::nil(),
                },
                StatusCode::CONFLICT,
                "stale_resource_version",
            ),
            (
                StoreError::DeleteRefused {
                    kind: "cluster",
                    id: Uuid::nil(),
                    phase: Phase::Ready,
                },
                StatusCode::CONFLICT,
                "delete_refused",
            ),
            (
                StoreError::Transport(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status(), status, "{err}");
            assert_eq!(err.code(), code, "{err}");
        }
    }
}
