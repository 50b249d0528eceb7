//! HTTP error mapping.
//!
//! Domain errors from `stash-core` map onto one [`ApiError`] whose
//! `IntoResponse` produces a JSON body with a machine-readable `error`
//! field. Internal reasons are logged, never sent to the client.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use stash_core::{AuditError, AuthError, KvError, RevisionError};

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or invalid credentials (includes a denied public principal).
    Unauthorized,
    /// Valid credentials, denied by the ACL.
    Forbidden,
    /// Entity absent.
    NotFound,
    /// Optimistic-lock mismatch; carries the row's current version when
    /// known so the client can retry.
    Conflict {
        /// Current `updated_at`, epoch milliseconds.
        current_updated_at: Option<i64>,
    },
    /// Malformed input: bad key, unknown format, invalid filter.
    BadRequest(String),
    /// Storage or invariant failure. The reason stays in the log.
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_updated_at: Option<i64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message, current) = match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "authentication required".to_owned(),
                None,
            ),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                "forbidden",
                "permission denied".to_owned(),
                None,
            ),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                "not_found",
                "not found".to_owned(),
                None,
            ),
            Self::Conflict { current_updated_at } => (
                StatusCode::CONFLICT,
                "conflict",
                "the key changed since it was read".to_owned(),
                current_updated_at,
            ),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message, None),
            Self::Internal(reason) => {
                error!(reason, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_owned(),
                    None,
                )
            }
        };

        let body = ErrorBody {
            error: kind,
            message,
            current_updated_at: current,
        };
        (status, Json(body)).into_response()
    }
}

impl From<KvError> for ApiError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::NotFound { .. } => Self::NotFound,
            KvError::Conflict { .. } => Self::Conflict {
                current_updated_at: None,
            },
            KvError::SecretsDisabled { .. } | KvError::InvalidKey { .. } => {
                Self::BadRequest(err.to_string())
            }
            KvError::Storage(_) | KvError::Crypto(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => Self::Unauthorized,
            AuthError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::InvalidFilter { .. } => Self::BadRequest(err.to_string()),
            AuditError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<RevisionError> for ApiError {
    fn from(err: RevisionError) -> Self {
        match err {
            RevisionError::NotFound { .. } => Self::NotFound,
            RevisionError::InvalidKey { .. } => Self::BadRequest(err.to_string()),
            RevisionError::Git { .. } => Self::Internal(err.to_string()),
        }
    }
}
