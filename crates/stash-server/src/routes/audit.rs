//! Audit query route, admin-only.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use stash_core::audit::{AuditEntry, AuditFilter};
use stash_core::auth::Actor;

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::state::AppState;

/// Routes nested under `/audit`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/query", post(query))
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    entries: Vec<AuditEntry>,
    total: u64,
    limit: u64,
}

async fn query(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    body: Bytes,
) -> Result<Json<QueryResponse>, ApiError> {
    if !ctx.principal.admin {
        return Err(if matches!(ctx.principal.actor, Actor::Public) {
            ApiError::Unauthorized
        } else {
            ApiError::Forbidden
        });
    }

    let filter: AuditFilter = if body.is_empty() {
        AuditFilter::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid filter: {e}")))?
    };

    let audit = state.audit.as_ref().ok_or(ApiError::NotFound)?;
    let (entries, total, limit) = audit.query(&filter).await?;
    Ok(Json(QueryResponse {
        entries,
        total,
        limit,
    }))
}
